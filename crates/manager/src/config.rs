//! Configuration management
//!
//! Typed configuration with TOML persistence. Files on disk may be
//! partial: on load the parsed value is deep-extended with the built-in
//! defaults before deserialization, so new settings get their default
//! without touching existing config files.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use toml::Value;

/// Bus path -> logical port number, persisted across runs so the same
/// physical hub socket always yields the same number.
pub type PortMap = BTreeMap<String, u32>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemSettings,
    /// Folder whose content is copied onto every stick.
    #[serde(default = "Config::default_source_folder")]
    pub source_folder: String,
    /// Base directory under which per-port mount points are created.
    #[serde(default = "Config::default_mount_base")]
    pub mount_base: String,
    #[serde(default)]
    pub stick: StickSettings,
    #[serde(default)]
    pub port_map: PortMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Monitor poll interval in milliseconds.
    #[serde(default = "SystemSettings::default_update_interval")]
    pub update_interval_ms: u64,
    #[serde(default = "SystemSettings::default_log_level")]
    pub log_level: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: Self::default_update_interval(),
            log_level: Self::default_log_level(),
        }
    }
}

impl SystemSettings {
    fn default_update_interval() -> u64 {
        500
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Per-stick processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickSettings {
    /// Filesystem label applied when formatting or relabeling.
    #[serde(default = "StickSettings::default_label")]
    pub label: String,
    /// Format the stick as FAT32 before anything else.
    #[serde(default)]
    pub format_fat32: bool,
    /// Rewrite the filesystem label before mounting.
    #[serde(default)]
    pub update_label: bool,
    /// Use pmount/pumount instead of mount/umount.
    #[serde(default)]
    pub user_mount: bool,
    /// File names removed by the remove-named-files step.
    #[serde(default)]
    pub remove_files: Vec<String>,
    #[serde(default)]
    pub auto_run_steps: AutoRunSteps,
}

impl Default for StickSettings {
    fn default() -> Self {
        Self {
            label: Self::default_label(),
            format_fat32: false,
            update_label: false,
            user_mount: false,
            remove_files: Vec::new(),
            auto_run_steps: AutoRunSteps::default(),
        }
    }
}

impl StickSettings {
    fn default_label() -> String {
        "SUN".to_string()
    }
}

/// Which operate-phase steps run, in the fixed order
/// copy -> remove-meta -> remove-named.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoRunSteps {
    #[serde(default)]
    pub copy_files_to_me: bool,
    #[serde(default)]
    pub remove_all_meta_files: bool,
    #[serde(default)]
    pub remove_named_files: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system: SystemSettings::default(),
            source_folder: Self::default_source_folder(),
            mount_base: Self::default_mount_base(),
            stick: StickSettings::default(),
            port_map: PortMap::new(),
        }
    }
}

impl Config {
    fn default_source_folder() -> String {
        "~/myfiles".to_string()
    }

    fn default_mount_base() -> String {
        "~/ustick_copy".to_string()
    }

    /// Load configuration from the given path, or the default path.
    ///
    /// A missing file is created with defaults so the user has
    /// something to edit.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if !config_path.exists() {
            let config = Self::default();
            config.save(&config_path)?;
            tracing::info!(
                "No configuration found, created defaults at: {}",
                config_path.display()
            );
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut value: Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        // Fill settings the file does not carry with the defaults.
        let defaults =
            Value::try_from(Self::default()).context("Failed to encode default configuration")?;
        extend_values(&mut value, &defaults);

        let config: Config = value
            .try_into()
            .with_context(|| format!("Invalid configuration: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or fall back to defaults.
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Default configuration file path.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ustick-copy").join("config.toml")
        } else {
            PathBuf::from(".config/ustick-copy/config.toml")
        }
    }

    /// Tilde-expanded source folder.
    pub fn source_folder_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.source_folder).as_ref())
    }

    /// Tilde-expanded mount base.
    pub fn mount_base_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.mount_base).as_ref())
    }

    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.system.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.system.log_level,
                valid_levels.join(", ")
            ));
        }

        validate_label(&self.stick.label)?;

        if self.system.update_interval_ms == 0 {
            return Err(anyhow!("update_interval_ms must be greater than 0"));
        }

        Ok(())
    }
}

/// FAT labels: 2 to 11 characters.
pub fn validate_label(label: &str) -> Result<()> {
    let len = label.chars().count();
    if !(2..=11).contains(&len) {
        return Err(anyhow!(
            "Invalid label '{}': must be 2-11 characters",
            label
        ));
    }
    Ok(())
}

/// Deep merge of two TOML values: `b`'s values win on key conflicts,
/// recursing only where both sides are tables at that key.
pub fn merge_values(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Table(mut left), Value::Table(right)) => {
            for (key, right_value) in right {
                let merged = match left.remove(&key) {
                    Some(left_value) => merge_values(left_value, right_value),
                    None => right_value,
                };
                left.insert(key, merged);
            }
            Value::Table(left)
        }
        (_, b) => b,
    }
}

/// Deep extend: fills keys from `b` into `a` only where `a` has no
/// value, recursing where both sides are tables. A type mismatch at a
/// key is silently left alone.
pub fn extend_values(a: &mut Value, b: &Value) {
    if let (Value::Table(left), Value::Table(right)) = (a, b) {
        for (key, right_value) in right {
            match left.get_mut(key) {
                Some(left_value) => extend_values(left_value, right_value),
                None => {
                    left.insert(key.clone(), right_value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, Value)]) -> Value {
        let mut map = toml::map::Map::new();
        for (key, value) in pairs {
            map.insert(key.to_string(), value.clone());
        }
        Value::Table(map)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.system.update_interval_ms, 500);
        assert_eq!(config.stick.label, "SUN");
        assert!(!config.stick.auto_run_steps.copy_files_to_me);
        assert!(config.port_map.is_empty());
    }

    #[test]
    fn test_merge_b_wins_on_conflict() {
        let a = table(&[("x", Value::Integer(1)), ("y", Value::Integer(2))]);
        let b = table(&[("x", Value::Integer(10))]);
        let merged = merge_values(a, b);
        assert_eq!(merged.get("x"), Some(&Value::Integer(10)));
        assert_eq!(merged.get("y"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_merge_recurses_into_tables() {
        let a = table(&[("sub", table(&[("keep", Value::Boolean(true))]))]);
        let b = table(&[("sub", table(&[("new", Value::Integer(7))]))]);
        let merged = merge_values(a, b);
        let sub = merged.get("sub").unwrap();
        assert_eq!(sub.get("keep"), Some(&Value::Boolean(true)));
        assert_eq!(sub.get("new"), Some(&Value::Integer(7)));
    }

    #[test]
    fn test_merge_replaces_on_type_mismatch() {
        let a = table(&[("x", table(&[]))]);
        let b = table(&[("x", Value::Integer(3))]);
        let merged = merge_values(a, b);
        assert_eq!(merged.get("x"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_extend_fills_only_absent_keys() {
        let mut a = table(&[("x", Value::Integer(1))]);
        let b = table(&[("x", Value::Integer(99)), ("y", Value::Integer(2))]);
        extend_values(&mut a, &b);
        assert_eq!(a.get("x"), Some(&Value::Integer(1)));
        assert_eq!(a.get("y"), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_extend_noop_on_type_mismatch() {
        let mut a = table(&[("x", Value::Integer(1))]);
        let b = table(&[("x", table(&[("inner", Value::Integer(2))]))]);
        extend_values(&mut a, &b);
        assert_eq!(a.get("x"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let mut value: Value = toml::from_str("source_folder = \"/tmp/data\"").unwrap();
        let defaults = Value::try_from(Config::default()).unwrap();
        extend_values(&mut value, &defaults);
        let config: Config = value.try_into().unwrap();
        assert_eq!(config.source_folder, "/tmp/data");
        assert_eq!(config.system.update_interval_ms, 500);
        assert_eq!(config.stick.label, "SUN");
    }

    #[test]
    fn test_port_map_round_trip() {
        let mut config = Config::default();
        config
            .port_map
            .insert("/devices/usb2/2-1/2-1.2/2-1.2:1.0".to_string(), 0);
        config
            .port_map
            .insert("/devices/usb2/2-1/2-1.3/2-1.3:1.0".to_string(), 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config.save(&path).unwrap();

        let loaded = Config::load(Some(path)).unwrap();
        assert_eq!(loaded.port_map, config.port_map);
    }

    #[test]
    fn test_load_creates_missing_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let config = Config::load(Some(path.clone())).unwrap();
        assert!(path.is_file());
        assert_eq!(config.stick.label, "SUN");
    }

    #[test]
    fn test_validate_label_bounds() {
        assert!(validate_label("AB").is_ok());
        assert!(validate_label("ELEVENCHARS").is_ok());
        assert!(validate_label("A").is_err());
        assert!(validate_label("TWELVECHARSX").is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.stick.label, config.stick.label);
        assert_eq!(parsed.mount_base, config.mount_base);
    }
}
