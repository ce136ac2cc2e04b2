//! Device identity
//!
//! A stick is identified by its physical bus path for its whole
//! plug/unplug lifetime. The device node is assigned by the OS and may
//! differ between insertions of the same stick.

use serde::{Deserialize, Serialize};

/// Identity of one attached USB stick partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Physical bus topology path, stable per physical port.
    /// Durable key for the worker table and the port map.
    pub bus_path: String,
    /// OS-assigned device node (e.g. `/dev/sdb1`). Only valid while
    /// the device is present.
    pub node: String,
    /// Filesystem label, if the device carries one.
    pub label: Option<String>,
}

impl DeviceInfo {
    pub fn new(
        bus_path: impl Into<String>,
        node: impl Into<String>,
        label: Option<String>,
    ) -> Self {
        Self {
            bus_path: bus_path.into(),
            node: node.into(),
            label,
        }
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, label: {})",
            self.bus_path,
            self.node,
            self.label.as_deref().unwrap_or("-")
        )
    }
}
