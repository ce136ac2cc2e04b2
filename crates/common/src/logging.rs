//! Logging setup
//!
//! Log output shares the terminal with the status table, so the format
//! layer is compact and drops the module target. `RUST_LOG` overrides
//! the configured level.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn parse_filter(directive: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| crate::Error::Config(format!("invalid log filter '{}': {}", directive, e)))
}

/// Install the global subscriber. Call once at startup.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(default_level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(false))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_plain_levels() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("debug").is_ok());
    }

    #[test]
    fn test_filter_rejects_malformed_directive() {
        assert!(parse_filter("foo=bar=baz").is_err());
    }
}
