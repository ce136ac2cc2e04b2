//! Common error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// External command exited nonzero or could not be spawned.
    #[error("command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// Operation requires a mount point that is not present.
    #[error("mount point missing: {0}")]
    MountPointMissing(PathBuf),

    #[error("monitor error: {0}")]
    Monitor(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Requested mode transition is not legal from the current mode.
    #[error("mode transition rejected: {0}")]
    ModeTransition(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
