use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::program::ExecutionStream;

/// Settings of the resharding rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshardConfig {
    /// Stream the inserted communication is issued on.
    pub comm_stream: ExecutionStream,
    /// Also create the reverse channel of every pair, so that later traffic in the opposite
    /// direction (gradients) finds it ready.
    pub eager_reverse_channels: bool,
}

impl Default for ReshardConfig {
    fn default() -> Self {
        Self {
            comm_stream: ExecutionStream::Calc,
            eager_reverse_channels: true,
        }
    }
}

/// Errors raised while loading a [`ReshardConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON document is malformed or holds an unknown value.
    #[error("invalid reshard config: {0}")]
    Parse(#[from] serde_json::Error),
    /// The config file could not be read.
    #[cfg(feature = "std")]
    #[error("failed to read reshard config {}: {source}", path.display())]
    Io {
        /// Path of the file.
        path: std::path::PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },
}

impl ReshardConfig {
    /// Parses a config from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON config file.
    #[cfg(feature = "std")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}
