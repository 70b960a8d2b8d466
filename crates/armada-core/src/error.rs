//! Error types for `Armada` core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using `Armada` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Armada` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A settings file exists but could not be read.
    #[error("Failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A settings file is not valid JSON for the expected shape.
    #[error("Failed to parse config file {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Settings were loaded but describe an unusable setup.
    #[error("Invalid configuration: {0}")]
    Config(String),
}
