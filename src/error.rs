use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to load configuration\n{0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Stack(#[from] aws_cfn_stack::Error),
    #[error("Failed to read {path:?}\n{source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Stack {stack} has no output named {key}. Has it been deployed?")]
    MissingOutput { stack: String, key: String },
    #[error("Failed to upload {key}\n{reason}")]
    Upload { key: String, reason: String },
    #[error("Failed to delete stale objects from {bucket}\n{reason}")]
    Prune { bucket: String, reason: String },
    #[error("Failed to invalidate distribution {distribution}\n{reason}")]
    Invalidate { distribution: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
