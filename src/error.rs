use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unreadable volume {}: {reason}", path.display())]
    UnreadableVolume { path: PathBuf, reason: String },

    #[error("Unwritable volume {}: {reason}", path.display())]
    UnwritableVolume { path: PathBuf, reason: String },

    #[error("Brain extraction failed: {0}")]
    ExtractionFailure(String),

    #[error("Registration failed: {0}")]
    RegistrationFailure(String),

    #[error("Rasterization failed for {}: {reason}", path.display())]
    RasterizationFailure { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::UnreadableVolume {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn extraction(msg: impl Into<String>) -> Self {
        Self::ExtractionFailure(msg.into())
    }

    pub(crate) fn registration(msg: impl Into<String>) -> Self {
        Self::RegistrationFailure(msg.into())
    }
}
