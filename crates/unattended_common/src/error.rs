//! Error types for Unattended.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnattendedError {
    #[error("Application root directory does not exist at {0}")]
    BasePathMissing(PathBuf),

    #[error("No available version directory found in {0}")]
    NoVersionFound(PathBuf),

    #[error("Target application does not exist or cannot be read from: {0}")]
    TargetMissing(PathBuf),

    #[error("No version older than {0} to roll back to")]
    NoPreviousVersion(PathBuf),

    #[error("Configuration directory {0} does not exist or cannot be read from")]
    ConfigDirectoryMissing(PathBuf),

    #[error("Malformed update manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("Source directory does not exist or could not be found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Invalid version path format: {0}")]
    InvalidVersionFormat(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UnattendedError {
    /// Version-resolution failures abort a running cycle but are fatal at startup
    pub fn is_version_resolution(&self) -> bool {
        matches!(
            self,
            UnattendedError::NoVersionFound(_)
                | UnattendedError::TargetMissing(_)
                | UnattendedError::NoPreviousVersion(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, UnattendedError>;
