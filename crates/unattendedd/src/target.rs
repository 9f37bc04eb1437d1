//! The managed application and its version directories.
//!
//! `<base_path>/<date>.<counter>/<filename>` holds one complete installation per
//! version. The active installation is an immutable `ActiveVersion` behind an
//! `Arc` that `update()` and `rollback()` swap as a whole, so readers never see
//! a half-updated pointer.

use crate::config::TargetConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;
use unattended_common::{Result, UnattendedError, Version, VersionFormat};

/// Scratch directory for downloads, never a version
pub const STAGING_DIR_NAME: &str = "temp";

/// The installation the supervisor currently runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVersion {
    pub version: Version,
    /// `<base_path>/<date>.<counter>`
    pub directory: PathBuf,
    /// `<directory>/<filename>`
    pub application_path: PathBuf,
}

/// Version directory resolver for the managed application
#[derive(Debug)]
pub struct Target {
    base_path: PathBuf,
    filename: String,
    parameters: String,
    format: VersionFormat,
    active: RwLock<Arc<ActiveVersion>>,
}

impl Target {
    /// Resolve the latest installed version. Fails when the base path, any
    /// version directory or the application file inside it is missing.
    pub fn new(config: &TargetConfig) -> Result<Self> {
        let format = VersionFormat::new(&config.version_format)?;
        Self::with_format(&config.base_path, &config.filename, &config.parameters, format)
    }

    pub fn with_format(
        base_path: &Path,
        filename: &str,
        parameters: &str,
        format: VersionFormat,
    ) -> Result<Self> {
        if !base_path.is_dir() {
            return Err(UnattendedError::BasePathMissing(base_path.to_path_buf()));
        }
        let base_path = fs::canonicalize(base_path)?;

        let (version, directory) = latest_in(&base_path, &format)?;
        let active = resolve(version, directory, filename)?;
        info!(
            "Target application is {} (version {})",
            active.application_path.display(),
            active.version
        );

        Ok(Self {
            base_path,
            filename: filename.to_string(),
            parameters: parameters.to_string(),
            format,
            active: RwLock::new(Arc::new(active)),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn parameters(&self) -> &str {
        &self.parameters
    }

    pub fn format(&self) -> &VersionFormat {
        &self.format
    }

    /// `<base_path>/temp`
    pub fn staging_directory(&self) -> PathBuf {
        self.base_path.join(STAGING_DIR_NAME)
    }

    /// Directory a given version lives in
    pub fn version_directory(&self, version: &Version) -> PathBuf {
        self.base_path.join(self.format.directory_name(version))
    }

    /// Snapshot of the active installation
    pub fn current(&self) -> Arc<ActiveVersion> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current_version(&self) -> Version {
        self.current().version
    }

    pub fn current_version_directory(&self) -> PathBuf {
        self.current().directory.clone()
    }

    pub fn application_path(&self) -> PathBuf {
        self.current().application_path.clone()
    }

    /// All parseable version directories, oldest first
    pub fn versions(&self) -> Result<Vec<(Version, PathBuf)>> {
        scan(&self.base_path, &self.format)
    }

    pub fn latest_version(&self) -> Result<Version> {
        latest_in(&self.base_path, &self.format).map(|(version, _)| version)
    }

    pub fn latest_version_directory(&self) -> Result<PathBuf> {
        latest_in(&self.base_path, &self.format).map(|(_, directory)| directory)
    }

    /// Directory of the version immediately below the active one
    pub fn previous_version_directory(&self) -> Result<PathBuf> {
        self.previous().map(|(_, directory)| directory)
    }

    fn previous(&self) -> Result<(Version, PathBuf)> {
        let current = self.current();
        self.versions()?
            .into_iter()
            .rev()
            .find(|(version, _)| *version < current.version)
            .ok_or_else(|| UnattendedError::NoPreviousVersion(current.directory.clone()))
    }

    /// Switch to the latest version directory. On failure the previous
    /// pointer stays in place.
    pub fn update(&self) -> Result<Arc<ActiveVersion>> {
        let (version, directory) = latest_in(&self.base_path, &self.format)?;
        let active = resolve(version, directory, &self.filename)?;
        Ok(self.swap(active))
    }

    /// Switch to the version immediately preceding the active one
    pub fn rollback(&self) -> Result<Arc<ActiveVersion>> {
        let (version, directory) = self.previous()?;
        let active = resolve(version, directory, &self.filename)?;
        Ok(self.swap(active))
    }

    fn swap(&self, active: ActiveVersion) -> Arc<ActiveVersion> {
        let active = Arc::new(active);
        let mut guard = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if **guard != *active {
            info!(
                "Switching target from {} to {}",
                guard.version, active.version
            );
        }
        *guard = active.clone();
        active
    }
}

fn resolve(version: Version, directory: PathBuf, filename: &str) -> Result<ActiveVersion> {
    let application_path = directory.join(filename);
    if !application_path.is_file() {
        return Err(UnattendedError::TargetMissing(application_path));
    }
    Ok(ActiveVersion {
        version,
        directory,
        application_path,
    })
}

fn scan(base_path: &Path, format: &VersionFormat) -> Result<Vec<(Version, PathBuf)>> {
    let mut versions = Vec::new();
    for entry in fs::read_dir(base_path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(version) = format.parse_directory(name) {
            versions.push((version, entry.path()));
        }
    }
    versions.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(versions)
}

fn latest_in(base_path: &Path, format: &VersionFormat) -> Result<(Version, PathBuf)> {
    scan(base_path, format)?
        .pop()
        .ok_or_else(|| UnattendedError::NoVersionFound(base_path.to_path_buf()))
}
