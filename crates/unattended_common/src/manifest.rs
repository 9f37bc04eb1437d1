//! Update manifests: one `.uum` file per tracked application.
//!
//! ```xml
//! <UpdateManifest>
//!   <AppID>testapp</AppID>
//!   <AppPath>TestApp.exe</AppPath>
//!   <ServerUri>http://unattendedserver.local</ServerUri>
//! </UpdateManifest>
//! ```

use crate::error::{Result, UnattendedError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File extension of update manifests
pub const MANIFEST_EXTENSION: &str = "uum";

/// A component to keep current
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "UpdateManifest")]
pub struct UpdateManifest {
    /// Globally unique application id sent to the update server
    #[serde(rename = "AppID")]
    pub app_id: String,
    /// Path of the versioned file, relative to the current version directory
    #[serde(rename = "AppPath")]
    pub app_path: PathBuf,
    /// Update server endpoint
    #[serde(rename = "ServerUri")]
    pub server_uri: String,
}

impl UpdateManifest {
    /// Read and validate a single manifest file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| UnattendedError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_xml(&content).map_err(|reason| UnattendedError::Manifest {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn from_xml(content: &str) -> std::result::Result<Self, String> {
        let manifest: UpdateManifest = quick_xml::de::from_str(content).map_err(|e| e.to_string())?;

        if manifest.app_id.trim().is_empty() {
            return Err("AppID is empty".to_string());
        }
        if manifest.server_uri.trim().is_empty() {
            return Err("ServerUri is empty".to_string());
        }
        if manifest.app_path.as_os_str().is_empty() || manifest.app_path.is_absolute() {
            return Err(format!(
                "AppPath must be a relative path, got '{}'",
                manifest.app_path.display()
            ));
        }
        Ok(manifest)
    }
}

/// Load every `.uum` manifest in `dir`, sorted by file name.
///
/// A missing directory or any malformed manifest fails the whole load.
pub fn load_manifests(dir: &Path) -> Result<Vec<UpdateManifest>> {
    if !dir.is_dir() {
        return Err(UnattendedError::ConfigDirectoryMissing(dir.to_path_buf()));
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut manifests = Vec::with_capacity(paths.len());
    for path in paths {
        let manifest = UpdateManifest::from_file(&path)?;
        debug!("Loaded update manifest {} ({})", path.display(), manifest.app_id);
        manifests.push(manifest);
    }

    info!("Loaded {} update manifest(s) from {}", manifests.len(), dir.display());
    Ok(manifests)
}
