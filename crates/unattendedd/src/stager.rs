//! Package stager - download, verify and extract packages into a new version directory.
//!
//! Staging never touches the active version: it only creates a fresh
//! `<date>.<counter>` directory next to it. Switching is the orchestrator's job.
//!
//! Per package failures (download, digest, extraction) skip that package.
//! Failing to seed the new directory from the current one aborts the batch.

use crate::fsutil::{deep_copy, extract_archive};
use crate::target::Target;
use crate::update_client::user_agent;
use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use reqwest::header::USER_AGENT;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use unattended_common::{OmahaManifest, Version};

/// A package that downloaded and matched its advertised digest
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedPackage {
    pub manifest: OmahaManifest,
    pub path: PathBuf,
}

/// Result of a staging run that produced a new version directory
#[derive(Debug, Clone, PartialEq)]
pub struct StagedVersion {
    pub version: Version,
    pub directory: PathBuf,
    /// Packages whose contents made it into the directory
    pub extracted: Vec<String>,
    /// Verified packages that failed to extract
    pub failed: Vec<String>,
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a computed digest with the advertised one, ignoring case
pub fn digest_matches(actual: &str, expected: &str) -> bool {
    let expected = expected.trim();
    !expected.is_empty() && actual.eq_ignore_ascii_case(expected)
}

/// File name to store the `index`th package of a batch under, without any
/// directory parts. The index keeps same-named packages apart.
fn package_file_name(index: usize, manifest: &OmahaManifest) -> String {
    let from_name = Path::new(&manifest.package.name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    let name = from_name.unwrap_or_else(|| format!("package-{}.zip", manifest.version));
    format!("{:02}-{}", index, name)
}

pub struct Stager {
    target: Arc<Target>,
    http: reqwest::Client,
}

impl Stager {
    pub fn new(target: Arc<Target>, download_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(download_timeout)
            .build()?;
        Ok(Self { target, http })
    }

    /// Stage the batch against today's local date
    pub async fn stage(&self, manifests: &[OmahaManifest]) -> Result<Option<StagedVersion>> {
        self.stage_on(manifests, Local::now().date_naive()).await
    }

    /// Stage the batch. `Ok(None)` means no package survived verification and
    /// nothing was created.
    pub async fn stage_on(
        &self,
        manifests: &[OmahaManifest],
        today: NaiveDate,
    ) -> Result<Option<StagedVersion>> {
        let staging = self.target.staging_directory();
        recreate_dir(&staging)?;

        let mut packages = Vec::new();
        for (index, manifest) in manifests.iter().enumerate() {
            if let Some(package) = self.fetch_verified(index, manifest, &staging).await {
                packages.push(package);
            }
        }

        if packages.is_empty() {
            info!("No verified packages this cycle, nothing staged");
            cleanup(&staging);
            return Ok(None);
        }

        let staged = self.build_version(&packages, &staging, today);
        cleanup(&staging);
        staged.map(Some)
    }

    async fn fetch_verified(
        &self,
        index: usize,
        manifest: &OmahaManifest,
        staging: &Path,
    ) -> Option<DownloadedPackage> {
        let path = staging.join(package_file_name(index, manifest));

        if let Err(e) = self.download(&manifest.url.codebase, &path).await {
            warn!(
                "Download of {} from {} failed, retrying next cycle: {:#}",
                manifest.package.name, manifest.url.codebase, e
            );
            return None;
        }

        let actual = match sha256_file(&path) {
            Ok(digest) => digest,
            Err(e) => {
                warn!("Could not hash {}: {}", path.display(), e);
                discard(&path);
                return None;
            }
        };

        if !digest_matches(&actual, &manifest.package.hash) {
            error!(
                "Integrity failure for {}: expected sha256 {}, got {}. Package discarded",
                manifest.package.name, manifest.package.hash, actual
            );
            discard(&path);
            return None;
        }

        if let Ok(meta) = fs::metadata(&path) {
            if manifest.package.size > 0 && meta.len() != manifest.package.size {
                warn!(
                    "{} is {} bytes, server advertised {}",
                    manifest.package.name,
                    meta.len(),
                    manifest.package.size
                );
            }
        }

        debug!("Verified {} ({})", manifest.package.name, actual);
        Some(DownloadedPackage {
            manifest: manifest.clone(),
            path,
        })
    }

    async fn download(&self, url: &str, path: &Path) -> Result<u64> {
        let mut response = self
            .http
            .get(url)
            .header(USER_AGENT, user_agent())
            .send()
            .await
            .context("request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("HTTP {}", response.status()));
        }

        let mut file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let mut total = 0u64;
        while let Some(chunk) = response.chunk().await.context("transfer interrupted")? {
            file.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        file.flush()?;

        debug!("Downloaded {} bytes from {}", total, url);
        Ok(total)
    }

    /// Seed a new version directory from the current one and extract the packages into it.
    ///
    /// Each archive is unpacked under `staging` first and merged only once it
    /// extracted completely, so a broken package leaves nothing behind.
    fn build_version(
        &self,
        packages: &[DownloadedPackage],
        staging: &Path,
        today: NaiveDate,
    ) -> Result<StagedVersion> {
        let current = self.target.current();
        let latest = self.target.latest_version().unwrap_or(current.version).max(current.version);
        let version = self
            .target
            .format()
            .next_version(&latest, today)
            .ok_or_else(|| anyhow!("Version counter exhausted after {}", latest))?;
        let directory = self.target.version_directory(&version);

        if directory.exists() {
            return Err(anyhow!(
                "Version directory {} already exists",
                directory.display()
            ));
        }

        info!(
            "Staging version {} into {}",
            version,
            directory.display()
        );

        if let Err(e) = deep_copy(&current.directory, &directory) {
            error!(
                "Failed to seed {} from {}: {:#}",
                directory.display(),
                current.directory.display(),
                e
            );
            discard_version(&directory);
            return Err(e.context("Failed to copy the current version"));
        }

        let mut extracted = Vec::new();
        let mut failed = Vec::new();
        for (index, package) in packages.iter().enumerate() {
            let name = &package.manifest.package.name;
            let scratch = staging.join(format!("unpack-{:02}", index));
            let unpacked = fs::create_dir_all(&scratch)
                .with_context(|| format!("Failed to create {}", scratch.display()))
                .and_then(|_| extract_archive(&package.path, &scratch));
            match unpacked {
                Ok(files) => debug!("Unpacked {} ({} files)", name, files),
                Err(e) => {
                    error!("Failed to extract {}: {:#}", name, e);
                    failed.push(name.clone());
                    cleanup(&scratch);
                    continue;
                }
            }

            if let Err(e) = deep_copy(&scratch, &directory) {
                error!("Failed to merge {} into {}: {:#}", name, directory.display(), e);
                discard_version(&directory);
                return Err(e.context(format!("Failed to install {}", name)));
            }
            cleanup(&scratch);
            info!("Extracted {}", name);
            extracted.push(name.clone());
        }

        Ok(StagedVersion {
            version,
            directory,
            extracted,
            failed,
        })
    }
}

fn recreate_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove stale staging directory {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(())
}

fn discard_version(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Failed to remove partial version {}: {}", dir.display(), e);
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to remove {}: {}", path.display(), e);
    }
}

fn cleanup(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        debug!("Failed to clean {}: {}", dir.display(), e);
    }
}
