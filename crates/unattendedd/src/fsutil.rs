//! Filesystem helpers for staging: recursive directory copy and archive extraction.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use unattended_common::UnattendedError;
use walkdir::WalkDir;

/// Copy `source` and everything below it into `destination`.
///
/// The destination root is created even when the source is empty. A missing
/// source is an error, never a partial copy.
pub fn deep_copy(source: &Path, destination: &Path) -> Result<u64> {
    if !source.is_dir() {
        return Err(UnattendedError::DirectoryNotFound(source.to_path_buf()).into());
    }

    fs::create_dir_all(destination)
        .with_context(|| format!("Failed to create {}", destination.display()))?;

    let mut copied = 0u64;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} is outside {}", entry.path().display(), source.display()))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            copied += 1;
        }
    }

    debug!(
        "Copied {} file(s) from {} to {}",
        copied,
        source.display(),
        destination.display()
    );
    Ok(copied)
}

/// Whether a zip entry name denotes a directory: the last name component is
/// empty while the full path is not (`assets/`, `assets\`)
fn is_directory_entry(name: &str, size: u64) -> bool {
    size == 0 && !name.is_empty() && (name.ends_with('/') || name.ends_with('\\'))
}

/// Extract a zip archive into `destination`, overwriting existing files.
/// Returns the number of files written.
pub fn extract_archive(archive: &Path, destination: &Path) -> Result<usize> {
    let file = File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a valid zip archive", archive.display()))?;

    let mut written = 0usize;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .with_context(|| format!("Failed to read entry {} of {}", index, archive.display()))?;

        let Some(relative) = entry.enclosed_name().map(PathBuf::from) else {
            warn!(
                "Skipping unsafe archive entry '{}' in {}",
                entry.name(),
                archive.display()
            );
            continue;
        };
        let target = destination.join(&relative);

        if is_directory_entry(entry.name(), entry.size()) {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to extract {}", target.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("Failed to set permissions on {}", target.display()))?;
        }

        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn build_zip(path: &Path, files: &[(&str, &str)], dirs: &[&str]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for dir in dirs {
            writer.add_directory(*dir, FileOptions::default()).unwrap();
        }
        for (name, content) in files {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_deep_copy_nested() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("20160201.1");
        fs::create_dir_all(source.join("lib/plugins")).unwrap();
        fs::create_dir_all(source.join("empty")).unwrap();
        fs::write(source.join("app"), "binary").unwrap();
        fs::write(source.join("lib/core.dll"), "core").unwrap();
        fs::write(source.join("lib/plugins/a.dll"), "plugin").unwrap();

        let destination = temp.path().join("20160202.0");
        let copied = deep_copy(&source, &destination).unwrap();

        assert_eq!(copied, 3);
        assert_eq!(fs::read_to_string(destination.join("app")).unwrap(), "binary");
        assert_eq!(
            fs::read_to_string(destination.join("lib/plugins/a.dll")).unwrap(),
            "plugin"
        );
        assert!(destination.join("empty").is_dir());
    }

    #[test]
    fn test_deep_copy_empty_source_creates_root() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(&source).unwrap();
        let destination = temp.path().join("dst");

        assert_eq!(deep_copy(&source, &destination).unwrap(), 0);
        assert!(destination.is_dir());
    }

    #[test]
    fn test_deep_copy_missing_source() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("dst");
        assert!(deep_copy(&temp.path().join("missing"), &destination).is_err());
        assert!(!destination.exists());
    }

    #[test]
    fn test_extract_overwrites_and_creates_directories() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("package.zip");
        build_zip(
            &archive,
            &[("app", "new binary"), ("data/config.json", "{}")],
            &["cache/", "data/"],
        );

        let destination = temp.path().join("out");
        fs::create_dir_all(&destination).unwrap();
        fs::write(destination.join("app"), "old binary").unwrap();
        fs::write(destination.join("keep.txt"), "untouched").unwrap();

        let written = extract_archive(&archive, &destination).unwrap();
        assert_eq!(written, 2);
        assert_eq!(fs::read_to_string(destination.join("app")).unwrap(), "new binary");
        assert_eq!(fs::read_to_string(destination.join("keep.txt")).unwrap(), "untouched");
        assert!(destination.join("cache").is_dir());
        assert!(destination.join("data/config.json").is_file());
    }

    #[test]
    fn test_extract_rejects_non_zip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("package.zip");
        fs::write(&archive, "definitely not a zip").unwrap();
        assert!(extract_archive(&archive, temp.path()).is_err());
    }

    #[test]
    fn test_directory_entry_detection() {
        assert!(is_directory_entry("assets/", 0));
        assert!(is_directory_entry("a/b/", 0));
        assert!(is_directory_entry("assets\\", 0));
        assert!(!is_directory_entry("assets/file", 0));
        assert!(!is_directory_entry("", 0));
        assert!(!is_directory_entry("weird/", 12));
    }
}
