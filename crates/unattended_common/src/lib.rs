//! Unattended Common - shared types for the update supervisor and managed applications.
//!
//! - `version`: the `<date>.<counter>` version directory scheme
//! - `omaha`: Omaha protocol (subset) wire types
//! - `manifest`: per-application update manifests (`.uum` files)
//! - `channel`: messages exchanged with the managed process

pub mod channel;
pub mod error;
pub mod manifest;
pub mod omaha;
pub mod version;

pub use channel::{Command, CommandReply, CommandRequest};
pub use error::{Result, UnattendedError};
pub use manifest::{load_manifests, UpdateManifest, MANIFEST_EXTENSION};
pub use omaha::{
    EventResult, EventType, OmahaApp, OmahaEvent, OmahaManifest, OmahaPackage, OmahaRequest,
    OmahaResponse, OmahaUpdateCheck, OmahaUrl,
};
pub use version::{Version, VersionFormat, DEFAULT_VERSION_FORMAT};

/// Crate version, reported in the update-check User-Agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
