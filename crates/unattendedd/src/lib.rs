//! Unattended daemon library - exposes modules for testing.

pub mod config;
pub mod coordinator;
pub mod fsutil;
pub mod orchestrator;
pub mod scheduler;
pub mod stager;
pub mod target;
pub mod update_client;
