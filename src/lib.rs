//! Stratum - container images from Ansible playbooks
//!
//! Runs a playbook against a buildah working container and snapshots the
//! container after every task. Snapshots are indexed by the task's content
//! and the image it ran on, so rebuilding an unchanged playbook prefix is
//! served from cache.

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod orchestration;
pub mod orchestrator;
pub mod store;
pub mod ui;

pub use error::{StratumError, StratumResult};
