//! Build records and their configuration sources

pub mod playbook;
pub mod record;

pub use playbook::build_from_playbook;
pub use record::{Build, BuildState, ImageMetadata, Layer};
