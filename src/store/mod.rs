//! Persistent store for build records and the layer cache index
//!
//! Everything lives in a single JSON file under a runtime directory; every
//! read-modify-write happens while holding [`StoreLock`].

mod db;
mod lock;

pub use db::{resolve_runtime_dir, Database, StateUpdate, DB_FILE_NAME, LOCK_FILE_NAME};
pub use lock::StoreLock;
