//! CLI command implementations

pub mod build;
pub mod config;
pub mod hook;
pub mod inspect;
pub mod list;
pub mod logs;
pub mod push;
pub mod status;

pub use build::execute as build;
pub use config::execute as config;
pub use hook::execute as hook;
pub use inspect::execute as inspect;
pub use list::execute as list;
pub use logs::execute as logs;
pub use push::execute as push;
pub use status::execute as status;
