//! UI module for consistent CLI output
//!
//! Uses `cliclack` and `indicatif` in interactive terminals with automatic
//! fallback to plain output in CI/non-interactive environments.
//!
//! # Example
//!
//! ```rust,ignore
//! use stratum::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect();
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Pushing image...");
//! // ... do work ...
//! spinner.stop("Image pushed");
//!
//! ui::step_warn_hint(&ctx, "buildah not found", "Install buildah");
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, outro_error, outro_success, remark, section,
    step_error_detail, step_info, step_ok, step_warn_hint,
};
pub use progress::{PlaybookProgress, TaskSpinner};
