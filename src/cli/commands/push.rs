//! Push command - push the image of a finished build

use crate::cli::args::PushArgs;
use crate::error::StratumResult;
use crate::orchestrator::Application;
use crate::ui::{TaskSpinner, UiContext};

/// Execute the push command
pub async fn execute(args: PushArgs, app: &Application) -> StratumResult<()> {
    let ctx = UiContext::detect();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Pushing to {}...", args.target));

    match app.push(&args.target, args.build_id.as_deref()).await {
        Ok(()) => {
            spinner.stop(&format!("Pushed to {}", args.target));
            Ok(())
        }
        Err(e) => {
            spinner.stop_error("Push failed");
            Err(e)
        }
    }
}
