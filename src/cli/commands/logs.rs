//! Get-logs command - print the output of a build

use crate::cli::args::LogsArgs;
use crate::error::StratumResult;
use crate::orchestrator::Application;

/// Execute the get-logs command
pub async fn execute(args: LogsArgs, app: &Application) -> StratumResult<()> {
    let lines = app.get_logs(args.build_id.as_deref()).await?;
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
