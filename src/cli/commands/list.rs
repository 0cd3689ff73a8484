//! List-builds command - show recorded builds

use crate::build::{Build, BuildState};
use crate::cli::args::{ListArgs, OutputFormat};
use crate::error::StratumResult;
use crate::orchestrator::Application;
use crate::ui::{self, UiContext};
use console::style;

/// Execute the list-builds command
pub async fn execute(args: ListArgs, app: &Application) -> StratumResult<()> {
    let builds = app.list_builds().await?;

    if builds.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, "No builds yet");
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&builds),
        OutputFormat::Json => print_json(&builds)?,
        OutputFormat::Plain => print_plain(&builds),
    }

    Ok(())
}

fn print_table(builds: &[Build]) {
    println!(
        "{:<8} {:<30} {:<12} {:<20} {:<10}",
        style("BUILD ID").bold(),
        style("IMAGE NAME").bold(),
        style("STATUS").bold(),
        style("DATE").bold(),
        style("BUILD TIME").bold()
    );
    println!("{}", "-".repeat(84));

    for build in builds {
        let status = match build.state {
            BuildState::Done => style("done").green(),
            BuildState::InProgress => style("in_progress").yellow(),
            BuildState::New => style("new").dim(),
            BuildState::Failed => style("failed").red(),
        };
        let date = build
            .build_start_time
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<8} {:<30} {:<12} {:<20} {:<10}",
            build.build_id.as_deref().unwrap_or("?"),
            build.target_image.as_deref().unwrap_or("-"),
            status,
            date,
            format_duration(build)
        );
    }

    println!();
    println!("{} build(s)", builds.len());
}

/// `h:mm:ss` of a finished build, `-` otherwise
fn format_duration(build: &Build) -> String {
    match build.duration() {
        Some(d) => {
            let secs = d.num_seconds().max(0);
            format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
        None => "-".to_string(),
    }
}

fn print_json(builds: &[Build]) -> StratumResult<()> {
    let json = serde_json::to_string_pretty(builds)?;
    println!("{}", json);
    Ok(())
}

fn print_plain(builds: &[Build]) {
    for build in builds {
        if let Some(id) = &build.build_id {
            println!("{}", id);
        }
    }
}
