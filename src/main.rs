//! Stratum - container images from Ansible playbooks
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use stratum::cli::args::LogFormat;
use stratum::cli::{Cli, Commands};
use stratum::config::ConfigManager;
use stratum::error::StratumResult;
use stratum::orchestrator::Application;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> StratumResult<()> {
    let cli = Cli::parse();

    let config_manager = if let Some(ref path) = cli.config {
        ConfigManager::with_path(path.clone())
    } else {
        ConfigManager::new()
    };
    let config = config_manager.load().await?;

    // 0 = warn, 1 = info, 2+ or --debug = debug
    let filter = match (cli.verbose, cli.debug) {
        (_, true) | (2.., _) => EnvFilter::new("stratum=debug"),
        (1, _) => EnvFilter::new("stratum=info"),
        _ => EnvFilter::new("stratum=warn"),
    };
    let json_logs = match cli.log_format {
        Some(format) => format == LogFormat::Json,
        None => config.general.log_format == "json",
    };

    // stdout is reserved for command output; the hook answers on it
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json_logs {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }

    let database_dir = cli.database_dir.as_deref();
    let plain = cli.verbose > 0 || cli.debug;

    match cli.command {
        Commands::Hook(args) => stratum::cli::commands::hook(args, database_dir).await,
        Commands::Status => stratum::cli::commands::status(&config, database_dir).await,
        Commands::Config(args) => {
            stratum::cli::commands::config(args, &config_manager, &config).await
        }
        command => {
            let app = Application::new(config, database_dir)?;
            match command {
                Commands::Build(args) => {
                    stratum::cli::commands::build(args, &app, plain, cli.debug).await
                }
                Commands::ListBuilds(args) => stratum::cli::commands::list(args, &app).await,
                Commands::GetLogs(args) => stratum::cli::commands::logs(args, &app).await,
                Commands::Inspect(args) => stratum::cli::commands::inspect(args, &app).await,
                Commands::Push(args) => stratum::cli::commands::push(args, &app).await,
                Commands::Hook(_) | Commands::Status | Commands::Config(_) => {
                    unreachable!("handled above")
                }
            }
        }
    }
}
