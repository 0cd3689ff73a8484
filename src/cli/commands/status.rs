//! Status command - check the tools a build needs

use crate::config::Config;
use crate::error::StratumResult;
use crate::orchestration::{discover_ansible_playbook, BuildahBuilder, MIN_UNNAMED_COMMIT_VERSION};
use crate::store::resolve_runtime_dir;
use console::{style, Emoji};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "[FAIL] ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "[WARN] ");

/// Execute the status command
pub async fn execute(config: &Config, database_dir: Option<&Path>) -> StratumResult<()> {
    println!("{}", style("Stratum System Status").bold().cyan());

    let mut all_ok = true;
    all_ok &= check_buildah().await;
    all_ok &= check_podman().await;
    all_ok &= check_ansible(config).await;
    all_ok &= check_store(database_dir.or(config.store.database_dir.as_deref()));

    println!();
    if all_ok {
        println!("{}", style("All critical checks passed").green().bold());
    } else {
        println!(
            "{}",
            style("Some checks failed - see above for details").yellow().bold()
        );
    }

    Ok(())
}

async fn check_buildah() -> bool {
    println!();
    println!("{}", style("buildah:").bold());

    match BuildahBuilder::new().version().await {
        Ok(version) => {
            println!("  {} {}", CHECK, style(format!("Version {}", version)).green());
            if version < MIN_UNNAMED_COMMIT_VERSION {
                println!(
                    "  {} {} - layers will be committed with generated names",
                    WARN,
                    style(format!("Older than {}", MIN_UNNAMED_COMMIT_VERSION)).yellow()
                );
            }
            true
        }
        Err(e) => {
            println!(
                "  {} {} - {}",
                CROSS,
                style("Not usable").red(),
                e
            );
            false
        }
    }
}

async fn check_podman() -> bool {
    println!();
    println!("{}", style("podman:").bold());

    let installed = Command::new("podman")
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match installed {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            let first_line = version.lines().next().unwrap_or("unknown");
            println!("  {} {}", CHECK, style(first_line.trim()).green());
            true
        }
        _ => {
            println!(
                "  {} {} - Needed to check the python of the base image. Install: sudo dnf install podman",
                CROSS,
                style("Not installed").red()
            );
            false
        }
    }
}

async fn check_ansible(config: &Config) -> bool {
    println!();
    println!("{}", style("ansible-playbook:").bold());

    match discover_ansible_playbook(&config.executor.playbook_commands).await {
        Ok(path) => {
            println!("  {} {}", CHECK, style(path).green());
            true
        }
        Err(e) => {
            println!("  {} {} - {}", CROSS, style("Not usable").red(), e);
            false
        }
    }
}

fn check_store(database_dir: Option<&Path>) -> bool {
    println!();
    println!("{}", style("Build store:").bold());

    match resolve_runtime_dir(database_dir) {
        Ok(dir) => {
            println!("  {} Runtime directory: {}", CHECK, dir.display());
            true
        }
        Err(e) => {
            println!("  {} {} - {}", CROSS, style("Unavailable").red(), e);
            false
        }
    }
}
