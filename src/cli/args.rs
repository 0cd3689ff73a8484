//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Stratum - container images from Ansible playbooks
///
/// Runs a playbook against a buildah working container, snapshotting the
/// container after every task so unchanged tasks are served from cache.
#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Debug output, including ansible-playbook's
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "STRATUM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Runtime directory holding the build store
    #[arg(long, global = true, env = "STRATUM_DB_PATH")]
    pub database_dir: Option<PathBuf>,

    /// Log format: text or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a container image from a playbook
    Build(BuildArgs),

    /// List all builds
    ListBuilds(ListArgs),

    /// Show the output of a build
    GetLogs(LogsArgs),

    /// Show the record of a build
    Inspect(InspectArgs),

    /// Push the image of a finished build
    Push(PushArgs),

    /// Callback endpoint used by ansible-playbook during a build
    #[command(hide = true)]
    Hook(HookArgs),

    /// Check that the required tools are installed
    Status,

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Path to the playbook
    pub playbook: PathBuf,

    /// Image to start from
    pub base_image: Option<String>,

    /// Name of the resulting image
    pub target_image: Option<String>,

    /// Builder backend
    #[arg(long)]
    pub builder: Option<String>,

    /// Don't load tasks from the cache
    #[arg(long)]
    pub no_cache: bool,

    /// Don't snapshot the container after each task
    #[arg(long)]
    pub no_layering: bool,

    /// Squash the final image into a single layer
    #[arg(long)]
    pub squash: bool,

    /// Volumes mounted in the working container (host:container[:opts])
    #[arg(long, num_args = 1..)]
    pub build_volumes: Vec<String>,

    /// User running the playbook inside the working container
    #[arg(long)]
    pub build_user: Option<String>,

    /// Default working directory of the image
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Labels of the image (KEY=VALUE)
    #[arg(short, long, num_args = 1.., value_parser = parse_key_value)]
    pub label: Vec<(String, String)>,

    /// Annotations of the image (KEY=VALUE)
    #[arg(long, num_args = 1.., value_parser = parse_key_value)]
    pub annotation: Vec<(String, String)>,

    /// Environment variables of the image (KEY=VALUE)
    #[arg(short, long, num_args = 1.., value_parser = parse_key_value)]
    pub env_vars: Vec<(String, String)>,

    /// Default command of the image
    #[arg(long)]
    pub cmd: Option<String>,

    /// Entrypoint of the image
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// User the image runs as by default
    #[arg(short, long)]
    pub user: Option<String>,

    /// Ports exposed by the image
    #[arg(short, long, num_args = 1..)]
    pub ports: Vec<String>,

    /// Volumes of the image
    #[arg(long, num_args = 1..)]
    pub runtime_volumes: Vec<String>,

    /// Extra arguments passed to ansible-playbook
    #[arg(long, allow_hyphen_values = true)]
    pub extra_ansible_args: Option<String>,

    /// Extra arguments passed to `buildah from`
    #[arg(long, allow_hyphen_values = true)]
    pub extra_buildah_from_args: Option<String>,

    /// Python interpreter inside the base image
    #[arg(long)]
    pub python_interpreter: Option<String>,
}

/// Arguments for the list-builds command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the get-logs command
#[derive(Parser, Debug)]
pub struct LogsArgs {
    /// Build ID (defaults to the latest build)
    pub build_id: Option<String>,
}

/// Arguments for the inspect command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    /// Build ID (defaults to the latest build)
    pub build_id: Option<String>,

    /// Print the record as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the push command
#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Destination, e.g. docker://quay.io/org/app:latest
    pub target: String,

    /// Build ID (defaults to the latest build)
    pub build_id: Option<String>,
}

/// Arguments for the hook command
#[derive(Parser, Debug)]
pub struct HookArgs {
    /// Event reported by the callback plugin
    pub event: HookEvent,
}

/// Events the callback plugin reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HookEvent {
    /// A task is about to start
    TaskStart,
    /// A task finished
    TaskResult,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for list-builds
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Build IDs, one per line
    Plain,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Parse a KEY=VALUE pair
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}
