//! Error types for Stratum
//!
//! All modules use `StratumResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Stratum operations
pub type StratumResult<T> = Result<T, StratumError>;

/// All errors that can occur in Stratum
#[derive(Error, Debug)]
pub enum StratumError {
    // Environment errors
    #[error("Required command not found: {name}. {hint}")]
    CommandNotFound { name: String, hint: String },

    #[error("{tool} is not working properly: {reason}")]
    ToolMalfunction { tool: String, reason: String },

    #[error("Unknown builder backend: {0}")]
    UnknownBuilder(String),

    #[error("Can't find a suitable directory to store runtime data, tried: {tried}")]
    RuntimeDirNotFound { tried: String },

    #[error("Ansible is using Python 2 ({0}), which can't load the caching callback")]
    AnsiblePython2(String),

    #[error("No Python interpreter was found in the base image {image}, tried: {tried}")]
    PythonInterpreterNotFound { image: String, tried: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation error at {path}: {reason}")]
    Validation { path: String, reason: String },

    #[error("Invalid playbook {path}: {reason}")]
    PlaybookInvalid { path: PathBuf, reason: String },

    // Store errors
    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("No builds recorded yet")]
    NoBuilds,

    #[error("Build {build_id} has not finished yet, it is in state '{state}'")]
    BuildNotFinished { build_id: String, state: String },

    #[error("Failed to decode store {path}: {reason}")]
    StoreCorrupted { path: PathBuf, reason: String },

    // Build errors
    #[error("{message}")]
    BuildUnsuccessful { message: String, output: Vec<String> },

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Hook environment variable {0} is not set; is this running under a stratum build?")]
    HookEnvMissing(&'static str),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl StratumError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a validation error for a field path
    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the playbook run itself failed (as opposed to stratum or its environment)
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Self::BuildUnsuccessful { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CommandNotFound { .. } => Some("Run: stratum status"),
            Self::RuntimeDirNotFound { .. } => Some("Pass an existing directory via --database-dir"),
            Self::PythonInterpreterNotFound { .. } => {
                Some("Specify the interpreter path with --python-interpreter")
            }
            Self::BuildUnsuccessful { .. } => Some("Inspect the output with: stratum get-logs"),
            Self::NoBuilds => Some("Run: stratum build <playbook>"),
            _ => None,
        }
    }
}
