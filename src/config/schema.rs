//! Configuration schema for Stratum
//!
//! Configuration is stored at `~/.config/stratum/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Build store location
    pub store: StoreConfig,

    /// Build defaults
    pub build: BuildConfig,

    /// ansible-playbook invocation
    pub executor: ExecutorConfig,

    /// Python interpreter discovery
    pub interpreter: InterpreterConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Store settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Runtime directory holding the store; searched for when unset
    pub database_dir: Option<PathBuf>,
}

/// Defaults applied to new builds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Builder backend
    pub builder: String,

    /// Serve tasks from the layer cache
    pub cache_tasks: bool,

    /// Snapshot the container after every task
    pub layering: bool,

    /// Squash the final image into a single layer
    pub squash: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            builder: "buildah".to_string(),
            cache_tasks: true,
            layering: true,
            squash: false,
        }
    }
}

/// ansible-playbook settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Executables tried in order
    pub playbook_commands: Vec<String>,

    /// Directory with the hook callback plugin; the bundled one is used when unset
    pub callback_plugins_dir: Option<PathBuf>,

    /// Wrap the run in `buildah unshare` when not root
    pub unshare: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            playbook_commands: vec![
                "ansible-playbook-3".to_string(),
                "ansible-playbook".to_string(),
            ],
            callback_plugins_dir: None,
            unshare: true,
        }
    }
}

/// Python interpreter discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Interpreter paths tried inside the base image, in order
    pub candidates: Vec<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                "/usr/bin/python3".to_string(),
                "/usr/local/bin/python3".to_string(),
                "/usr/libexec/platform-python".to_string(),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[build]"));
        assert!(toml.contains("[executor]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.build.builder, "buildah");
        assert!(config.build.cache_tasks);
        assert!(config.executor.unshare);
        assert!(config.store.database_dir.is_none());
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [build]
            layering = false

            [interpreter]
            candidates = ["/opt/python/bin/python3"]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.build.layering);
        assert!(config.build.cache_tasks); // default preserved
        assert_eq!(config.interpreter.candidates, vec!["/opt/python/bin/python3"]);
        assert_eq!(config.executor.playbook_commands.len(), 2);
    }
}
