//! Playbook executor
//!
//! Runs `ansible-playbook` against the working container. Per-task caching
//! happens out of process: the generated `ansible.cfg` enables a callback
//! plugin which calls back into `stratum hook` around every task.

use crate::build::record::TIMESTAMP_FORMAT;
use crate::build::Build;
use crate::config::schema::ExecutorConfig;
use crate::error::{StratumError, StratumResult};
use crate::orchestration::{
    command_works, exec, is_rootless, render_command, split_args, stream_child_output,
};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Build id handed to the hook
pub const ENV_BUILD_ID: &str = "STRATUM_BUILD_ID";
/// Runtime directory of the store handed to the hook
pub const ENV_DB_PATH: &str = "STRATUM_DB_PATH";
/// Binary the callback plugin invokes
pub const ENV_HOOK_BIN: &str = "STRATUM_HOOK_BIN";

const CALLBACK_PLUGIN_NAME: &str = "stratum_hook";
const CALLBACK_PLUGIN_SOURCE: &str = include_str!("stratum_hook.py");

/// One playbook execution against a build's working container
pub struct PlaybookRun<'a> {
    pub build: &'a Build,
    pub playbook: &'a Path,
    /// Ansible connection plugin reaching the container
    pub connection: &'a str,
    /// Runtime directory the store was opened with
    pub db_path: &'a Path,
    pub on_output: &'a (dyn Fn(String) + Send + Sync),
}

/// Executes a playbook and returns its output lines
///
/// A failed run is reported as [`StratumError::BuildUnsuccessful`].
#[async_trait]
pub trait PlaybookExecutor: Send + Sync {
    async fn run(&self, run: PlaybookRun<'_>) -> StratumResult<Vec<String>>;
}

/// Executor running the real `ansible-playbook`
pub struct AnsibleRunner {
    config: ExecutorConfig,
}

impl AnsibleRunner {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn ansible_cfg(plugins_dir: &Path) -> String {
        format!(
            "[defaults]\n\
             # the container user may not be able to write to /.ansible\n\
             remote_tmp = /tmp\n\
             retry_files_enabled = False\n\
             callback_plugins = {dir}\n\
             callbacks_enabled = {name}\n\
             callback_whitelist = {name}\n",
            dir = plugins_dir.display(),
            name = CALLBACK_PLUGIN_NAME,
        )
    }

    async fn plugins_dir(&self, tmp: &Path) -> StratumResult<PathBuf> {
        if let Some(dir) = &self.config.callback_plugins_dir {
            return Ok(dir.clone());
        }
        let dir = tmp.join("callback_plugins");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StratumError::io("creating callback plugin directory", e))?;
        tokio::fs::write(dir.join(format!("{}.py", CALLBACK_PLUGIN_NAME)), CALLBACK_PLUGIN_SOURCE)
            .await
            .map_err(|e| StratumError::io("writing callback plugin", e))?;
        Ok(dir)
    }
}

#[async_trait]
impl PlaybookExecutor for AnsibleRunner {
    async fn run(&self, run: PlaybookRun<'_>) -> StratumResult<Vec<String>> {
        let build = run.build;
        let ap = discover_ansible_playbook(&self.config.playbook_commands).await?;
        let container = build.container_name()?;

        let tmp = tempfile::Builder::new()
            .prefix("stratum")
            .tempdir()
            .map_err(|e| StratumError::io("creating temporary directory", e))?;

        let inventory = tmp.path().join("inventory");
        info!("Creating inventory file {}", inventory.display());
        let python = build.python_interpreter.as_deref().unwrap_or("/usr/bin/python3");
        tokio::fs::write(&inventory, inventory_line(container, run.connection, python))
            .await
            .map_err(|e| StratumError::io("writing inventory", e))?;

        let plugins_dir = self.plugins_dir(tmp.path()).await?;
        let cfg = tmp.path().join("ansible.cfg");
        tokio::fs::write(&cfg, Self::ansible_cfg(&plugins_dir))
            .await
            .map_err(|e| StratumError::io("writing ansible.cfg", e))?;

        let playbook_copy = tmp.path().join("p.yaml");
        let source = tokio::fs::read_to_string(run.playbook)
            .await
            .map_err(|e| StratumError::io(format!("reading {}", run.playbook.display()), e))?;
        tokio::fs::write(&playbook_copy, retarget_playbook(&source, container)?)
            .await
            .map_err(|e| StratumError::io("writing playbook copy", e))?;

        // Relative paths in the playbook resolve against its own directory
        let link = PlaybookLink::create(run.playbook, &playbook_copy).await?;

        let mut ap_args = vec![
            "-c".to_string(),
            run.connection.to_string(),
            "-i".to_string(),
            inventory.display().to_string(),
        ];
        if build.debug {
            ap_args.push("-vvv".to_string());
        }
        if let Some(extra) = &build.ansible_extra_args {
            ap_args.extend(split_args(extra)?);
        }
        ap_args.push(link.path.display().to_string());

        let (program, args) = if self.config.unshare && is_rootless() {
            info!("Running rootless, prepending `buildah unshare`");
            let mut args = vec!["unshare".to_string(), "--".to_string(), ap.clone()];
            args.extend(ap_args);
            ("buildah".to_string(), args)
        } else {
            (ap.clone(), ap_args)
        };
        let rendered = render_command(&program, &args);
        debug!("{}", rendered);

        let hook_bin = std::env::current_exe()
            .map_err(|e| StratumError::io("locating the stratum binary", e))?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .env("ANSIBLE_RETRY_FILES_ENABLED", "0")
            .env("ANSIBLE_CONFIG", &cfg)
            .env(ENV_BUILD_ID, build.id()?)
            .env(ENV_DB_PATH, run.db_path)
            .env(ENV_HOOK_BIN, hook_bin)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if build.debug {
            command.env("ANSIBLE_STDOUT_CALLBACK", "debug");
        }

        let mut child = command
            .spawn()
            .map_err(|e| StratumError::command_failed(rendered.clone(), e))?;
        let output = stream_child_output(&mut child, run.on_output).await?;
        let status = child
            .wait()
            .await
            .map_err(|e| StratumError::command_failed(rendered, e))?;

        drop(link);
        if status.success() {
            Ok(output)
        } else {
            Err(StratumError::BuildUnsuccessful {
                message: format!("ansible-playbook execution failed: {}", status),
                output,
            })
        }
    }
}

/// Hidden symlink next to the original playbook, removed on drop
struct PlaybookLink {
    path: PathBuf,
}

impl PlaybookLink {
    async fn create(playbook: &Path, target: &Path) -> StratumResult<Self> {
        let stem = playbook
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split('.').next())
            .unwrap_or("playbook");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!(
            ".{}-{}-{}.yaml",
            stem,
            Utc::now().format(TIMESTAMP_FORMAT),
            &suffix[..10]
        );
        let dir = playbook.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let path = dir.join(name);
        tokio::fs::symlink(target, &path)
            .await
            .map_err(|e| StratumError::io(format!("creating symlink {}", path.display()), e))?;
        Ok(Self { path })
    }
}

impl Drop for PlaybookLink {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

fn inventory_line(container: &str, connection: &str, python: &str) -> String {
    format!(
        "{} ansible_connection=\"{}\" ansible_python_interpreter=\"{}\"\n",
        container, connection, python
    )
}

/// Point the first play declaring `hosts` at the working container
fn retarget_playbook(source: &str, container: &str) -> StratumResult<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(source)?;
    if let Some(plays) = doc.as_sequence_mut() {
        if let Some(play) = plays
            .iter_mut()
            .filter_map(|p| p.as_mapping_mut())
            .find(|p| p.contains_key("hosts"))
        {
            debug!("Rewriting hosts {:?} to {}", play.get("hosts"), container);
            play.insert("hosts".into(), container.into());
        }
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// Find a working ansible-playbook, rejecting one running on Python 2
pub async fn discover_ansible_playbook(candidates: &[String]) -> StratumResult<String> {
    let mut found = None;
    for candidate in candidates {
        if command_works(candidate).await {
            found = Some(candidate.clone());
            break;
        }
    }
    let ap = found.ok_or_else(|| StratumError::CommandNotFound {
        name: "ansible-playbook".to_string(),
        hint: "It is usually provided by the 'ansible' package".to_string(),
    })?;

    let output = exec(&ap, &["--version".to_string()]).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    match ansible_python_major(&stdout) {
        Some(2) => return Err(StratumError::AnsiblePython2(ap)),
        Some(_) => debug!("{} is not using python 2", ap),
        None => warn!("Could not figure out which python {} is using", ap),
    }
    Ok(ap)
}

/// Python major version from `ansible-playbook --version` output
fn ansible_python_major(version_output: &str) -> Option<u32> {
    let re = Regex::new(r"python version = (\d+)").ok()?;
    re.captures(version_output)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn inventory_format() {
        assert_eq!(
            inventory_line("app-cont", "buildah", "/usr/bin/python3"),
            "app-cont ansible_connection=\"buildah\" ansible_python_interpreter=\"/usr/bin/python3\"\n"
        );
    }

    #[test]
    fn config_registers_plugin() {
        let cfg = AnsibleRunner::ansible_cfg(Path::new("/tmp/plugins"));
        assert!(cfg.starts_with("[defaults]\n"));
        assert!(cfg.contains("callback_plugins = /tmp/plugins\n"));
        assert!(cfg.contains("callback_whitelist = stratum_hook\n"));
    }

    #[test]
    fn retargets_first_play_with_hosts() {
        let source = "- import_playbook: other.yaml\n- hosts: all\n  tasks: []\n- hosts: web\n";
        let out = retarget_playbook(source, "app-cont").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(doc[1]["hosts"], serde_yaml::Value::from("app-cont"));
        assert_eq!(doc[2]["hosts"], serde_yaml::Value::from("web"));
    }

    #[test]
    fn detects_python_version() {
        let out = "ansible-playbook [core 2.16.3]\n  python version = 3.12.2 (main)\n";
        assert_eq!(ansible_python_major(out), Some(3));
        assert_eq!(ansible_python_major("python version = 2.7.18"), Some(2));
        assert_eq!(ansible_python_major("ansible 2.9"), None);
    }

    #[tokio::test]
    async fn link_is_hidden_and_removed() {
        let dir = TempDir::new().unwrap();
        let playbook = dir.path().join("site.yml");
        let copy = dir.path().join("copy.yaml");
        std::fs::write(&copy, "- hosts: x\n").unwrap();

        let link = PlaybookLink::create(&playbook, &copy).await.unwrap();
        let name = link.path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with(".site-"));
        assert!(name.ends_with(".yaml"));
        assert_eq!(std::fs::read_to_string(&link.path).unwrap(), "- hosts: x\n");

        let path = link.path.clone();
        drop(link);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_ansible() {
        let err = discover_ansible_playbook(&["stratum-no-such-ansible-playbook".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::CommandNotFound { .. }));
    }
}
