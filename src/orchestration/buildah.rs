//! Buildah container builder
//!
//! Implements the ContainerBuilder trait by shelling out to `buildah`, with
//! `podman` used for throwaway runs.

use crate::build::record::TIMESTAMP_FORMAT_TOGETHER;
use crate::build::Build;
use crate::error::{StratumError, StratumResult};
use crate::orchestration::runtime::ContainerBuilder;
use crate::orchestration::{exec, exec_checked, is_rootless, render_command, split_args};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use semver::Version;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Oldest buildah able to commit without an image name
pub const MIN_UNNAMED_COMMIT_VERSION: Version = Version::new(1, 7, 3);

const BUILDAH: &str = "buildah";
const PODMAN: &str = "podman";

/// Container builder backed by buildah
#[derive(Debug, Default)]
pub struct BuildahBuilder;

impl BuildahBuilder {
    pub fn new() -> Self {
        Self
    }

    async fn buildah(&self, args: Vec<String>) -> StratumResult<String> {
        exec_checked(BUILDAH, &args).await
    }

    /// Installed buildah version
    pub async fn version(&self) -> StratumResult<Version> {
        let out = self.buildah(vec!["version".to_string()]).await?;
        parse_buildah_version(&out).ok_or_else(|| StratumError::ToolMalfunction {
            tool: BUILDAH.to_string(),
            reason: "unable to parse the output of `buildah version`".to_string(),
        })
    }

    /// Inspect an image and return its metadata
    async fn inspect_image(&self, image: &str) -> StratumResult<Option<serde_json::Value>> {
        let args = strings(&["inspect", "-t", "image", image]);
        let output = exec(BUILDAH, &args).await?;
        if !output.status.success() {
            info!("No such image {}", image);
            return Ok(None);
        }
        Ok(serde_json::from_slice(&output.stdout).ok())
    }

    async fn configure(&self, container: &str, config_args: Vec<String>) -> StratumResult<()> {
        if config_args.is_empty() {
            return Ok(());
        }
        let mut args = vec!["config".to_string()];
        args.extend(config_args);
        args.push(container.to_string());
        self.buildah(args).await.map(|_| ())
    }

    async fn create_container(
        &self,
        container: &str,
        from_image: &str,
        volumes: &[String],
        extra_args: Option<&str>,
    ) -> StratumResult<()> {
        let args = from_args(container, from_image, volumes, extra_args)?;
        self.buildah(args).await.map(|_| ())
    }

    async fn remove_container(&self, container: &str) -> StratumResult<()> {
        self.buildah(strings(&["rm", container])).await.map(|_| ())
    }
}

#[async_trait]
impl ContainerBuilder for BuildahBuilder {
    fn name(&self) -> &'static str {
        "buildah"
    }

    fn ansible_connection(&self) -> &'static str {
        "buildah"
    }

    async fn sanity_check(&self, build: &Build) -> StratumResult<()> {
        debug!("Checking that podman works");
        exec_checked(PODMAN, &strings(&["version"])).await?;
        debug!("Checking that buildah works");
        let version = self.version().await?;
        debug!("buildah version = {}", version);

        let base = base_image(build)?;
        let container = format!(
            "{}-{}",
            build.container_name()?,
            Utc::now().format(TIMESTAMP_FORMAT_TOGETHER)
        );
        debug!("Checking container creation using buildah");
        self.create_container(&container, base, &[], None).await?;
        let result = self
            .buildah(strings(&["run", &container, "true"]))
            .await
            .map(|_| ());
        self.remove_container(&container).await?;
        result.map_err(|e| StratumError::ToolMalfunction {
            tool: BUILDAH.to_string(),
            reason: format!("unable to run a container from {}: {}", base, e),
        })
    }

    async fn check_container_creation(&self, build: &Build) -> StratumResult<()> {
        debug!("Trying to create a dummy container using podman");
        let base = base_image(build)?;
        exec_checked(PODMAN, &strings(&["run", "--rm", base, "true"]))
            .await
            .map(|_| ())
    }

    async fn is_image_present(&self, image: &str) -> StratumResult<bool> {
        if image.is_empty() {
            return Ok(false);
        }
        let output = exec(BUILDAH, &strings(&["inspect", "-t", "image", image])).await?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> StratumResult<()> {
        info!("Pulling image: {}", image);
        let args = strings(&["pull", "--quiet", image]);
        let output = exec(BUILDAH, &args).await?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StratumError::ImagePull {
                image: image.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn get_image_id(&self, image: &str) -> StratumResult<String> {
        self.inspect_image(image)
            .await?
            .as_ref()
            .and_then(|m| m.get("FromImageID"))
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| StratumError::ImageNotFound(image.to_string()))
    }

    async fn create(&self, build: &Build, from_image: &str) -> StratumResult<()> {
        let container = build.container_name()?;
        info!("Creating working container {} from {}", container, from_image);
        self.create_container(
            container,
            from_image,
            &build.build_volumes,
            build.buildah_from_extra_args.as_deref(),
        )
        .await?;

        if build.build_user.is_some() && is_rootless() {
            warn!("Changing the user in rootless mode is discouraged, use it only when you know what you're doing");
        }
        // Labels set here are lost on commit; they are applied again at commit time
        let args = config_args(&ContainerSettings {
            working_dir: build.metadata.working_dir.as_deref(),
            user: build.build_user.as_deref(),
            env_vars: Some(&build.metadata.env_vars),
            labels: Some(&build.metadata.labels),
            annotations: Some(&build.metadata.annotations),
            ports: &build.metadata.ports,
            ..Default::default()
        });
        self.configure(container, args).await
    }

    async fn commit(
        &self,
        build: &Build,
        image_name: Option<&str>,
        final_image: bool,
    ) -> StratumResult<String> {
        let container = build.container_name()?;
        let metadata = &build.metadata;

        if metadata.has_commit_settings() {
            let user = if final_image {
                metadata.user.as_deref()
            } else {
                build.build_user.as_deref()
            };
            let args = config_args(&ContainerSettings {
                user,
                cmd: metadata.cmd.as_deref(),
                entrypoint: metadata.entrypoint.as_deref(),
                volumes: &metadata.volumes,
                labels: final_image.then_some(&metadata.labels),
                ..Default::default()
            });
            self.configure(container, args).await?;
        }

        let squash = final_image && build.squash;

        if let Some(name) = image_name {
            let mut args = vec!["commit".to_string()];
            if squash {
                args.push("--squash".to_string());
            }
            args.push(container.to_string());
            args.push(name.to_string());
            self.buildah(args).await?;
            return self.get_image_id(name).await;
        }

        let iidfile = tempfile::NamedTempFile::new()
            .map_err(|e| StratumError::io("creating iidfile", e))?;
        let mut args = vec!["commit".to_string()];
        if squash {
            args.push("--squash".to_string());
        }
        args.push("-q".to_string());
        args.push("--iidfile".to_string());
        args.push(iidfile.path().display().to_string());
        args.push(container.to_string());
        if self.version().await? < MIN_UNNAMED_COMMIT_VERSION {
            args.push(format!(
                "{}-{}",
                container,
                Utc::now().format(TIMESTAMP_FORMAT_TOGETHER)
            ));
        }
        self.buildah(args).await?;

        let layer_id = tokio::fs::read_to_string(iidfile.path())
            .await
            .map_err(|e| StratumError::io("reading iidfile", e))?
            .trim()
            .to_string();
        debug!("Layer id = {}", layer_id);
        Ok(layer_id)
    }

    async fn clean(&self, build: &Build) -> StratumResult<()> {
        self.remove_container(build.container_name()?).await
    }

    async fn run(&self, image: &str, command: &[String]) -> StratumResult<String> {
        let mut args = strings(&["run", "--rm", image]);
        args.extend(command.iter().cloned());
        exec_checked(PODMAN, &args).await
    }

    async fn push(&self, image_id: &str, target: &str) -> StratumResult<()> {
        info!("Pushing {} to {}", image_id, target);
        let args = strings(&["push", image_id, target]);
        let output = exec(BUILDAH, &args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(StratumError::command_exec(
                render_command(BUILDAH, &args),
                String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn base_image(build: &Build) -> StratumResult<&str> {
    build
        .base_image
        .as_deref()
        .ok_or_else(|| StratumError::validation("/base_image", "base image is not set"))
}

/// Arguments for `buildah from`
fn from_args(
    container: &str,
    from_image: &str,
    volumes: &[String],
    extra_args: Option<&str>,
) -> StratumResult<Vec<String>> {
    let mut args = vec!["from".to_string()];
    for volume in volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    if let Some(extra) = extra_args {
        args.extend(split_args(extra)?);
    }
    args.push("--name".to_string());
    args.push(container.to_string());
    args.push(from_image.to_string());
    Ok(args)
}

/// Settings applied with `buildah config`
#[derive(Default)]
struct ContainerSettings<'a> {
    working_dir: Option<&'a str>,
    env_vars: Option<&'a BTreeMap<String, String>>,
    labels: Option<&'a BTreeMap<String, String>>,
    annotations: Option<&'a BTreeMap<String, String>>,
    user: Option<&'a str>,
    cmd: Option<&'a str>,
    entrypoint: Option<&'a str>,
    ports: &'a [String],
    volumes: &'a [String],
}

fn config_args(settings: &ContainerSettings<'_>) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |flag: &str, value: String| {
        args.push(flag.to_string());
        args.push(value);
    };

    if let Some(dir) = settings.working_dir {
        push("--workingdir", dir.to_string());
    }
    for (k, v) in settings.env_vars.into_iter().flatten() {
        push("-e", format!("{}={}", k, v));
    }
    for (k, v) in settings.labels.into_iter().flatten() {
        push("-l", format!("{}={}", k, v));
    }
    for (k, v) in settings.annotations.into_iter().flatten() {
        push("--annotation", format!("{}={}", k, v));
    }
    if let Some(user) = settings.user {
        push("--user", user.to_string());
    }
    if let Some(cmd) = settings.cmd {
        push("--cmd", cmd.to_string());
    }
    if let Some(entrypoint) = settings.entrypoint {
        push("--entrypoint", entrypoint.to_string());
    }
    for port in settings.ports {
        push("-p", port.clone());
    }
    for volume in settings.volumes {
        push("-v", volume.clone());
    }
    args
}

/// Extract the version from `buildah version` output
pub(crate) fn parse_buildah_version(output: &str) -> Option<Version> {
    let re = Regex::new(r"Version:\s*(\d+)\.(\d+)(?:\.(\d+))?").ok()?;
    let caps = re.captures(output)?;
    let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
    Some(Version::new(part(1)?, part(2)?, part(3).unwrap_or(0)))
}
