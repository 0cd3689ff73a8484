//! Build orchestrator
//!
//! Drives one build through `NEW -> IN_PROGRESS -> DONE | FAILED`: prepares
//! the base image, creates the working container, runs the playbook (with
//! the step interceptor caching tasks out of process) and commits the result.

use crate::build::{Build, BuildState};
use crate::config::Config;
use crate::error::{StratumError, StratumResult};
use crate::orchestration::{
    create_builder, AnsibleRunner, ContainerBuilder, PlaybookExecutor, PlaybookRun,
};
use crate::store::{Database, StateUpdate};
use chrono::Utc;
use regex::Regex;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Entry point for build operations
pub struct Application {
    db: Database,
    config: Config,
}

impl Application {
    /// Open the store; `database_dir` overrides the configured location
    pub fn new(config: Config, database_dir: Option<&Path>) -> StratumResult<Self> {
        let dir = database_dir.or(config.store.database_dir.as_deref());
        let db = Database::new(dir)?;
        Ok(Self { db, config })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build an image with the builder named in the build and ansible-playbook
    pub async fn build(
        &self,
        build: Build,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> StratumResult<Build> {
        let builder = create_builder(&build.builder_name)?;
        let runner = AnsibleRunner::new(self.config.executor.clone());
        self.build_with(build, builder.as_ref(), &runner, on_output)
            .await
    }

    /// Build an image with explicit builder and executor implementations
    pub async fn build_with(
        &self,
        mut build: Build,
        builder: &dyn ContainerBuilder,
        executor: &dyn PlaybookExecutor,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> StratumResult<Build> {
        validate(&build)?;

        build.build_start_time = Some(Utc::now());
        build.builder_name = builder.name().to_string();
        self.db
            .record_build(&mut build, StateUpdate::to(BuildState::New))
            .await?;
        let build_id = build.id()?.to_string();
        info!("Starting build {}", build_id);

        let result = self.run_build(&mut build, builder, executor, on_output).await;

        if let Err(e) = &result {
            if !e.is_build_failure() {
                error!("Build {} failed: {}", build_id, e);
                if let Err(mark) = self
                    .db
                    .update_build(&build_id, StateUpdate::finish(BuildState::Failed))
                    .await
                {
                    error!("Unable to mark build {} as failed: {}", build_id, mark);
                }
            }
        }
        result
    }

    async fn run_build(
        &self,
        build: &mut Build,
        builder: &dyn ContainerBuilder,
        executor: &dyn PlaybookExecutor,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> StratumResult<Build> {
        self.prepare(build, builder).await?;

        let from = build
            .top_layer_id()
            .ok_or_else(|| StratumError::Internal("base layer was not recorded".to_string()))?
            .to_string();
        builder.create(build, &from).await?;

        let result = self.execute(build, builder, executor, on_output).await;

        if let Err(e) = builder.clean(build).await {
            warn!("Failed to remove working container: {}", e);
        }
        result
    }

    /// Tooling checks, base image and interpreter; leaves the build IN_PROGRESS
    async fn prepare(&self, build: &mut Build, builder: &dyn ContainerBuilder) -> StratumResult<()> {
        let build_id = build.id()?.to_string();
        let base_image = build
            .base_image
            .clone()
            .ok_or_else(|| StratumError::validation("/base_image", "base image is not set"))?;

        builder.sanity_check(build).await?;

        let mut pulled = false;
        if !builder.is_image_present(&base_image).await? {
            builder.pull(&base_image).await?;
            pulled = true;
        }
        builder.check_container_creation(build).await?;

        let base_id = builder.get_image_id(&base_image).await?;
        debug!("Base image {} has id {}", base_image, base_id);
        {
            let base_id = base_id.clone();
            self.db
                .modify_build(&build_id, move |b| {
                    b.pulled = pulled;
                    b.record_layer(None, base_id, true);
                    Ok(())
                })
                .await?;
        }
        *build = self
            .db
            .update_build(&build_id, StateUpdate::to(BuildState::InProgress))
            .await?;

        if build.python_interpreter.is_none() {
            let interpreter = self
                .python_interpreter(builder, &base_image, &base_id)
                .await?;
            *build = self
                .db
                .modify_build(&build_id, move |b| {
                    b.python_interpreter = Some(interpreter);
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    async fn python_interpreter(
        &self,
        builder: &dyn ContainerBuilder,
        base_image: &str,
        base_id: &str,
    ) -> StratumResult<String> {
        if let Some(cached) = self.db.get_cached_interpreter(base_id).await? {
            debug!("Using cached python interpreter {} for {}", cached, base_id);
            return Ok(cached);
        }
        let found = builder
            .find_python_interpreter(base_image, &self.config.interpreter.candidates)
            .await?;
        self.db.save_interpreter(base_id, &found).await?;
        Ok(found)
    }

    /// Run the playbook and commit the outcome
    async fn execute(
        &self,
        build: &Build,
        builder: &dyn ContainerBuilder,
        executor: &dyn PlaybookExecutor,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> StratumResult<Build> {
        let build_id = build.id()?.to_string();
        let playbook = build
            .playbook_path
            .clone()
            .ok_or_else(|| StratumError::validation("/playbook", "playbook is not set"))?;

        let run = PlaybookRun {
            build,
            playbook: &playbook,
            connection: builder.ansible_connection(),
            db_path: self.db.runtime_dir(),
            on_output,
        };
        let output = match executor.run(run).await {
            Ok(output) => output,
            Err(StratumError::BuildUnsuccessful { message, output }) => {
                return Err(self.fail(&build_id, builder, message, output).await);
            }
            Err(e) => return Err(e),
        };

        let current = self.db.get_build(&build_id).await?;
        if current.is_failed() {
            let message = "build was aborted while processing a task".to_string();
            return Err(self.fail(&build_id, builder, message, output).await);
        }

        let target = current
            .target_image
            .clone()
            .ok_or_else(|| StratumError::validation("/target_image/name", "target image is not set"))?;
        let image_id = builder.commit(&current, Some(&target), true).await?;

        let done = self
            .db
            .modify_build(&build_id, move |b| {
                b.record_layer(None, image_id.clone(), false);
                b.final_layer_id = Some(image_id);
                b.log_lines = output;
                b.state = BuildState::Done;
                b.build_finished_time = Some(Utc::now());
                Ok(())
            })
            .await?;
        info!("Image '{}' was built successfully", target);
        Ok(done)
    }

    /// Mark the build FAILED and keep its progress in `<target>-failed`
    async fn fail(
        &self,
        build_id: &str,
        builder: &dyn ContainerBuilder,
        message: String,
        output: Vec<String>,
    ) -> StratumError {
        let log_lines = output.clone();
        let failed = match self
            .db
            .modify_build(build_id, move |b| {
                b.state = BuildState::Failed;
                b.build_finished_time = Some(Utc::now());
                b.log_lines = log_lines;
                Ok(())
            })
            .await
        {
            Ok(failed) => failed,
            Err(e) => return e,
        };

        if let Some(name) = failed.failed_image_name() {
            match builder.commit(&failed, Some(&name), false).await {
                Ok(_) => info!("The progress is saved into image '{}'", name),
                Err(e) => warn!("Unable to save the progress into {}: {}", name, e),
            }
        }
        StratumError::BuildUnsuccessful { message, output }
    }

    /// All recorded builds ordered by id
    pub async fn list_builds(&self) -> StratumResult<Vec<Build>> {
        self.db.load_builds().await
    }

    /// Output of a build, the latest one by default
    pub async fn get_logs(&self, build_id: Option<&str>) -> StratumResult<Vec<String>> {
        Ok(self.db.get_build_or_latest(build_id).await?.log_lines)
    }

    /// Full record of a build, the latest one by default
    pub async fn inspect(&self, build_id: Option<&str>) -> StratumResult<Build> {
        self.db.get_build_or_latest(build_id).await
    }

    /// Push a finished build's image to `target`
    pub async fn push(&self, target: &str, build_id: Option<&str>) -> StratumResult<()> {
        let build = self.db.get_build_or_latest(build_id).await?;
        let builder = create_builder(&build.builder_name)?;
        self.push_with(builder.as_ref(), &build, target).await
    }

    pub async fn push_with(
        &self,
        builder: &dyn ContainerBuilder,
        build: &Build,
        target: &str,
    ) -> StratumResult<()> {
        let image_id = build.target_image_id()?;
        builder.push(image_id, target).await?;
        info!("Image {} pushed to {}", image_id, target);
        Ok(())
    }
}

/// Check a build can be started
pub fn validate(build: &Build) -> StratumResult<()> {
    let playbook = build
        .playbook_path
        .as_deref()
        .ok_or_else(|| StratumError::validation("/playbook", "playbook is not set"))?;
    if !playbook.is_file() {
        return Err(StratumError::validation(
            "/playbook",
            format!("no such file: {}", playbook.display()),
        ));
    }

    match build.base_image.as_deref() {
        Some(base) if !base.trim().is_empty() => {}
        _ => {
            return Err(StratumError::validation(
                "/base_image",
                "base image is not set",
            ))
        }
    }

    let target = build
        .target_image
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| StratumError::validation("/target_image/name", "target image is not set"))?;
    if !is_valid_image_name(target) {
        return Err(StratumError::validation(
            "/target_image/name",
            format!("'{}' is not a valid image name", target),
        ));
    }
    Ok(())
}

/// `[registry[:port]/]name[:tag]` with a lowercase name
fn is_valid_image_name(name: &str) -> bool {
    let pattern = r"^([A-Za-z0-9.-]+(:[0-9]+)?/)?[a-z0-9]+([._/-]+[a-z0-9]+)*(:[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?$";
    Regex::new(pattern).map(|re| re.is_match(name)).unwrap_or(false)
}
