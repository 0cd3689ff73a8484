//! Step interceptor
//!
//! `ansible-playbook` calls back into `stratum hook` before and after every
//! task. Each call runs in its own process, so the build is reloaded from the
//! store every time; the interceptor never trusts an in-memory copy.

use crate::build::BuildState;
use crate::cache::{fingerprint, CacheDecision, LayerCache};
use crate::error::{StratumError, StratumResult};
use crate::orchestration::ContainerBuilder;
use crate::store::{Database, StateUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

/// Tag disabling cache lookups from the tagged task on
pub const NO_CACHE_TAG: &str = "no-cache";

/// Tag disabling snapshots and caching from the tagged task on
pub const STOP_LAYERING_TAG: &str = "stop-layering";

/// Actions whose effect depends on files outside the task definition
pub const FILE_ACTIONS: &[&str] = &["file", "copy", "synchronize", "unarchive", "template"];

/// Fact gathering is never cached nor snapshotted
const SETUP_ACTION: &str = "setup";

/// How the executor reported a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Changed,
    Ok,
    Skipped,
    Failed,
}

/// Task event sent by the callback plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub action: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Task definition as written in the playbook
    #[serde(default)]
    pub definition: Value,
    /// Only set for task results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TaskOutcome>,
    #[serde(default)]
    pub rc: i64,
}

impl TaskEvent {
    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    fn is_file_action(&self) -> bool {
        FILE_ACTIONS.contains(&self.action.as_str())
    }

    fn is_setup(&self) -> bool {
        self.action == SETUP_ACTION
    }
}

/// Reply to the callback plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookResponse {
    /// Skip the task
    pub skip: bool,
    /// Line to print in the playbook output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HookResponse {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            skip: true,
            message: Some(message.into()),
        }
    }

    fn note(message: impl Into<String>) -> Self {
        Self {
            skip: false,
            message: Some(message.into()),
        }
    }
}

/// Cache-aware hooks around the executor's tasks
pub struct StepInterceptor<'a> {
    db: &'a Database,
    cache: LayerCache<'a>,
}

impl<'a> StepInterceptor<'a> {
    pub fn new(db: &'a Database, builder: &'a dyn ContainerBuilder) -> Self {
        Self {
            db,
            cache: LayerCache::new(db, builder),
        }
    }

    /// Decide whether a task about to start can be served from cache.
    ///
    /// Errors fail the build and skip the task.
    pub async fn task_start(&self, build_id: &str, event: &TaskEvent) -> HookResponse {
        match self.try_task_start(build_id, event).await {
            Ok(response) => response,
            Err(e) => self.abort(build_id, e).await,
        }
    }

    /// Record a finished task, snapshotting the container if needed.
    ///
    /// Errors fail the build.
    pub async fn task_result(&self, build_id: &str, event: &TaskEvent) -> HookResponse {
        match self.try_task_result(build_id, event).await {
            Ok(response) => response,
            Err(e) => self.abort(build_id, e).await,
        }
    }

    async fn try_task_start(&self, build_id: &str, event: &TaskEvent) -> StratumResult<HookResponse> {
        if event.is_setup() {
            return Ok(HookResponse::proceed());
        }
        let build = self.db.get_build(build_id).await?;
        if build.is_failed() {
            return Ok(HookResponse::skip("build failed, skipping the task"));
        }
        if event.has_tag(STOP_LAYERING_TAG) {
            self.stop_layering(build_id).await?;
            return Ok(HookResponse::note(format!(
                "detected tag '{}', tasks won't be cached nor layered any more",
                STOP_LAYERING_TAG
            )));
        }
        if event.has_tag(NO_CACHE_TAG) {
            self.db
                .modify_build(build_id, |b| {
                    b.cache_tasks = false;
                    Ok(())
                })
                .await?;
            return Ok(HookResponse::note(format!(
                "detected tag '{}': won't load from cache from now",
                NO_CACHE_TAG
            )));
        }
        if !build.was_last_layer_cached() {
            debug!("Previous layer was not cached, running the task");
            return Ok(HookResponse::proceed());
        }
        if event.is_file_action() {
            debug!("{} is a file action, running the task", event.action);
            return Ok(HookResponse::proceed());
        }
        if !build.is_layering_on() {
            return Ok(HookResponse::proceed());
        }

        let content = fingerprint(&event.definition)?;
        match self.cache.maybe_load_from_cache(build_id, &content).await? {
            CacheDecision::Hit { layer_id } => {
                Ok(HookResponse::skip(format!("loaded from cache: '{}'", layer_id)))
            }
            CacheDecision::Miss | CacheDecision::Disabled => Ok(HookResponse::proceed()),
        }
    }

    async fn try_task_result(&self, build_id: &str, event: &TaskEvent) -> StratumResult<HookResponse> {
        if event.is_setup() || event.outcome == Some(TaskOutcome::Failed) || event.rc > 0 {
            return Ok(HookResponse::proceed());
        }
        let build = self.db.get_build(build_id).await?;
        if build.is_failed() {
            return Ok(HookResponse::proceed());
        }
        if event.has_tag(STOP_LAYERING_TAG) {
            self.stop_layering(build_id).await?;
            return Ok(HookResponse::proceed());
        }
        if !build.is_layering_on() {
            return Ok(HookResponse::proceed());
        }

        let content = fingerprint(&event.definition)?;

        if event.outcome == Some(TaskOutcome::Skipped) {
            let layer = self.cache.record_progress(build_id, &content).await?;
            debug!("Recorded skipped task as {}", layer);
            return Ok(HookResponse::proceed());
        }

        if event.is_file_action() && event.outcome != Some(TaskOutcome::Changed) {
            if let Some(layer) = self.cache.load_unchanged(build_id, &content).await? {
                return Ok(HookResponse::note(format!(
                    "loaded from cache: '{}'",
                    layer.layer_id
                )));
            }
        }

        let layer = self.cache.cache_task_result(build_id, &content).await?;
        Ok(HookResponse::note(format!(
            "caching the task result in layer '{}'",
            layer.layer_id
        )))
    }

    async fn stop_layering(&self, build_id: &str) -> StratumResult<()> {
        info!("Layering stopped for build {}", build_id);
        self.db
            .modify_build(build_id, |b| {
                b.stop_layering();
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn abort(&self, build_id: &str, err: StratumError) -> HookResponse {
        error!("Error while running the build: {}", err);
        if let Err(e) = self
            .db
            .update_build(build_id, StateUpdate::to(BuildState::Failed))
            .await
        {
            error!("Unable to mark build {} as failed: {}", build_id, e);
        }
        HookResponse::skip(format!("stratum: {}", err))
    }
}
