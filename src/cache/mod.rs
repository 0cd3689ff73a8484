//! Layer cache engine
//!
//! Every executed unit of work is snapshotted into an image, and the index
//! maps `(base image id, content fingerprint)` to that image. A later build
//! arriving at the same base with the same step can skip the step and
//! continue from the cached image.
//!
//! # Decisions
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | `cache_tasks` off | Disabled, step runs |
//! | no index entry | Miss, step runs |
//! | entry whose image is gone | Miss (stale), step runs |
//! | entry with image present | Hit, container swapped, step skipped |

pub mod fingerprint;

pub use fingerprint::fingerprint;

use crate::build::{Build, Layer};
use crate::error::{StratumError, StratumResult};
use crate::orchestration::ContainerBuilder;
use crate::store::Database;
use tracing::{debug, info, warn};

/// Outcome of a cache lookup before running a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    /// The step can be skipped; the working container now runs on `layer_id`
    Hit { layer_id: String },
    Miss,
    /// Cache lookups are turned off for this build
    Disabled,
}

impl CacheDecision {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }
}

/// Cache operations for one build, backed by the store and a container builder
pub struct LayerCache<'a> {
    db: &'a Database,
    builder: &'a dyn ContainerBuilder,
}

impl<'a> LayerCache<'a> {
    pub fn new(db: &'a Database, builder: &'a dyn ContainerBuilder) -> Self {
        Self { db, builder }
    }

    /// Look up `content` on top of the build's current top layer.
    ///
    /// On a hit the working container is recreated from the cached layer;
    /// the layer itself is recorded once the step's result comes back.
    pub async fn maybe_load_from_cache(
        &self,
        build_id: &str,
        content: &str,
    ) -> StratumResult<CacheDecision> {
        let build = self.db.get_build(build_id).await?;
        if !build.cache_tasks {
            debug!("Caching is disabled for build {}", build_id);
            return Ok(CacheDecision::Disabled);
        }

        let base = self.top_of_chain(&build).await?;
        let Some(layer_id) = self.present_layer(content, &base).await? else {
            return Ok(CacheDecision::Miss);
        };

        self.builder
            .swap_working_container(&build, &layer_id)
            .await?;
        info!("Loaded from cache: {}", layer_id);
        Ok(CacheDecision::Hit { layer_id })
    }

    /// Record a step the executor skipped; no snapshot is taken.
    ///
    /// If the index holds a present image for the step on top of the current
    /// chain (the step was skipped because of a cache hit), the layer is that
    /// image and counts as cached. With caching off the container was never
    /// swapped, so the chain stays on the current top.
    pub async fn record_progress(&self, build_id: &str, content: &str) -> StratumResult<Layer> {
        let build = self.db.get_build(build_id).await?;
        let top = self.top_of_chain(&build).await?;

        let (layer_id, cached) = if !build.cache_tasks {
            (top, false)
        } else {
            match self.present_layer(content, &top).await? {
                Some(layer_id) => (layer_id, true),
                None => (top, false),
            }
        };
        self.append_layer(build_id, Some(content.to_string()), layer_id, cached)
            .await
    }

    /// Treat an unchanged file action as a hit if the index knows its result.
    ///
    /// Returns `None` when caching is off or nothing usable is cached.
    pub async fn load_unchanged(&self, build_id: &str, content: &str) -> StratumResult<Option<Layer>> {
        match self.maybe_load_from_cache(build_id, content).await? {
            CacheDecision::Hit { layer_id } => self
                .append_layer(build_id, Some(content.to_string()), layer_id, true)
                .await
                .map(Some),
            CacheDecision::Miss | CacheDecision::Disabled => Ok(None),
        }
    }

    /// Snapshot the working container after a freshly executed step and
    /// index the result
    pub async fn cache_task_result(&self, build_id: &str, content: &str) -> StratumResult<Layer> {
        let build = self.db.get_build(build_id).await?;
        let layer_id = self.builder.commit(&build, None, false).await?;

        let layer = self
            .append_layer(build_id, Some(content.to_string()), layer_id, false)
            .await?;
        let base = layer.base_image_id.as_deref().ok_or_else(|| {
            StratumError::Internal(format!("layer {} has no base", layer.layer_id))
        })?;
        self.db.save_layer(&layer.layer_id, base, content).await?;
        info!("Caching the task result in layer {}", layer.layer_id);
        Ok(layer)
    }

    /// Layer id the next step builds on
    async fn top_of_chain(&self, build: &Build) -> StratumResult<String> {
        if let Some(top) = build.top_layer_id() {
            return Ok(top.to_string());
        }
        let base_image = build
            .base_image
            .as_deref()
            .ok_or_else(|| StratumError::validation("/base_image", "base image is not set"))?;
        self.builder.get_image_id(base_image).await
    }

    /// Cached layer for `(base, content)` whose image still exists
    async fn present_layer(&self, content: &str, base: &str) -> StratumResult<Option<String>> {
        let Some(layer_id) = self.db.get_cached_layer(content, base).await? else {
            debug!("No cache entry for {} on top of {}", short(content), base);
            return Ok(None);
        };
        if !self.builder.is_image_present(&layer_id).await? {
            warn!(
                "Cached layer {} is no longer present in container storage, ignoring it",
                layer_id
            );
            return Ok(None);
        }
        Ok(Some(layer_id))
    }

    async fn append_layer(
        &self,
        build_id: &str,
        content: Option<String>,
        layer_id: String,
        cached: bool,
    ) -> StratumResult<Layer> {
        let build = self
            .db
            .modify_build(build_id, |b| {
                b.record_layer(content, layer_id, cached);
                Ok(())
            })
            .await?;
        build
            .layers
            .last()
            .cloned()
            .ok_or_else(|| StratumError::Internal("layer was not recorded".to_string()))
    }
}

fn short(content: &str) -> &str {
    &content[..content.len().min(12)]
}
