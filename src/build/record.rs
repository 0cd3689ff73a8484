//! Build record and layer history

use crate::error::{StratumError, StratumResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Fixed, lexically sortable timestamp format used in the store
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S%6f";

/// Same as [`TIMESTAMP_FORMAT`] without separators, safe for resource names
pub const TIMESTAMP_FORMAT_TOGETHER: &str = "%Y%m%d%H%M%S%6f";

/// Build lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    New,
    InProgress,
    Done,
    Failed,
}

impl BuildState {
    /// Terminal states can't transition anymore
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata baked into the target image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageMetadata {
    /// Default working directory
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub env_vars: BTreeMap<String, String>,
    /// Default command
    pub cmd: Option<String>,
    pub entrypoint: Option<String>,
    /// User the container is invoked with by default
    pub user: Option<String>,
    /// Ports exposed by default
    pub ports: Vec<String>,
    /// Paths inside the container holding data stored outside of it
    pub volumes: Vec<String>,
}

impl ImageMetadata {
    /// Whether any of the settings that are only applied at commit time are present
    pub fn has_commit_settings(&self) -> bool {
        self.user.is_some()
            || self.cmd.is_some()
            || self.entrypoint.is_some()
            || !self.volumes.is_empty()
    }
}

/// One filesystem snapshot taken during a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    /// Fingerprint of the task which produced this layer
    pub content: Option<String>,
    /// Image ID assigned by the container builder
    pub layer_id: String,
    /// Layer this one was built on top of
    pub base_image_id: Option<String>,
    /// Loaded from cache rather than freshly produced
    pub cached: bool,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer_id={} cached={}", self.layer_id, self.cached)
    }
}

/// A single build attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    /// Assigned by the store on first persist
    pub build_id: Option<String>,
    pub playbook_path: Option<PathBuf>,
    /// Bind mounts for the working container ("/host:/container")
    #[serde(default)]
    pub build_volumes: Vec<String>,
    /// User to run tasks as inside the working container
    pub build_user: Option<String>,
    #[serde(default)]
    pub metadata: ImageMetadata,
    pub state: BuildState,
    #[serde(default, with = "timestamp")]
    pub build_start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub build_finished_time: Option<DateTime<Utc>>,
    pub base_image: Option<String>,
    /// Name of the working container
    pub build_container: Option<String>,
    pub target_image: Option<String>,
    pub builder_name: String,
    #[serde(default)]
    pub layers: Vec<Layer>,
    /// The built image: filesystem content plus metadata
    pub final_layer_id: Option<String>,
    #[serde(default)]
    pub layer_index: BTreeMap<String, Layer>,
    pub cache_tasks: bool,
    #[serde(default)]
    pub log_lines: Vec<String>,
    pub layering: bool,
    #[serde(default)]
    pub squash: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub verbose: bool,
    /// Whether the base image had to be pulled
    #[serde(default)]
    pub pulled: bool,
    pub ansible_extra_args: Option<String>,
    pub buildah_from_extra_args: Option<String>,
    pub python_interpreter: Option<String>,
}

impl Default for Build {
    fn default() -> Self {
        Self {
            build_id: None,
            playbook_path: None,
            build_volumes: vec![],
            build_user: None,
            metadata: ImageMetadata::default(),
            state: BuildState::New,
            build_start_time: None,
            build_finished_time: None,
            base_image: None,
            build_container: None,
            target_image: None,
            builder_name: "buildah".to_string(),
            layers: vec![],
            final_layer_id: None,
            layer_index: BTreeMap::new(),
            cache_tasks: true,
            log_lines: vec![],
            layering: true,
            squash: false,
            debug: false,
            verbose: false,
            pulled: false,
            ansible_extra_args: None,
            buildah_from_extra_args: None,
            python_interpreter: None,
        }
    }
}

impl Build {
    /// Create an empty build in state `New`
    pub fn new() -> Self {
        Self::default()
    }

    /// Build ID, or an error for a build which was never persisted
    pub fn id(&self) -> StratumResult<&str> {
        self.build_id
            .as_deref()
            .ok_or_else(|| StratumError::Internal("build has not been recorded yet".to_string()))
    }

    /// Name of the working container
    pub fn container_name(&self) -> StratumResult<&str> {
        self.build_container
            .as_deref()
            .ok_or_else(|| StratumError::Internal("build has no working container".to_string()))
    }

    /// Append a layer on top of the current chain; its base is the current top
    pub fn record_layer(&mut self, content: Option<String>, layer_id: String, cached: bool) -> &Layer {
        let layer = Layer {
            content,
            base_image_id: self.top_layer_id().map(str::to_string),
            layer_id,
            cached,
        };
        self.layer_index.insert(layer.layer_id.clone(), layer.clone());
        self.layers.push(layer);
        &self.layers[self.layers.len() - 1]
    }

    /// ID of the layer the next task builds on top of
    pub fn top_layer_id(&self) -> Option<&str> {
        self.layers.last().map(|l| l.layer_id.as_str())
    }

    /// Whether the most recent layer was served from cache
    pub fn was_last_layer_cached(&self) -> bool {
        self.layers.last().is_some_and(|l| l.cached)
    }

    /// Rebuild `layer_index` from `layers`, which is the source of truth
    pub fn reindex_layers(&mut self) {
        self.layer_index = self
            .layers
            .iter()
            .map(|l| (l.layer_id.clone(), l.clone()))
            .collect();
    }

    /// ID of the built image; only available once the build finished
    pub fn target_image_id(&self) -> StratumResult<&str> {
        if !self.state.is_terminal() {
            return Err(StratumError::BuildNotFinished {
                build_id: self.build_id.clone().unwrap_or_default(),
                state: self.state.to_string(),
            });
        }
        self.final_layer_id
            .as_deref()
            .ok_or_else(|| StratumError::ImageNotFound(self.target_image.clone().unwrap_or_default()))
    }

    /// Disable snapshotting and caching for the rest of the build
    pub fn stop_layering(&mut self) {
        self.layering = false;
    }

    pub fn is_layering_on(&self) -> bool {
        self.layering
    }

    pub fn is_failed(&self) -> bool {
        self.state == BuildState::Failed
    }

    /// Name of the image holding a failed build's progress
    pub fn failed_image_name(&self) -> Option<String> {
        self.target_image.as_ref().map(|t| format!("{}-failed", t))
    }

    /// Wall-clock duration of a finished build
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.build_start_time, self.build_finished_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Generate a working container name derived from the target image
pub fn generate_container_name(target_image: Option<&str>) -> String {
    let base = target_image
        .map(|t| t.rsplit('/').next().unwrap_or(t))
        .map(|t| t.split(':').next().unwrap_or(t))
        .filter(|t| !t.is_empty())
        .unwrap_or("stratum");
    let sanitized: String = base
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!(
        "{}-{}-cont",
        sanitized,
        Utc::now().format(TIMESTAMP_FORMAT_TOGETHER)
    )
}

/// Serde adapter for optional timestamps in [`TIMESTAMP_FORMAT`]
mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.format(TIMESTAMP_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
                .map(|naive| naive.and_utc())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
