//! JSON-file backed database

use crate::build::record::{generate_container_name, Build, BuildState};
use crate::error::{StratumError, StratumResult};
use crate::store::lock::StoreLock;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Name of the store file inside the data directory
pub const DB_FILE_NAME: &str = "db.json";

/// Name of the lock marker inside the data directory
pub const LOCK_FILE_NAME: &str = "stratum.pid";

/// Subdirectory created inside the resolved runtime directory
const DATA_SUBDIR: &str = "stratum";

/// On-disk root object
#[derive(Debug, Serialize, Deserialize)]
struct StoreData {
    next_build_id: u64,
    builds: BTreeMap<String, Build>,
    /// base image id -> step fingerprint -> produced layer
    store: BTreeMap<String, BTreeMap<String, CacheEntry>>,
    /// base image id -> python interpreter path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    interpreters: BTreeMap<String, String>,
}

impl Default for StoreData {
    fn default() -> Self {
        Self {
            next_build_id: 1,
            builds: BTreeMap::new(),
            store: BTreeMap::new(),
            interpreters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    image_id: String,
}

/// Lifecycle change applied while persisting a build
#[derive(Debug, Clone, Copy, Default)]
pub struct StateUpdate {
    pub state: Option<BuildState>,
    pub set_finish_time: bool,
}

impl StateUpdate {
    /// Leave lifecycle fields untouched
    pub fn none() -> Self {
        Self::default()
    }

    /// Transition to `state`
    pub fn to(state: BuildState) -> Self {
        Self {
            state: Some(state),
            set_finish_time: false,
        }
    }

    /// Transition to `state` and stamp the finish time
    pub fn finish(state: BuildState) -> Self {
        Self {
            state: Some(state),
            set_finish_time: true,
        }
    }

    fn apply(&self, build: &mut Build) {
        if let Some(state) = self.state {
            build.state = state;
        }
        if self.set_finish_time {
            build.build_finished_time = Some(Utc::now());
        }
    }
}

/// Find the directory holding runtime data.
///
/// Candidates are tried in order: `explicit`, `$XDG_RUNTIME_DIR`, `~/.cache`
/// and `/var/tmp`; the first existing directory wins.
pub fn resolve_runtime_dir(explicit: Option<&Path>) -> StratumResult<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Some(xdg) = std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        candidates.push(PathBuf::from(xdg));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".cache"));
    }
    candidates.push(PathBuf::from("/var/tmp"));

    candidates
        .iter()
        .find(|c| c.is_dir())
        .cloned()
        .ok_or_else(|| StratumError::RuntimeDirNotFound {
            tried: candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
}

/// Handle to the store; cheap to clone, every operation locks the file
#[derive(Debug, Clone)]
pub struct Database {
    runtime_dir: PathBuf,
    dir: PathBuf,
    db_path: PathBuf,
    lock_path: PathBuf,
}

impl Database {
    /// Open the store under the resolved runtime directory
    pub fn new(runtime_dir: Option<&Path>) -> StratumResult<Self> {
        let root = resolve_runtime_dir(runtime_dir)?;
        let dir = root.join(DATA_SUBDIR);

        std::fs::create_dir_all(&dir)
            .map_err(|e| StratumError::io(format!("creating data directory {}", dir.display()), e))?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| StratumError::io(format!("setting permissions on {}", dir.display()), e))?;

        debug!("Using store directory {}", dir.display());
        Ok(Self {
            db_path: dir.join(DB_FILE_NAME),
            lock_path: dir.join(LOCK_FILE_NAME),
            dir,
            runtime_dir: root,
        })
    }

    /// Resolved runtime directory; opening it again yields the same store
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Directory holding the store file and lock
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Take the store lock for the lifetime of the returned guard
    pub async fn acquire(&self) -> StratumResult<StoreLock> {
        StoreLock::acquire(&self.lock_path).await
    }

    /// Persist `build`, assigning an id and container name on its first save.
    ///
    /// The stored copy is written back into `build`.
    pub async fn record_build(&self, build: &mut Build, update: StateUpdate) -> StratumResult<()> {
        let stored = self
            .transact(|data| {
                let mut b = build.clone();
                update.apply(&mut b);
                let id = match b.build_id.clone() {
                    Some(id) => id,
                    None => {
                        let id = data.next_build_id.to_string();
                        data.next_build_id += 1;
                        b.build_id = Some(id.clone());
                        id
                    }
                };
                if b.build_container.is_none() {
                    b.build_container = Some(generate_container_name(b.target_image.as_deref()));
                }
                data.builds.insert(id, b.clone());
                Ok(b)
            })
            .await?;

        info!("Recorded build {} ({})", stored.build_id.as_deref().unwrap_or("?"), stored.state);
        *build = stored;
        Ok(())
    }

    /// Reload a build by id, apply a lifecycle change and save it
    pub async fn update_build(&self, build_id: &str, update: StateUpdate) -> StratumResult<Build> {
        self.modify_build(build_id, |b| {
            update.apply(b);
            Ok(())
        })
        .await
    }

    /// Reload a build by id, mutate it and save it; nothing is saved if `f` fails
    pub async fn modify_build<F>(&self, build_id: &str, f: F) -> StratumResult<Build>
    where
        F: FnOnce(&mut Build) -> StratumResult<()> + Send,
    {
        self.transact(|data| {
            let build = data
                .builds
                .get_mut(build_id)
                .ok_or_else(|| StratumError::BuildNotFound(build_id.to_string()))?;
            build.reindex_layers();
            f(build)?;
            Ok(build.clone())
        })
        .await
    }

    pub async fn get_build(&self, build_id: &str) -> StratumResult<Build> {
        self.read(|data| {
            let mut build = data
                .builds
                .get(build_id)
                .cloned()
                .ok_or_else(|| StratumError::BuildNotFound(build_id.to_string()))?;
            build.reindex_layers();
            Ok(build)
        })
        .await
    }

    /// Build with the highest numeric id
    pub async fn get_latest_build(&self) -> StratumResult<Build> {
        self.read(|data| {
            let mut build = data
                .builds
                .iter()
                .max_by_key(|(id, _)| id.parse::<u64>().unwrap_or(0))
                .map(|(_, b)| b.clone())
                .ok_or(StratumError::NoBuilds)?;
            build.reindex_layers();
            Ok(build)
        })
        .await
    }

    /// All builds ordered by id
    pub async fn load_builds(&self) -> StratumResult<Vec<Build>> {
        self.read(|data| {
            let mut builds: Vec<Build> = data.builds.values().cloned().collect();
            builds.sort_by_key(|b| {
                b.build_id
                    .as_deref()
                    .and_then(|id| id.parse::<u64>().ok())
                    .unwrap_or(0)
            });
            Ok(builds)
        })
        .await
    }

    /// Build by id, or the latest one
    pub async fn get_build_or_latest(&self, build_id: Option<&str>) -> StratumResult<Build> {
        match build_id {
            Some(id) => self.get_build(id).await,
            None => self.get_latest_build().await,
        }
    }

    /// Remember that running `content` on top of `base_image_id` produced `layer_id`
    pub async fn save_layer(&self, layer_id: &str, base_image_id: &str, content: &str) -> StratumResult<()> {
        self.transact(|data| {
            data.store
                .entry(base_image_id.to_string())
                .or_default()
                .insert(
                    content.to_string(),
                    CacheEntry {
                        image_id: layer_id.to_string(),
                    },
                );
            Ok(())
        })
        .await?;
        debug!("Cached layer {} for base {}", layer_id, base_image_id);
        Ok(())
    }

    /// Layer previously produced by `content` on top of `base_image_id`
    pub async fn get_cached_layer(&self, content: &str, base_image_id: &str) -> StratumResult<Option<String>> {
        self.read(|data| {
            Ok(data
                .store
                .get(base_image_id)
                .and_then(|m| m.get(content))
                .map(|e| e.image_id.clone()))
        })
        .await
    }

    pub async fn get_cached_interpreter(&self, base_image_id: &str) -> StratumResult<Option<String>> {
        self.read(|data| Ok(data.interpreters.get(base_image_id).cloned()))
            .await
    }

    pub async fn save_interpreter(&self, base_image_id: &str, interpreter: &str) -> StratumResult<()> {
        self.transact(|data| {
            data.interpreters
                .insert(base_image_id.to_string(), interpreter.to_string());
            Ok(())
        })
        .await
    }

    /// Run `f` against the loaded store under lock, without saving
    async fn read<T, F>(&self, f: F) -> StratumResult<T>
    where
        F: FnOnce(&StoreData) -> StratumResult<T> + Send,
    {
        let _lock = self.acquire().await?;
        let data = self.load().await?;
        f(&data)
    }

    /// Locked read-modify-write; the store is saved only if `f` succeeds
    async fn transact<T, F>(&self, f: F) -> StratumResult<T>
    where
        F: FnOnce(&mut StoreData) -> StratumResult<T> + Send,
    {
        let _lock = self.acquire().await?;
        let mut data = self.load().await?;
        let result = f(&mut data)?;
        self.save(&data).await?;
        Ok(result)
    }

    async fn load(&self) -> StratumResult<StoreData> {
        let content = match fs::read_to_string(&self.db_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreData::default()),
            Err(e) => {
                return Err(StratumError::io(
                    format!("reading store {}", self.db_path.display()),
                    e,
                ))
            }
        };
        serde_json::from_str(&content).map_err(|e| StratumError::StoreCorrupted {
            path: self.db_path.clone(),
            reason: e.to_string(),
        })
    }

    async fn save(&self, data: &StoreData) -> StratumResult<()> {
        let content = serde_json::to_string_pretty(data)?;
        let tmp = self.db_path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| StratumError::io(format!("writing store {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.db_path)
            .await
            .map_err(|e| StratumError::io(format!("replacing store {}", self.db_path.display()), e))
    }
}
