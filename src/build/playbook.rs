//! Build configuration embedded in a playbook
//!
//! The first play of a playbook may carry a `vars.ansible_bender` mapping:
//!
//! ```yaml
//! - hosts: all
//!   vars:
//!     ansible_bender:
//!       base_image: fedora:40
//!       target_image:
//!         name: my-app
//!         cmd: /usr/bin/app
//!         environment: { APP_ENV: prod }
//!       working_container:
//!         volumes: ["/src:/src:Z"]
//!   tasks: [...]
//! ```
//!
//! Values are taken verbatim; Jinja templates are not expanded.

use crate::build::record::{Build, ImageMetadata};
use crate::error::{StratumError, StratumResult};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Name of the play variable holding the build configuration
pub const BENDER_VARS_KEY: &str = "ansible_bender";

/// Expected shape of a configuration value
#[derive(Debug, Clone, Copy)]
enum Kind {
    Str,
    Bool,
    StrList,
    /// Mapping of string keys to scalar values
    ScalarMap,
    Object(&'static [(&'static str, Kind)]),
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Bool => "boolean",
            Self::StrList => "array",
            Self::ScalarMap | Self::Object(_) => "object",
        }
    }
}

const TARGET_IMAGE: &[(&str, Kind)] = &[
    ("name", Kind::Str),
    ("environment", Kind::ScalarMap),
    ("labels", Kind::ScalarMap),
    ("annotations", Kind::ScalarMap),
    ("working_dir", Kind::Str),
    ("cmd", Kind::Str),
    ("entrypoint", Kind::Str),
    ("user", Kind::Str),
    ("ports", Kind::StrList),
    ("volumes", Kind::StrList),
];

const WORKING_CONTAINER: &[(&str, Kind)] = &[("volumes", Kind::StrList), ("user", Kind::Str)];

const BENDER_VARS: &[(&str, Kind)] = &[
    ("base_image", Kind::Str),
    ("target_image", Kind::Object(TARGET_IMAGE)),
    ("working_container", Kind::Object(WORKING_CONTAINER)),
    ("cache_tasks", Kind::Bool),
    ("layering", Kind::Bool),
    ("squash", Kind::Bool),
    ("ansible_extra_args", Kind::Str),
    ("buildah_from_extra_args", Kind::Str),
];

/// Read a playbook and configure `build` from its variables
pub async fn build_from_playbook(path: &Path, mut build: Build) -> StratumResult<Build> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StratumError::io(format!("reading playbook {}", path.display()), e))?;

    build.playbook_path = Some(path.to_path_buf());

    if let Some(vars) = extract_bender_vars(path, &content)? {
        apply_bender_vars(&mut build, &vars)?;
    } else {
        info!("No {} variables found in {}", BENDER_VARS_KEY, path.display());
    }

    Ok(build)
}

/// Find the configuration mapping in the first play
fn extract_bender_vars(path: &Path, content: &str) -> StratumResult<Option<Value>> {
    let doc: Value = serde_yaml::from_str(content).map_err(|e| StratumError::PlaybookInvalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let plays = doc.as_sequence().ok_or_else(|| StratumError::PlaybookInvalid {
        path: path.to_path_buf(),
        reason: "a playbook has to be a list of plays".to_string(),
    })?;

    let first = plays.first().ok_or_else(|| StratumError::PlaybookInvalid {
        path: path.to_path_buf(),
        reason: "can't access the first play".to_string(),
    })?;

    if plays[1..].iter().any(|p| bender_vars_of(p).is_some()) {
        warn!("Variables are loaded only from the first play");
    }

    Ok(bender_vars_of(first).cloned())
}

fn bender_vars_of(play: &Value) -> Option<&Value> {
    play.get("vars")?.get(BENDER_VARS_KEY)
}

/// Validate the configuration mapping and apply it to the build
pub fn apply_bender_vars(build: &mut Build, vars: &Value) -> StratumResult<()> {
    validate(vars, Kind::Object(BENDER_VARS), "")?;
    debug!("Applying playbook variables: {:?}", vars);

    if let Some(image) = str_at(vars, &["base_image"]) {
        build.base_image = Some(image);
    }
    if let Some(name) = str_at(vars, &["target_image", "name"]) {
        build.target_image = Some(name);
    }
    build
        .build_volumes
        .extend(list_at(vars, &["working_container", "volumes"]));
    if let Some(user) = str_at(vars, &["working_container", "user"]) {
        build.build_user = Some(user);
    }
    if let Some(v) = bool_at(vars, &["cache_tasks"]) {
        build.cache_tasks = v;
    }
    if let Some(v) = bool_at(vars, &["layering"]) {
        build.layering = v;
    }
    if let Some(v) = bool_at(vars, &["squash"]) {
        build.squash = v;
    }
    build.ansible_extra_args = str_at(vars, &["ansible_extra_args"]);
    build.buildah_from_extra_args = str_at(vars, &["buildah_from_extra_args"]);

    if let Some(target) = vars.get("target_image") {
        apply_target_image(&mut build.metadata, target);
    }
    Ok(())
}

fn apply_target_image(metadata: &mut ImageMetadata, target: &Value) {
    metadata.working_dir = str_at(target, &["working_dir"]);
    metadata.labels.extend(map_at(target, "labels"));
    metadata.annotations.extend(map_at(target, "annotations"));
    metadata.env_vars.extend(map_at(target, "environment"));
    metadata.cmd = str_at(target, &["cmd"]);
    metadata.entrypoint = str_at(target, &["entrypoint"]);
    metadata.user = str_at(target, &["user"]);
    metadata.ports.extend(list_at(target, &["ports"]));
    metadata.volumes.extend(list_at(target, &["volumes"]));
}

fn validate(value: &Value, kind: Kind, path: &str) -> StratumResult<()> {
    let display_path = if path.is_empty() { "/" } else { path };
    let type_error = || {
        StratumError::validation(
            display_path,
            format!(
                "variable {} is set to {}, which is not of type {}",
                display_path,
                render(value),
                kind.name()
            ),
        )
    };

    match kind {
        Kind::Str if value.is_string() => Ok(()),
        Kind::Bool if value.is_bool() => Ok(()),
        Kind::StrList => {
            let items = value.as_sequence().ok_or_else(type_error)?;
            for (idx, item) in items.iter().enumerate() {
                validate(item, Kind::Str, &format!("{}/{}", path, idx))?;
            }
            Ok(())
        }
        Kind::ScalarMap => {
            let map = value.as_mapping().ok_or_else(type_error)?;
            for (k, v) in map {
                let key = key_str(k, path)?;
                if !(v.is_string() || v.is_number() || v.is_bool()) {
                    return Err(StratumError::validation(
                        format!("{}/{}", path, key),
                        format!("{} is not a scalar value", render(v)),
                    ));
                }
            }
            Ok(())
        }
        Kind::Object(fields) => {
            let map = value.as_mapping().ok_or_else(type_error)?;
            validate_object(map, fields, path)
        }
        _ => Err(type_error()),
    }
}

fn validate_object(map: &Mapping, fields: &[(&str, Kind)], path: &str) -> StratumResult<()> {
    for (k, v) in map {
        let key = key_str(k, path)?;
        let child = format!("{}/{}", path, key);
        match fields.iter().find(|(name, _)| *name == key) {
            Some((_, kind)) => validate(v, *kind, &child)?,
            None => {
                return Err(StratumError::validation(
                    child,
                    format!("additional properties are not allowed ('{}' was unexpected)", key),
                ))
            }
        }
    }
    Ok(())
}

fn key_str<'a>(key: &'a Value, path: &str) -> StratumResult<&'a str> {
    key.as_str().ok_or_else(|| {
        StratumError::validation(
            if path.is_empty() { "/" } else { path },
            format!("key {} is not a string", render(key)),
        )
    })
}

fn render(value: &Value) -> String {
    serde_yaml::to_string(value)
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| format!("{:?}", value))
}

fn lookup<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |acc, k| acc.get(*k))
}

fn str_at(value: &Value, keys: &[&str]) -> Option<String> {
    lookup(value, keys)?.as_str().map(str::to_string)
}

fn bool_at(value: &Value, keys: &[&str]) -> Option<bool> {
    lookup(value, keys)?.as_bool()
}

fn list_at(value: &Value, keys: &[&str]) -> Vec<String> {
    lookup(value, keys)
        .and_then(Value::as_sequence)
        .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn map_at(value: &Value, key: &str) -> BTreeMap<String, String> {
    let Some(map) = value.get(key).and_then(Value::as_mapping) else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let k = k.as_str()?.to_string();
            let v = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k, v))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PLAYBOOK: &str = r#"
- hosts: all
  vars:
    ansible_bender:
      base_image: docker.io/library/python:3-alpine
      target_image:
        name: my-app
        cmd: python3 -m http.server
        working_dir: /srv
        environment:
          PORT: 8080
        labels:
          built-by: stratum
        ports: ["8080"]
      working_container:
        volumes:
          - /tmp/src:/src:Z
      cache_tasks: false
  tasks:
    - name: create a file
      command: touch /srv/index.html
"#;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn reads_first_play_variables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("playbook.yaml");
        std::fs::write(&path, PLAYBOOK).unwrap();

        let build = build_from_playbook(&path, Build::new()).await.unwrap();

        assert_eq!(build.base_image.as_deref(), Some("docker.io/library/python:3-alpine"));
        assert_eq!(build.target_image.as_deref(), Some("my-app"));
        assert_eq!(build.build_volumes, vec!["/tmp/src:/src:Z"]);
        assert!(!build.cache_tasks);
        assert!(build.layering);
        assert_eq!(build.metadata.working_dir.as_deref(), Some("/srv"));
        assert_eq!(build.metadata.env_vars["PORT"], "8080");
        assert_eq!(build.metadata.labels["built-by"], "stratum");
        assert_eq!(build.metadata.ports, vec!["8080"]);
        assert_eq!(build.playbook_path.as_deref(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn playbook_without_variables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("playbook.yaml");
        std::fs::write(&path, "- hosts: all\n  tasks: []\n").unwrap();

        let build = build_from_playbook(&path, Build::new()).await.unwrap();
        assert!(build.base_image.is_none());
        assert!(build.cache_tasks);
    }

    #[tokio::test]
    async fn rejects_non_list_playbook() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("playbook.yaml");
        std::fs::write(&path, "hosts: all\n").unwrap();

        let err = build_from_playbook(&path, Build::new()).await.unwrap_err();
        assert!(matches!(err, StratumError::PlaybookInvalid { .. }));
    }

    #[test]
    fn wrong_type_reports_path() {
        let vars = parse("target_image:\n  name: 42\n");
        let err = apply_bender_vars(&mut Build::new(), &vars).unwrap_err();

        match err {
            StratumError::Validation { path, reason } => {
                assert_eq!(path, "/target_image/name");
                assert!(reason.contains("not of type string"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        let vars = parse("base_image: fedora\nfoo: bar\n");
        let err = apply_bender_vars(&mut Build::new(), &vars).unwrap_err();

        match err {
            StratumError::Validation { path, reason } => {
                assert_eq!(path, "/foo");
                assert!(reason.contains("'foo' was unexpected"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn list_items_are_checked() {
        let vars = parse("working_container:\n  volumes: [\"/a:/b\", {src: x}]\n");
        let err = apply_bender_vars(&mut Build::new(), &vars).unwrap_err();
        assert!(matches!(err, StratumError::Validation { ref path, .. } if path == "/working_container/volumes/1"));
    }

    #[test]
    fn layering_and_squash_flags() {
        let vars = parse("layering: false\nsquash: true\n");
        let mut build = Build::new();
        apply_bender_vars(&mut build, &vars).unwrap();
        assert!(!build.layering);
        assert!(build.squash);
    }
}
