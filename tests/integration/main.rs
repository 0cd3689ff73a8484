//! Integration tests for Stratum

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use stratum::build::{Build, BuildState};
    use stratum::store::{Database, StateUpdate};
    use tempfile::TempDir;

    fn stratum() -> Command {
        let mut cmd = cargo_bin_cmd!("stratum");
        cmd.env_remove("STRATUM_BUILD_ID")
            .env_remove("STRATUM_DB_PATH")
            .env_remove("STRATUM_CONFIG");
        cmd
    }

    async fn recorded_build(dir: &TempDir, state: BuildState) -> String {
        let db = Database::new(Some(dir.path())).unwrap();
        let mut build = Build::new();
        build.base_image = Some("fedora:40".to_string());
        build.target_image = Some("app".to_string());
        build.log_lines = vec!["PLAY [all]".to_string(), "TASK [one]".to_string()];
        db.record_build(&mut build, StateUpdate::finish(state))
            .await
            .unwrap();
        build.build_id.unwrap()
    }

    #[test]
    fn help_displays() {
        stratum()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("container images from Ansible playbooks"));
    }

    #[test]
    fn version_displays() {
        stratum()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("stratum"));
    }

    #[test]
    fn list_builds_empty() {
        let tmp = TempDir::new().unwrap();
        stratum()
            .arg("list-builds")
            .arg("--database-dir")
            .arg(tmp.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("No builds yet"));

        stratum()
            .args(["list-builds", "--format", "json", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .success()
            .stdout(predicate::str::diff("[]\n"));
    }

    #[tokio::test]
    async fn list_builds_and_logs() {
        let tmp = TempDir::new().unwrap();
        let id = recorded_build(&tmp, BuildState::Done).await;

        stratum()
            .args(["list-builds", "--format", "plain", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .success()
            .stdout(predicate::str::diff(format!("{}\n", id)));

        stratum()
            .args(["get-logs", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("TASK [one]"));

        stratum()
            .args(["inspect", &id, "--json", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("\"target_image\": \"app\""));
    }

    #[test]
    fn get_logs_missing_build() {
        let tmp = TempDir::new().unwrap();
        stratum()
            .args(["get-logs", "42", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Build not found: 42"));

        stratum()
            .args(["get-logs", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("No builds recorded yet"));
    }

    #[tokio::test]
    async fn push_unfinished_build_fails() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(Some(tmp.path())).unwrap();
        let mut build = Build::new();
        build.target_image = Some("app".to_string());
        db.record_build(&mut build, StateUpdate::to(BuildState::InProgress))
            .await
            .unwrap();

        stratum()
            .args(["push", "docker://quay.io/org/app", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("has not finished yet"));
    }

    #[test]
    fn build_missing_playbook() {
        let tmp = TempDir::new().unwrap();
        stratum()
            .args(["build", "does-not-exist.yaml", "fedora:40", "app", "--database-dir"])
            .arg(tmp.path())
            .assert()
            .failure()
            .stderr(predicate::str::contains("Validation error at /playbook"));
    }

    #[test]
    fn config_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        stratum()
            .args(["config", "path", "-c"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let tmp = TempDir::new().unwrap();
        stratum()
            .args(["config", "show", "-c"])
            .arg(tmp.path().join("config.toml"))
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[interpreter]"));
    }

    #[test]
    fn hook_without_build_env_skips() {
        stratum()
            .args(["hook", "task-start"])
            .write_stdin(r#"{"action": "command"}"#)
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""skip":true"#))
            .stdout(predicate::str::contains("STRATUM_BUILD_ID"));
    }

    #[tokio::test]
    async fn hook_skips_tasks_of_failed_build() {
        let tmp = TempDir::new().unwrap();
        let id = recorded_build(&tmp, BuildState::Failed).await;

        stratum()
            .args(["hook", "task-start"])
            .env("STRATUM_BUILD_ID", &id)
            .env("STRATUM_DB_PATH", tmp.path())
            .write_stdin(r#"{"action": "command", "definition": {"command": "true"}}"#)
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""skip":true"#));
    }

    #[tokio::test]
    async fn hook_lets_fact_gathering_run() {
        let tmp = TempDir::new().unwrap();
        let id = recorded_build(&tmp, BuildState::InProgress).await;

        stratum()
            .args(["hook", "task-start"])
            .env("STRATUM_BUILD_ID", &id)
            .env("STRATUM_DB_PATH", tmp.path())
            .write_stdin(r#"{"action": "setup"}"#)
            .assert()
            .success()
            .stdout(predicate::str::diff("{\"skip\":false}\n"));
    }

    #[tokio::test]
    async fn hook_with_bad_event_fails_the_build() {
        let tmp = TempDir::new().unwrap();
        let id = recorded_build(&tmp, BuildState::InProgress).await;

        stratum()
            .args(["hook", "task-result"])
            .env("STRATUM_BUILD_ID", &id)
            .env("STRATUM_DB_PATH", tmp.path())
            .write_stdin("not json")
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""skip":true"#));

        let db = Database::new(Some(tmp.path())).unwrap();
        assert!(db.get_build(&id).await.unwrap().is_failed());
    }
}

mod caching_tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use stratum::build::{Build, BuildState};
    use stratum::config::Config;
    use stratum::interceptor::{StepInterceptor, TaskEvent, TaskOutcome, STOP_LAYERING_TAG};
    use stratum::orchestration::{ContainerBuilder, PlaybookExecutor, PlaybookRun};
    use stratum::orchestrator::Application;
    use stratum::store::Database;
    use stratum::{StratumError, StratumResult};
    use tempfile::TempDir;

    const BASE_ID: &str = "sha256:base";

    /// Image storage kept in memory
    #[derive(Default)]
    struct MemoryBuilder {
        images: Mutex<BTreeMap<String, String>>,
        next_id: Mutex<u32>,
    }

    impl MemoryBuilder {
        fn with_base() -> Self {
            let builder = Self::default();
            {
                let mut images = builder.images.lock().unwrap();
                images.insert("fedora:40".to_string(), BASE_ID.to_string());
                images.insert(BASE_ID.to_string(), BASE_ID.to_string());
            }
            builder
        }

        fn remove(&self, id: &str) {
            self.images.lock().unwrap().retain(|_, v| v != id);
        }
    }

    #[async_trait]
    impl ContainerBuilder for MemoryBuilder {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn ansible_connection(&self) -> &'static str {
            "local"
        }

        async fn sanity_check(&self, _build: &Build) -> StratumResult<()> {
            Ok(())
        }

        async fn check_container_creation(&self, _build: &Build) -> StratumResult<()> {
            Ok(())
        }

        async fn is_image_present(&self, image: &str) -> StratumResult<bool> {
            Ok(self.images.lock().unwrap().contains_key(image))
        }

        async fn pull(&self, image: &str) -> StratumResult<()> {
            Err(StratumError::ImagePull {
                image: image.to_string(),
                reason: "offline".to_string(),
            })
        }

        async fn get_image_id(&self, image: &str) -> StratumResult<String> {
            self.images
                .lock()
                .unwrap()
                .get(image)
                .cloned()
                .ok_or_else(|| StratumError::ImageNotFound(image.to_string()))
        }

        async fn create(&self, _build: &Build, _from_image: &str) -> StratumResult<()> {
            Ok(())
        }

        async fn commit(
            &self,
            _build: &Build,
            image_name: Option<&str>,
            _final_image: bool,
        ) -> StratumResult<String> {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let id = format!("sha256:layer-{}", *next);
            let mut images = self.images.lock().unwrap();
            images.insert(id.clone(), id.clone());
            if let Some(name) = image_name {
                images.insert(name.to_string(), id.clone());
            }
            Ok(id)
        }

        async fn clean(&self, _build: &Build) -> StratumResult<()> {
            Ok(())
        }

        async fn run(&self, _image: &str, _command: &[String]) -> StratumResult<String> {
            Ok(String::new())
        }

        async fn push(&self, _image_id: &str, _target: &str) -> StratumResult<()> {
            Ok(())
        }
    }

    /// A task of the scripted playbook
    #[derive(Clone)]
    struct Task {
        definition: Value,
        tags: Vec<String>,
        /// Condition evaluates to false, the executor skips the task itself
        conditional_false: bool,
    }

    fn task(command: &str) -> Task {
        Task {
            definition: json!({"name": command, "command": command}),
            tags: vec![],
            conditional_false: false,
        }
    }

    /// Runs tasks through the interceptor the way the callback plugin does
    struct ScriptedPlaybook<'a> {
        builder: &'a MemoryBuilder,
        tasks: Vec<Task>,
    }

    #[async_trait]
    impl PlaybookExecutor for ScriptedPlaybook<'_> {
        async fn run(&self, run: PlaybookRun<'_>) -> StratumResult<Vec<String>> {
            let db = Database::new(Some(run.db_path))?;
            let hooks = StepInterceptor::new(&db, self.builder);
            let build_id = run.build.id()?;

            let mut output = Vec::new();
            for task in &self.tasks {
                let start = TaskEvent {
                    action: "command".to_string(),
                    tags: task.tags.clone(),
                    definition: task.definition.clone(),
                    outcome: None,
                    rc: 0,
                };
                let response = hooks.task_start(build_id, &start).await;
                let outcome = if response.skip || task.conditional_false {
                    TaskOutcome::Skipped
                } else {
                    TaskOutcome::Changed
                };
                let result = TaskEvent {
                    outcome: Some(outcome),
                    ..start
                };
                hooks.task_result(build_id, &result).await;
                output.push(format!("TASK [{}]", task.definition["name"]));
            }
            Ok(output)
        }
    }

    struct Fixture {
        dir: TempDir,
        app: Application,
        builder: MemoryBuilder,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let app = Application::new(Config::default(), Some(dir.path())).unwrap();
            let playbook = dir.path().join("site.yaml");
            std::fs::write(&playbook, "- hosts: all\n  tasks: []\n").unwrap();
            Self {
                dir,
                app,
                builder: MemoryBuilder::with_base(),
            }
        }

        async fn build(&self, tasks: &[Task], cache_tasks: bool) -> Build {
            let mut build = Build::new();
            build.playbook_path = Some(self.dir.path().join("site.yaml"));
            build.base_image = Some("fedora:40".to_string());
            build.target_image = Some("app".to_string());
            build.python_interpreter = Some("/usr/bin/python3".to_string());
            build.cache_tasks = cache_tasks;

            let executor = ScriptedPlaybook {
                builder: &self.builder,
                tasks: tasks.to_vec(),
            };
            self.app
                .build_with(build, &self.builder, &executor, &|_| {})
                .await
                .unwrap()
        }
    }

    fn cached_flags(build: &Build) -> Vec<bool> {
        build.layers.iter().map(|l| l.cached).collect()
    }

    fn three_tasks() -> Vec<Task> {
        vec![task("touch /a"), task("touch /b"), task("touch /c")]
    }

    #[tokio::test]
    async fn unchanged_playbook_is_fully_cached() {
        let fx = Fixture::new();

        let first = fx.build(&three_tasks(), true).await;
        assert_eq!(first.state, BuildState::Done);
        assert_eq!(cached_flags(&first), vec![true, false, false, false, false]);

        let second = fx.build(&three_tasks(), true).await;
        assert_eq!(cached_flags(&second), vec![true, true, true, true, false]);
        for i in 1..4 {
            assert_eq!(second.layers[i].layer_id, first.layers[i].layer_id);
        }
        assert_ne!(second.final_layer_id, first.final_layer_id);
    }

    #[tokio::test]
    async fn changed_task_invalidates_the_rest() {
        let fx = Fixture::new();
        let first = fx.build(&three_tasks(), true).await;

        let edited = vec![task("touch /a"), task("touch /edited"), task("touch /c")];
        let second = fx.build(&edited, true).await;

        assert_eq!(cached_flags(&second), vec![true, true, false, false, false]);
        assert_eq!(second.layers[1].layer_id, first.layers[1].layer_id);
        assert_ne!(second.layers[2].layer_id, first.layers[2].layer_id);
        // The unchanged third task sits on a new base now
        assert_ne!(second.layers[3].layer_id, first.layers[3].layer_id);
    }

    #[tokio::test]
    async fn disabled_cache_rebuilds_everything() {
        let fx = Fixture::new();
        fx.build(&three_tasks(), true).await;

        let second = fx.build(&three_tasks(), false).await;
        assert_eq!(cached_flags(&second), vec![true, false, false, false, false]);
        assert!(!second.cache_tasks);
    }

    #[tokio::test]
    async fn skipped_task_with_cache_off_is_not_cached() {
        let fx = Fixture::new();
        fx.build(&three_tasks(), true).await;

        let mut tasks = three_tasks();
        tasks[0].conditional_false = true;
        let second = fx.build(&tasks, false).await;

        assert_eq!(cached_flags(&second), vec![true, false, false, false, false]);
        assert_eq!(second.layers[1].layer_id, BASE_ID);
        assert_eq!(second.layers[1].base_image_id.as_deref(), Some(BASE_ID));
    }

    #[tokio::test]
    async fn removed_layer_is_rebuilt() {
        let fx = Fixture::new();
        let first = fx.build(&three_tasks(), true).await;
        fx.builder.remove(&first.layers[1].layer_id);

        let second = fx.build(&three_tasks(), true).await;
        assert_eq!(cached_flags(&second), vec![true, false, false, false, false]);
        assert_ne!(second.layers[1].layer_id, first.layers[1].layer_id);
    }

    #[tokio::test]
    async fn stop_layering_is_final() {
        let fx = Fixture::new();
        let mut tasks = three_tasks();
        tasks[1].tags = vec![STOP_LAYERING_TAG.to_string()];

        let build = fx.build(&tasks, true).await;
        assert!(!build.layering);
        assert_eq!(cached_flags(&build), vec![true, false, false]);
        assert_eq!(build.final_layer_id.as_deref(), build.top_layer_id());
    }

    #[tokio::test]
    async fn builds_are_listed_in_order() {
        let fx = Fixture::new();
        fx.build(&three_tasks(), true).await;
        fx.build(&three_tasks(), true).await;

        let ids: Vec<_> = fx
            .app
            .list_builds()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|b| b.build_id)
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(fx.app.inspect(None).await.unwrap().build_id.as_deref(), Some("2"));
    }
}
