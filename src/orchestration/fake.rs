//! In-memory container builder for unit tests

use crate::build::Build;
use crate::error::{StratumError, StratumResult};
use crate::orchestration::runtime::ContainerBuilder;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct State {
    /// reference or id -> image id
    images: BTreeMap<String, String>,
    next_id: u32,
    commits: Vec<Option<String>>,
    created_from: Vec<String>,
    cleaned: usize,
    /// interpreter path -> major version it reports
    interpreters: BTreeMap<String, u8>,
}

/// Builder keeping images in a map; ids are `sha256:fake-N`
#[derive(Default)]
pub(crate) struct FakeBuilder {
    state: Mutex<State>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(self, reference: &str, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.images.insert(reference.to_string(), id.to_string());
            state.images.insert(id.to_string(), id.to_string());
        }
        self
    }

    pub fn with_interpreter(self, path: &str, major: u8) -> Self {
        self.state
            .lock()
            .unwrap()
            .interpreters
            .insert(path.to_string(), major);
        self
    }

    pub fn remove_image(&self, id: &str) {
        self.state.lock().unwrap().images.retain(|_, v| v != id);
    }

    pub fn commits(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn created_from(&self) -> Vec<String> {
        self.state.lock().unwrap().created_from.clone()
    }

    pub fn cleaned(&self) -> usize {
        self.state.lock().unwrap().cleaned
    }
}

#[async_trait]
impl ContainerBuilder for FakeBuilder {
    fn name(&self) -> &'static str {
        "fake"
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
        Ok(self.state.lock().unwrap().images.contains_key(image))
    }

    async fn pull(&self, image: &str) -> StratumResult<()> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("sha256:fake-{}", state.next_id);
        state.images.insert(image.to_string(), id.clone());
        state.images.insert(id.clone(), id);
        Ok(())
    }

    async fn get_image_id(&self, image: &str) -> StratumResult<String> {
        self.state
            .lock()
            .unwrap()
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| StratumError::ImageNotFound(image.to_string()))
    }

    async fn create(&self, build: &Build, from_image: &str) -> StratumResult<()> {
        build.container_name()?;
        self.state
            .lock()
            .unwrap()
            .created_from
            .push(from_image.to_string());
        Ok(())
    }

    async fn commit(
        &self,
        build: &Build,
        image_name: Option<&str>,
        _final_image: bool,
    ) -> StratumResult<String> {
        build.container_name()?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("sha256:fake-{}", state.next_id);
        state.images.insert(id.clone(), id.clone());
        if let Some(name) = image_name {
            state.images.insert(name.to_string(), id.clone());
        }
        state.commits.push(image_name.map(str::to_string));
        Ok(id)
    }

    async fn clean(&self, _build: &Build) -> StratumResult<()> {
        self.state.lock().unwrap().cleaned += 1;
        Ok(())
    }

    /// Answers the interpreter major-version check; unknown paths ending
    /// in `python3` report 3
    async fn run(&self, _image: &str, command: &[String]) -> StratumResult<String> {
        let state = self.state.lock().unwrap();
        let major = command.first().and_then(|path| {
            state
                .interpreters
                .get(path)
                .copied()
                .or_else(|| path.ends_with("python3").then_some(3))
        });
        match major {
            Some(major) => Ok(format!("{}\n", major)),
            None => Err(StratumError::command_exec(command.join(" "), "not found")),
        }
    }

    async fn push(&self, _image_id: &str, _target: &str) -> StratumResult<()> {
        Ok(())
    }
}
