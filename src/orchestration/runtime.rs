//! Container builder abstraction
//!
//! The build flow and the layer cache only talk to the builder through this
//! trait, so a backend other than buildah (or an in-memory fake) can be
//! plugged in.

use crate::build::Build;
use crate::error::{StratumError, StratumResult};
use async_trait::async_trait;
use tracing::{debug, error, info};

/// Prints the major version of the interpreter running it
const PYTHON_MAJOR_SCRIPT: &str = "import sys; print(sys.version_info[0])";

/// Abstract container builder interface
#[async_trait]
pub trait ContainerBuilder: Send + Sync {
    /// Backend name, as stored in `Build::builder_name`
    fn name(&self) -> &'static str;

    /// Ansible connection plugin used to reach the working container
    fn ansible_connection(&self) -> &'static str;

    /// Verify the tooling works, including creating a throwaway container
    async fn sanity_check(&self, build: &Build) -> StratumResult<()>;

    /// Verify containers can be started from the base image
    async fn check_container_creation(&self, build: &Build) -> StratumResult<()>;

    /// Whether an image with this reference or id exists in local storage
    async fn is_image_present(&self, image: &str) -> StratumResult<bool>;

    /// Pull an image into local storage
    async fn pull(&self, image: &str) -> StratumResult<()>;

    /// Resolve an image reference to its id
    async fn get_image_id(&self, image: &str) -> StratumResult<String>;

    /// Create the build's working container from `from_image` and apply
    /// the build-time configuration
    async fn create(&self, build: &Build, from_image: &str) -> StratumResult<()>;

    /// Replace the working container with a fresh one created from `from_image`
    async fn swap_working_container(&self, build: &Build, from_image: &str) -> StratumResult<()> {
        self.clean(build).await?;
        self.create(build, from_image).await
    }

    /// Commit the working container and return the new image id.
    ///
    /// Without a name an anonymous snapshot is created.
    async fn commit(
        &self,
        build: &Build,
        image_name: Option<&str>,
        final_image: bool,
    ) -> StratumResult<String>;

    /// Remove the working container
    async fn clean(&self, build: &Build) -> StratumResult<()>;

    /// Run a command in a throwaway container and return its stdout
    async fn run(&self, image: &str, command: &[String]) -> StratumResult<String>;

    /// Push a built image to `target` (`transport:details`)
    async fn push(&self, image_id: &str, target: &str) -> StratumResult<()>;

    /// Find the first of `candidates` in the base image that is a Python 3
    async fn find_python_interpreter(
        &self,
        base_image: &str,
        candidates: &[String],
    ) -> StratumResult<String> {
        for candidate in candidates {
            let version_check = vec![
                candidate.clone(),
                "-c".to_string(),
                PYTHON_MAJOR_SCRIPT.to_string(),
            ];
            match self.run(base_image, &version_check).await {
                Ok(out) if out.trim() == "3" => {
                    info!("Using python interpreter {}", candidate);
                    return Ok(candidate.clone());
                }
                Ok(out) => debug!(
                    "Python interpreter {} reports major version {:?}, skipping it",
                    candidate,
                    out.trim()
                ),
                Err(e) => debug!("Python interpreter {} not usable: {}", candidate, e),
            }
        }

        error!(
            "Couldn't locate a python interpreter in {}, tried: {:?}",
            base_image, candidates
        );
        Err(StratumError::PythonInterpreterNotFound {
            image: base_image.to_string(),
            tried: candidates.join(", "),
        })
    }
}
