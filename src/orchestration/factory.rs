//! Builder factory
//!
//! Maps the backend name stored in a build record to an implementation.

use crate::error::{StratumError, StratumResult};
use crate::orchestration::buildah::BuildahBuilder;
use crate::orchestration::runtime::ContainerBuilder;
use std::fmt;
use std::str::FromStr;

/// Supported builder backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuilderBackend {
    #[default]
    Buildah,
}

impl BuilderBackend {
    pub fn name(&self) -> &'static str {
        match self {
            BuilderBackend::Buildah => "buildah",
        }
    }

    /// Every known backend name
    pub fn all() -> &'static [BuilderBackend] {
        &[BuilderBackend::Buildah]
    }
}

impl fmt::Display for BuilderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BuilderBackend {
    type Err = StratumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|b| b.name() == s)
            .ok_or_else(|| StratumError::UnknownBuilder(s.to_string()))
    }
}

/// Create the builder for a backend name
///
/// # Returns
/// * `Ok(Box<dyn ContainerBuilder>)` - A boxed builder implementation
/// * `Err` - If the backend name is unknown
pub fn create_builder(name: &str) -> StratumResult<Box<dyn ContainerBuilder>> {
    match name.parse::<BuilderBackend>()? {
        BuilderBackend::Buildah => Ok(Box::new(BuildahBuilder::new())),
    }
}
