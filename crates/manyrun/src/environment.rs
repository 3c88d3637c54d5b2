//! Per-host environment collaborator.
//!
//! An [`Environment`] tells every instance where to look for extra resources
//! and gets a chance to finish configuring each instance after its runtime is
//! up. It is shared by all instances of a manager.

use std::path::PathBuf;

use crate::instance::Instance;

/// Environment variable read by [`DefaultEnvironment::from_env`], in the
/// platform's path-list syntax.
pub const SEARCH_PATH_ENV: &str = "MANYRUN_SEARCH_PATH";

pub trait Environment: Send + Sync + 'static {
    /// Extra resource search paths passed to every runtime's factory.
    fn extra_search_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Called once per instance, after its runtime is created.
    ///
    /// # Errors
    ///
    /// A failure aborts construction of the instance (and of the manager
    /// building it) with [`Error::Configure`](crate::Error::Configure).
    fn configure_instance(&self, instance: &Instance) -> anyhow::Result<()> {
        let _ = instance;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct DefaultEnvironment {
    search_paths: Vec<PathBuf>,
}

impl DefaultEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads search paths from `MANYRUN_SEARCH_PATH`.
    pub fn from_env() -> Self {
        let search_paths = std::env::var_os(SEARCH_PATH_ENV)
            .map(|paths| std::env::split_paths(&paths).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();
        Self { search_paths }
    }

    pub fn with_search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }
}

impl Environment for DefaultEnvironment {
    fn extra_search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.clone()
    }
}
