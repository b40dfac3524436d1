//! Resource manager: artifact resolution and executor access for stages.
//!
//! Stages never read the catalog or build executors themselves. They ask the
//! [`ResourceManager`] for named artifacts, for `@name` references found in
//! their configuration, and for the executor to run on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::artifact::{Artifact, ArtifactCatalog};
use crate::config::ForgeConfig;
use crate::error::{ConfigError, ResourceError};
use crate::executor::{Executor, LocalExecutor};

/// Prefix marking a configuration string as an artifact reference.
pub const REFERENCE_PREFIX: char = '@';

/// Read-only registry of artifacts and executors for one run.
pub struct ResourceManager {
    catalog: ArtifactCatalog,
    executors: HashMap<String, Arc<dyn Executor>>,
    default_executor: Arc<dyn Executor>,
}

impl ResourceManager {
    /// Builds a local executor for every configured backend.
    ///
    /// Fails if `default_executor` is not one of them.
    pub fn from_config(config: &ForgeConfig, default_executor: &str) -> Result<Self, ConfigError> {
        let executors = config
            .executors
            .iter()
            .map(|(name, executor_config)| {
                let executor = LocalExecutor::new(name.clone(), executor_config.work_dir.clone())
                    .with_submit_cmd(&executor_config.submit_cmd);
                (name.clone(), Arc::new(executor) as Arc<dyn Executor>)
            })
            .collect();
        Self::with_executors(config.catalog(), executors, default_executor)
    }

    /// Builds a manager over already constructed executors.
    pub fn with_executors(
        catalog: ArtifactCatalog,
        executors: HashMap<String, Arc<dyn Executor>>,
        default_executor: &str,
    ) -> Result<Self, ConfigError> {
        let default = executors
            .get(default_executor)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownExecutor(default_executor.to_string()))?;
        debug!(
            default_executor = default_executor,
            executors = executors.len(),
            artifacts = catalog.len(),
            "Resource manager ready"
        );
        Ok(Self {
            catalog,
            executors,
            default_executor: default,
        })
    }

    pub fn default_executor(&self) -> Arc<dyn Executor> {
        self.default_executor.clone()
    }

    pub fn executor(&self, name: &str) -> Result<Arc<dyn Executor>, ResourceError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| ResourceError::ExecutorNotFound(name.to_string()))
    }

    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    /// Looks up one catalog artifact.
    pub fn resolve_artifact(&self, name: &str) -> Result<Artifact, ResourceError> {
        self.catalog
            .get(name)
            .cloned()
            .ok_or_else(|| ResourceError::ArtifactNotFound(name.to_string()))
    }

    /// Looks up several artifacts, in order. Fails without a partial result
    /// if any name is unknown.
    pub fn get_artifacts<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Artifact>, ResourceError> {
        names
            .iter()
            .map(|name| self.resolve_artifact(name.as_ref()))
            .collect()
    }

    /// Resolves `@name` to the url of artifact `name`; other strings are
    /// returned unchanged.
    pub fn resolve_reference(&self, value: &str) -> Result<String, ResourceError> {
        match value.strip_prefix(REFERENCE_PREFIX) {
            Some(name) => {
                let artifact = self.resolve_artifact(name)?;
                debug!(reference = value, url = %artifact.url, "Resolved artifact reference");
                Ok(artifact.url)
            }
            None => Ok(value.to_string()),
        }
    }

    /// Resolves every value of a resource table.
    pub fn resolve_resources(
        &self,
        resources: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ResourceError> {
        resources
            .iter()
            .map(|(key, value)| -> Result<(String, String), ResourceError> {
                Ok((key.clone(), self.resolve_reference(value)?))
            })
            .collect()
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut executors: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        executors.sort_unstable();
        f.debug_struct("ResourceManager")
            .field("default_executor", &self.default_executor.name())
            .field("executors", &executors)
            .field("artifacts", &self.catalog.names())
            .finish()
    }
}
