//! Typed configuration sections.
//!
//! Stage-specific blocks (`branches.<name>.label`, `executors.<name>.context.train`,
//! ...) are kept as raw YAML here and typed by the stage that consumes them,
//! see [`parse_section`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::artifact::{Artifact, ArtifactCatalog};
use crate::error::ConfigError;

const DEFAULT_MAX_ITERS: usize = 10;

/// The whole configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct ForgeConfig {
    pub executors: HashMap<String, ExecutorConfig>,
    #[serde(default)]
    pub artifacts: HashMap<String, Artifact>,
    /// Raw workflow section; typed per iteration once the update table
    /// overlay is applied.
    pub workflow: Value,
}

impl ForgeConfig {
    /// Parses a merged configuration document.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: ForgeConfig = serde_yaml::from_value(value)?;
        if config.workflow.is_null() {
            return Err(ConfigError::schema("workflow", "section is missing"));
        }
        Ok(config)
    }

    /// Checks the entry-point arguments against this configuration.
    pub fn check_entry(&self, executor: &str, path_prefix: &str) -> Result<(), ConfigError> {
        if !self.executors.contains_key(executor) {
            return Err(ConfigError::UnknownExecutor(executor.to_string()));
        }
        if path_prefix.trim().is_empty() {
            return Err(ConfigError::EmptyPathPrefix);
        }
        Ok(())
    }

    pub fn executor(&self, name: &str) -> Result<&ExecutorConfig, ConfigError> {
        self.executors
            .get(name)
            .ok_or_else(|| ConfigError::UnknownExecutor(name.to_string()))
    }

    pub fn catalog(&self) -> ArtifactCatalog {
        ArtifactCatalog::new(self.artifacts.clone())
    }
}

fn default_submit_cmd() -> String {
    crate::executor::local::DEFAULT_SUBMIT_CMD.to_string()
}

/// One compute backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Base directory of the executor workspace.
    pub work_dir: PathBuf,
    /// Command that launches a rendered script, e.g. `sbatch --wait`.
    #[serde(default = "default_submit_cmd")]
    pub submit_cmd: String,
    #[serde(default)]
    pub context: ContextConfig,
}

/// Per-stage execution settings of an executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub label: Value,
    pub train: Value,
    pub explore: Value,
}

/// The workflow section with one update-table overlay applied.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    pub general: GeneralConfig,
    pub branches: BTreeMap<String, BranchConfig>,
    #[serde(default)]
    pub explore: Value,
    #[serde(default)]
    pub update: UpdateConfig,
}

impl WorkflowConfig {
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let config: WorkflowConfig = serde_yaml::from_value(value.clone())
            .map_err(|e| ConfigError::schema("workflow", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let general = &self.general;
        if general.type_map.is_empty() {
            return Err(ConfigError::schema("workflow.general", "type_map is empty"));
        }
        if general.type_map.len() != general.mass_map.len() {
            return Err(ConfigError::schema(
                "workflow.general",
                format!(
                    "type_map has {} elements but mass_map has {}",
                    general.type_map.len(),
                    general.mass_map.len()
                ),
            ));
        }
        if self.branches.is_empty() {
            return Err(ConfigError::schema("workflow.branches", "at least one branch is required"));
        }
        Ok(())
    }

    pub fn branch_names(&self) -> Vec<&str> {
        self.branches.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub type_map: Vec<String>,
    pub mass_map: Vec<f64>,
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
}

fn default_max_iters() -> usize {
    DEFAULT_MAX_ITERS
}

/// Stage blocks of one branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub label: Value,
    pub train: Value,
    pub threshold: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub walkthrough: WalkthroughConfig,
}

/// Ordered overlays applied to the workflow section, one per iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkthroughConfig {
    pub table: Vec<Value>,
}

/// A stage configuration block.
///
/// Blocks are parsed from YAML, then checked with [`StageConfig::validate`]
/// for constraints serde cannot express.
pub trait StageConfig: DeserializeOwned + Clone + Send + Sync + 'static {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl StageConfig for Value {}

/// Parses a stage block; an absent block parses like an empty mapping.
pub fn parse_section<C: StageConfig>(section: &str, value: &Value) -> Result<C, ConfigError> {
    let value = if value.is_null() {
        Value::Mapping(Mapping::new())
    } else {
        value.clone()
    };
    let config: C =
        serde_yaml::from_value(value).map_err(|e| ConfigError::schema(section, e.to_string()))?;
    config
        .validate()
        .map_err(|message| ConfigError::schema(section, message))?;
    Ok(config)
}
