//! Configuration loading and schema.
//!
//! A run is configured by one or more YAML documents, deep-merged in order
//! (see [`load_yaml_files`]). The merged document has three sections:
//!
//! ```yaml
//! executors:
//!   hpc:
//!     work_dir: /scratch/forge
//!     submit_cmd: sbatch --wait
//!     context:
//!       label: {cmd: cp2k.psmp, concurrency: 8}
//!       train: {dp_cmd: dp}
//!       explore: {lmp_cmd: lmp}
//! artifacts:
//!   init-frames: {url: /data/init.xyz, format: extxyz}
//! workflow:
//!   general: {type_map: [H, O], mass_map: [1.008, 15.999], max_iters: 4}
//!   branches:
//!     neu: {label: {...}, train: {...}, threshold: {f_trust_lo: 0.1, f_trust_hi: 0.3}}
//!     red: {label: {...}, train: {...}, threshold: {f_trust_lo: 0.1, f_trust_hi: 0.3}}
//!   explore: {...}
//!   update:
//!     walkthrough:
//!       table:
//!         - explore: {variables: {TEMP: [330]}}
//!         - explore: {variables: {TEMP: [330, 430]}}
//! ```
//!
//! The `workflow` section stays raw YAML: each iteration the update table
//! overlay in effect is merged onto it with [`merge_values`] before it is
//! typed into a [`WorkflowConfig`].

pub mod loader;
pub mod schema;

pub use loader::{load_yaml_files, merge_values};
pub use schema::{
    parse_section, BranchConfig, ContextConfig, ExecutorConfig, ForgeConfig, GeneralConfig,
    StageConfig, UpdateConfig, WalkthroughConfig, WorkflowConfig,
};

use std::path::Path;

use crate::error::ConfigError;

/// Loads, merges and parses configuration files.
pub fn load_config<P: AsRef<Path>>(paths: &[P]) -> Result<ForgeConfig, ConfigError> {
    let value = load_yaml_files(paths)?;
    ForgeConfig::from_value(value)
}
