//! Stage contract and the bundled stage implementations.
//!
//! Every phase of an iteration has the same shape: an input record (prior
//! datasets plus the stage's workflow configuration), a [`StageContext`]
//! (execution settings, a workspace path prefix unique per iteration and
//! branch, and the [`ResourceManager`]), and a [`StageFuture`] of an output.
//!
//! Outputs are only read through capability traits ([`LabelOutput`],
//! [`TrainOutput`], [`ExploreOutput`], [`SelectOutput`]), so the iteration
//! engine is checked against what each stage kind exposes rather than against
//! concrete output types.
//!
//! Conforming stages:
//! - never mutate their input or context,
//! - create their own workspace under the context's path prefix,
//! - resolve `@name` references through the resource manager before
//!   submitting any job,
//! - return a resolved future with an empty output when there is no work.

pub mod explore;
pub mod label;
pub mod select;
pub mod train;
pub mod update;

pub use explore::{CommandExplorer, ExploreConfig, ExploreContextConfig, ExploreTasks};
pub use label::{CommandLabeler, LabelConfig, LabelContextConfig, LabeledTasks};
pub use select::{ThresholdConfig, ThresholdSelector, SelectedCandidates};
pub use train::{CommandTrainer, TrainConfig, TrainContextConfig, TrainedModels};
pub use update::{UpdateOutcome, WalkthroughUpdater};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tera::{Context, Tera};

use crate::artifact::Artifact;
use crate::config::StageConfig;
use crate::error::StageError;
use crate::executor::Executor;
use crate::job::StageFuture;
use crate::resource::ResourceManager;

/// Execution context of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageContext<C> {
    pub config: C,
    /// Workspace subpath, relative to the executor work dir.
    pub path_prefix: PathBuf,
    pub resource_manager: Arc<ResourceManager>,
}

impl<C> StageContext<C> {
    pub fn new(config: C, path_prefix: impl Into<PathBuf>, resource_manager: Arc<ResourceManager>) -> Self {
        Self {
            config,
            path_prefix: path_prefix.into(),
            resource_manager,
        }
    }

    /// The default executor and the stage's absolute workspace on it.
    pub fn workspace(&self) -> (Arc<dyn Executor>, PathBuf) {
        let executor = self.resource_manager.default_executor();
        let work_dir = executor.resolve(&self.path_prefix);
        (executor, work_dir)
    }
}

/// Input of a label stage.
#[derive(Debug, Clone)]
pub struct LabelInput<C> {
    pub config: C,
    /// Structures to label, usually the previous selection.
    pub system_files: Vec<Artifact>,
    pub type_map: Vec<String>,
    /// False on the first iteration only.
    pub initiated: bool,
}

/// Input of a train stage.
#[derive(Debug, Clone)]
pub struct TrainInput<C> {
    pub config: C,
    pub type_map: Vec<String>,
    /// Dataset the previous models were trained on.
    pub old_dataset: Vec<Artifact>,
    /// Newly labeled data.
    pub new_dataset: Vec<Artifact>,
    pub initiated: bool,
}

/// Input of the explore stage, shared by every branch.
#[derive(Debug, Clone)]
pub struct ExploreInput<C> {
    pub config: C,
    pub type_map: Vec<String>,
    pub mass_map: Vec<f64>,
    /// Trained models by branch.
    pub models: BTreeMap<String, Vec<Artifact>>,
}

/// Input of a select stage.
#[derive(Debug, Clone)]
pub struct SelectInput<C> {
    pub config: C,
    pub model_devi_data: Vec<Artifact>,
    /// Name of the branch's model-deviation file inside each explore task.
    pub model_devi_file: String,
}

pub trait LabelOutput: Send + Sync {
    fn labeled_system_dataset(&self) -> &[Artifact];
}

pub trait TrainOutput: Send + Sync {
    fn mlp_models(&self) -> &[Artifact];
    fn training_dataset(&self) -> &[Artifact];
}

pub trait ExploreOutput: Send + Sync {
    fn model_devi_dataset(&self) -> &[Artifact];
}

pub trait SelectOutput: Send + Sync {
    fn model_devi_dataset(&self) -> &[Artifact];
}

/// Produces reference data for a branch.
#[async_trait]
pub trait Labeler: Send + Sync {
    type Config: StageConfig;
    type ContextConfig: StageConfig;
    type Output: LabelOutput + 'static;

    /// Tool tag used in workspace directory names.
    fn tool(&self) -> &str;

    /// Dispatches the work and returns without waiting for it.
    async fn label(
        &self,
        input: &LabelInput<Self::Config>,
        ctx: &StageContext<Self::ContextConfig>,
    ) -> Result<StageFuture<Self::Output>, StageError>;
}

/// Trains an ensemble of models for a branch.
#[async_trait]
pub trait Trainer: Send + Sync {
    type Config: StageConfig;
    type ContextConfig: StageConfig;
    type Output: TrainOutput + 'static;

    fn tool(&self) -> &str;

    async fn train(
        &self,
        input: &TrainInput<Self::Config>,
        ctx: &StageContext<Self::ContextConfig>,
    ) -> Result<StageFuture<Self::Output>, StageError>;
}

/// Samples new structures with the models of every branch.
#[async_trait]
pub trait Explorer: Send + Sync {
    type Config: StageConfig;
    type ContextConfig: StageConfig;
    type Output: ExploreOutput + 'static;

    fn tool(&self) -> &str;

    async fn explore(
        &self,
        input: &ExploreInput<Self::Config>,
        ctx: &StageContext<Self::ContextConfig>,
    ) -> Result<StageFuture<Self::Output>, StageError>;
}

/// Picks candidates for the next label stage of a branch.
#[async_trait]
pub trait Selector: Send + Sync {
    type Config: StageConfig;
    type Output: SelectOutput + 'static;

    fn tool(&self) -> &str;

    async fn select(
        &self,
        input: &SelectInput<Self::Config>,
        ctx: &StageContext<()>,
    ) -> Result<StageFuture<Self::Output>, StageError>;
}

/// Renders a user template with tera.
pub(crate) fn render_template<T: Serialize>(template: &str, values: &T) -> Result<String, StageError> {
    let context = Context::from_serialize(values)?;
    Ok(Tera::one_off(template, &context, false)?)
}

/// Task directory `<base>/<index as 6 digits>`.
pub(crate) fn task_dir(base: &Path, index: usize) -> PathBuf {
    base.join(format!("{index:06}"))
}

/// Deals items into `groups` lists round-robin, dropping empty groups.
pub(crate) fn deal_round_robin<T>(items: Vec<T>, groups: usize) -> Vec<Vec<T>> {
    let groups = groups.max(1);
    let mut dealt: Vec<Vec<T>> = (0..groups).map(|_| Vec::new()).collect();
    for (i, item) in items.into_iter().enumerate() {
        dealt[i % groups].push(item);
    }
    dealt.retain(|group| !group.is_empty());
    dealt
}

/// Copies `source` into `dir`, keeping its file name.
pub(crate) fn copy_into(source: &Path, dir: &Path) -> Result<PathBuf, StageError> {
    let name = source
        .file_name()
        .ok_or_else(|| StageError::InvalidInput(format!("'{}' is not a file path", source.display())))?;
    let target = dir.join(name);
    std::fs::copy(source, &target)?;
    Ok(target)
}
