//! The iteration engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use serde_yaml::Value;
use tracing::{debug, info};

use super::summary::{BranchSummary, IterationSummary, RunSummary};
use crate::config::{parse_section, ContextConfig, WorkflowConfig};
use crate::error::{ConfigError, StageError, WorkflowError};
use crate::job::StageFuture;
use crate::metrics::MetricsCollector;
use crate::resource::ResourceManager;
use crate::stage::{
    ExploreInput, ExploreOutput, Explorer, LabelInput, LabelOutput, Labeler, SelectInput,
    SelectOutput, Selector, StageContext, TrainInput, TrainOutput, Trainer, WalkthroughUpdater,
};

/// Name of the model-deviation file a branch's selection reads.
pub fn model_devi_file(branch: &str) -> String {
    format!("model_devi_{branch}.out")
}

/// Directory of one iteration, relative to the run's path prefix.
pub fn iteration_dir(iteration: usize) -> PathBuf {
    PathBuf::from(format!("iters-{iteration:03}"))
}

/// The stage implementations driven by the engine.
#[derive(Debug, Clone)]
pub struct Stages<L, T, E, S> {
    pub labeler: L,
    pub trainer: T,
    pub explorer: E,
    pub selector: S,
}

/// What a branch carries from one iteration into the next.
struct BranchState<TO, SO> {
    train: Option<TO>,
    select: Option<SO>,
}

impl<TO, SO> Default for BranchState<TO, SO> {
    fn default() -> Self {
        Self {
            train: None,
            select: None,
        }
    }
}

type BranchStates<T, S> = BTreeMap<String, BranchState<<T as Trainer>::Output, <S as Selector>::Output>>;

/// Runs label, train, explore, select and update for every iteration.
///
/// Branches run concurrently within a stage: each branch's stage is
/// dispatched before any of them is awaited. Explore runs once per iteration
/// with the models of every branch. Each stage is a barrier: nothing
/// downstream is dispatched before its inputs have resolved.
pub struct IterationEngine<L: Labeler, T: Trainer, E: Explorer, S: Selector> {
    stages: Stages<L, T, E, S>,
    resource_manager: Arc<ResourceManager>,
    label_context: L::ContextConfig,
    train_context: T::ContextConfig,
    explore_context: E::ContextConfig,
    updater: WalkthroughUpdater,
    path_prefix: PathBuf,
}

impl<L, T, E, S> IterationEngine<L, T, E, S>
where
    L: Labeler,
    T: Trainer,
    E: Explorer,
    S: Selector,
{
    /// Builds an engine and checks the workflow section under every update
    /// table entry, so schema errors surface before any job is submitted.
    pub fn new(
        stages: Stages<L, T, E, S>,
        resource_manager: Arc<ResourceManager>,
        context: &ContextConfig,
        raw_workflow: &Value,
        path_prefix: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let path_prefix = path_prefix.into();
        if path_prefix.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPathPrefix);
        }

        let engine = Self {
            stages,
            resource_manager,
            label_context: parse_section("executors.context.label", &context.label)?,
            train_context: parse_section("executors.context.train", &context.train)?,
            explore_context: parse_section("executors.context.explore", &context.explore)?,
            updater: WalkthroughUpdater::new(raw_workflow)?,
            path_prefix,
        };
        engine.validate()?;
        Ok(engine)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for cursor in 0..self.updater.table_len().max(1) {
            let workflow = self.updater.workflow_at(cursor)?;
            for (name, branch) in &workflow.branches {
                parse_section::<L::Config>(&format!("workflow.branches.{name}.label"), &branch.label)?;
                parse_section::<T::Config>(&format!("workflow.branches.{name}.train"), &branch.train)?;
                parse_section::<S::Config>(
                    &format!("workflow.branches.{name}.threshold"),
                    &branch.threshold,
                )?;
            }
            parse_section::<E::Config>("workflow.explore", &workflow.explore)?;
        }
        Ok(())
    }

    pub fn path_prefix(&self) -> &Path {
        &self.path_prefix
    }

    /// Runs iterations until `general.max_iters` of the configuration in
    /// effect is reached.
    pub async fn run(mut self) -> Result<RunSummary, WorkflowError> {
        let metrics = MetricsCollector::new();
        let mut summary = RunSummary::new(&self.path_prefix);
        let mut states: BranchStates<T, S> = BTreeMap::new();

        let mut iteration = 0;
        let mut workflow = self.updater.workflow()?;
        while iteration < workflow.general.max_iters {
            let cursor = self.updater.cursor();
            info!(
                iteration = iteration,
                max_iters = workflow.general.max_iters,
                update_cursor = cursor,
                branches = ?workflow.branch_names(),
                "Starting iteration"
            );

            let (next_states, stage_dirs, branches, explored) =
                self.run_iteration(iteration, &workflow, states).await?;
            states = next_states;

            let update = self.updater.update();
            summary.iterations.push(IterationSummary {
                iteration,
                update_cursor: cursor,
                stage_dirs,
                explored,
                branches,
                update,
            });

            iteration += 1;
            metrics.set_iterations_completed(iteration);
            workflow = self.updater.workflow()?;
        }

        info!(
            iterations = iteration,
            path_prefix = %self.path_prefix.display(),
            "Reached max_iters, workflow finished"
        );
        summary.finish();
        Ok(summary)
    }

    async fn run_iteration(
        &self,
        iteration: usize,
        workflow: &WorkflowConfig,
        mut states: BranchStates<T, S>,
    ) -> Result<
        (
            BranchStates<T, S>,
            Vec<PathBuf>,
            BTreeMap<String, BranchSummary>,
            usize,
        ),
        WorkflowError,
    > {
        let iter_dir = iteration_dir(iteration);
        let type_map = &workflow.general.type_map;
        let names: Vec<String> = workflow.branches.keys().cloned().collect();
        let mut stage_dirs = Vec::new();
        let stage_dir = |dirs: &mut Vec<PathBuf>, name: String| {
            let dir = iter_dir.join(name);
            dirs.push(dir.clone());
            self.path_prefix.join(dir)
        };

        // Branches present in this iteration's configuration, with their
        // state from the previous one. A branch without state seeds from its
        // initial data, even when an overlay adds it after iteration 0.
        let previous: Vec<BranchState<T::Output, S::Output>> = names
            .iter()
            .map(|name| states.remove(name).unwrap_or_default())
            .collect();

        // Label
        let started = Instant::now();
        let mut pending = Vec::with_capacity(names.len());
        for (name, state) in names.iter().zip(&previous) {
            let branch = &workflow.branches[name];
            let input = LabelInput {
                config: parse_section::<L::Config>(&format!("workflow.branches.{name}.label"), &branch.label)?,
                system_files: state
                    .select
                    .as_ref()
                    .map(|output| output.model_devi_dataset().to_vec())
                    .unwrap_or_default(),
                type_map: type_map.clone(),
                initiated: state.train.is_some(),
            };
            let path_prefix = stage_dir(&mut stage_dirs, format!("{name}-label-{}", self.stages.labeler.tool()));
            let ctx = StageContext::new(self.label_context.clone(), path_prefix, self.resource_manager.clone());
            debug!(iteration, branch = %name, inputs = input.system_files.len(), "Dispatching label");
            let future = self
                .stages
                .labeler
                .label(&input, &ctx)
                .await
                .map_err(|source| stage_error(iteration, "label", name, source))?;
            pending.push(resolve(future, iteration, "label", name.clone()));
        }
        let labeled: Vec<L::Output> = try_join_all(pending).await?;
        self.finish_stage(iteration, "label", started);

        // Train
        let started = Instant::now();
        let mut pending = Vec::with_capacity(names.len());
        for ((name, state), label) in names.iter().zip(&previous).zip(&labeled) {
            let branch = &workflow.branches[name];
            let input = TrainInput {
                config: parse_section::<T::Config>(&format!("workflow.branches.{name}.train"), &branch.train)?,
                type_map: type_map.clone(),
                old_dataset: state
                    .train
                    .as_ref()
                    .map(|output| output.training_dataset().to_vec())
                    .unwrap_or_default(),
                new_dataset: label.labeled_system_dataset().to_vec(),
                initiated: state.train.is_some(),
            };
            let path_prefix = stage_dir(&mut stage_dirs, format!("{name}-train-{}", self.stages.trainer.tool()));
            let ctx = StageContext::new(self.train_context.clone(), path_prefix, self.resource_manager.clone());
            debug!(
                iteration,
                branch = %name,
                old = input.old_dataset.len(),
                new = input.new_dataset.len(),
                "Dispatching train"
            );
            let future = self
                .stages
                .trainer
                .train(&input, &ctx)
                .await
                .map_err(|source| stage_error(iteration, "train", name, source))?;
            pending.push(resolve(future, iteration, "train", name.clone()));
        }
        let trained: Vec<T::Output> = try_join_all(pending).await?;
        self.finish_stage(iteration, "train", started);

        // Explore, once for all branches
        let started = Instant::now();
        let input = ExploreInput {
            config: parse_section::<E::Config>("workflow.explore", &workflow.explore)?,
            type_map: type_map.clone(),
            mass_map: workflow.general.mass_map.clone(),
            models: names
                .iter()
                .zip(&trained)
                .map(|(name, output)| (name.clone(), output.mlp_models().to_vec()))
                .collect(),
        };
        let path_prefix = stage_dir(&mut stage_dirs, format!("explore-{}", self.stages.explorer.tool()));
        let ctx = StageContext::new(self.explore_context.clone(), path_prefix, self.resource_manager.clone());
        let future = self
            .stages
            .explorer
            .explore(&input, &ctx)
            .await
            .map_err(|source| stage_error(iteration, "explore", "explore", source))?;
        let explored: E::Output = resolve(future, iteration, "explore", "explore".to_string()).await?;
        self.finish_stage(iteration, "explore", started);

        // Select
        let started = Instant::now();
        let mut pending = Vec::with_capacity(names.len());
        for name in &names {
            let branch = &workflow.branches[name];
            let input = SelectInput {
                config: parse_section::<S::Config>(
                    &format!("workflow.branches.{name}.threshold"),
                    &branch.threshold,
                )?,
                model_devi_data: explored.model_devi_dataset().to_vec(),
                model_devi_file: model_devi_file(name),
            };
            let path_prefix = stage_dir(&mut stage_dirs, format!("{name}-select-{}", self.stages.selector.tool()));
            let ctx = StageContext::new((), path_prefix, self.resource_manager.clone());
            let future = self
                .stages
                .selector
                .select(&input, &ctx)
                .await
                .map_err(|source| stage_error(iteration, "select", name, source))?;
            pending.push(resolve(future, iteration, "select", name.clone()));
        }
        let selected: Vec<S::Output> = try_join_all(pending).await?;
        self.finish_stage(iteration, "select", started);

        let mut summaries = BTreeMap::new();
        let mut next_states = BTreeMap::new();
        for (((name, label), train), select) in names.into_iter().zip(labeled).zip(trained).zip(selected) {
            summaries.insert(
                name.clone(),
                BranchSummary {
                    labeled: label.labeled_system_dataset().len(),
                    trained_on: train.training_dataset().len(),
                    models: train.mlp_models().len(),
                    selected: select.model_devi_dataset().len(),
                },
            );
            next_states.insert(
                name,
                BranchState {
                    train: Some(train),
                    select: Some(select),
                },
            );
        }

        Ok((
            next_states,
            stage_dirs,
            summaries,
            explored.model_devi_dataset().len(),
        ))
    }

    fn finish_stage(&self, iteration: usize, stage: &'static str, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64();
        MetricsCollector::new().record_stage(stage, elapsed);
        info!(iteration, stage, elapsed_secs = elapsed, "Stage finished");
    }
}

fn stage_error(iteration: usize, stage: &'static str, scope: &str, source: StageError) -> WorkflowError {
    WorkflowError::Stage {
        iteration,
        stage,
        scope: scope.to_string(),
        source,
    }
}

async fn resolve<O: Send + 'static>(
    future: StageFuture<O>,
    iteration: usize,
    stage: &'static str,
    scope: String,
) -> Result<O, WorkflowError> {
    future
        .result()
        .await
        .map_err(|e| stage_error(iteration, stage, &scope, StageError::from(e)))
}
