//! Train stage fitting an ensemble of models on the cumulative dataset.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::{StageContext, TrainInput, TrainOutput, Trainer};
use crate::artifact::{format, Artifact};
use crate::config::{merge_values, StageConfig};
use crate::error::StageError;
use crate::job::{gather_outcomes, submit_with_retry, RetryPolicy, StageFuture};
use crate::script::{BashScript, BashStep, ScriptTemplate};

const TOOL: &str = "deepmd";
const INPUT_FILE: &str = "input.json";
const FROZEN_MODEL: &str = "frozen_model.pb";

/// Workflow settings of the train stage of one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of models in the ensemble.
    #[serde(default = "default_model_num")]
    pub model_num: usize,
    /// Catalog names of the datasets added on the first iteration.
    #[serde(default)]
    pub init_dataset: Vec<String>,
    /// Training input; type map, data systems and seeds are filled in.
    #[serde(default)]
    pub input_template: Value,
}

fn default_model_num() -> usize {
    4
}

impl StageConfig for TrainConfig {
    fn validate(&self) -> Result<(), String> {
        if self.model_num == 0 {
            return Err("model_num must be at least 1".to_string());
        }
        if !(self.input_template.is_null() || self.input_template.is_mapping()) {
            return Err("input_template must be a mapping".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainContextConfig {
    pub script_template: ScriptTemplate,
    pub dp_cmd: String,
    pub max_tries: u32,
}

impl Default for TrainContextConfig {
    fn default() -> Self {
        Self {
            script_template: ScriptTemplate::default(),
            dp_cmd: "dp".to_string(),
            max_tries: 2,
        }
    }
}

impl StageConfig for TrainContextConfig {}

/// Frozen models and the dataset they were trained on.
#[derive(Debug, Clone, Default)]
pub struct TrainedModels {
    models: Vec<Artifact>,
    dataset: Vec<Artifact>,
}

impl TrainOutput for TrainedModels {
    fn mlp_models(&self) -> &[Artifact] {
        &self.models
    }

    fn training_dataset(&self) -> &[Artifact] {
        &self.dataset
    }
}

/// Trains `model_num` models with `<dp_cmd> train` and freezes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandTrainer;

/// Deterministic seed for one random stream of one task.
fn derive_seed(task_dir: &Path, stream: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(task_dir.display().to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(stream.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn training_input(
    template: &Value,
    type_map: &[String],
    systems: &[String],
    task_dir: &Path,
) -> Result<String, StageError> {
    let overlay = json!({
        "model": {
            "type_map": type_map,
            "descriptor": {"seed": derive_seed(task_dir, "descriptor")},
            "fitting_net": {"seed": derive_seed(task_dir, "fitting_net")},
        },
        "training": {
            "seed": derive_seed(task_dir, "training"),
            "training_data": {"systems": systems},
        },
    });
    let overlay = serde_yaml::to_value(overlay)
        .map_err(|e| StageError::InvalidInput(format!("training input: {e}")))?;
    let merged = merge_values(template, &overlay);
    Ok(serde_json::to_string_pretty(&merged)?)
}

fn make_task_dirs(
    tasks_dir: &Path,
    model_num: usize,
    template: &Value,
    type_map: &[String],
    systems: &[String],
) -> Result<Vec<PathBuf>, StageError> {
    (0..model_num)
        .map(|index| -> Result<PathBuf, StageError> {
            let dir = tasks_dir.join(format!("{index:03}"));
            std::fs::create_dir_all(&dir)?;
            let input = training_input(template, type_map, systems, &dir)?;
            std::fs::write(dir.join(INPUT_FILE), input)?;
            Ok(dir)
        })
        .collect()
}

#[async_trait]
impl Trainer for CommandTrainer {
    type Config = TrainConfig;
    type ContextConfig = TrainContextConfig;
    type Output = TrainedModels;

    fn tool(&self) -> &str {
        TOOL
    }

    async fn train(
        &self,
        input: &TrainInput<TrainConfig>,
        ctx: &StageContext<TrainContextConfig>,
    ) -> Result<StageFuture<TrainedModels>, StageError> {
        let mut dataset: Vec<Artifact> = input
            .old_dataset
            .iter()
            .chain(input.new_dataset.iter())
            .cloned()
            .collect();
        if !input.initiated {
            dataset.extend(ctx.resource_manager.get_artifacts(&input.config.init_dataset)?);
        }

        let (executor, work_dir) = ctx.workspace();
        let tasks_dir = match executor.setup_workspace(&work_dir, &["tasks"]).await?.pop() {
            Some(dir) => dir,
            None => return Err(StageError::InvalidInput("workspace has no tasks directory".to_string())),
        };

        if dataset.is_empty() {
            warn!(path_prefix = %ctx.path_prefix.display(), "No training data, skipping");
            return Ok(StageFuture::ready(TrainedModels::default()));
        }

        let systems: Vec<String> = dataset.iter().map(|a| a.url.clone()).collect();
        let template = input.config.input_template.clone();
        let type_map = input.type_map.clone();
        let model_num = input.config.model_num;
        let base = tasks_dir.clone();
        let task_dirs = executor
            .run_function(move || make_task_dirs(&base, model_num, &template, &type_map, &systems))
            .await?;

        let context = &ctx.config;
        let mut jobs = Vec::with_capacity(task_dirs.len());
        for dir in &task_dirs {
            let steps = vec![
                BashStep::new(dir.clone(), format!("{} train {INPUT_FILE}", context.dp_cmd))
                    .with_checkpoint("dp-train"),
                BashStep::new(dir.clone(), format!("{} freeze -o {FROZEN_MODEL}", context.dp_cmd))
                    .with_checkpoint("dp-freeze"),
            ];
            let script = BashScript::new(&context.script_template, steps).render()?;
            let job = submit_with_retry(
                executor.clone(),
                script,
                dir.clone(),
                RetryPolicy::new(context.max_tries),
            )
            .await?;
            jobs.push(job);
        }
        info!(
            path_prefix = %ctx.path_prefix.display(),
            models = jobs.len(),
            systems = dataset.len(),
            "Train jobs submitted"
        );

        let models = task_dirs
            .iter()
            .map(|dir| {
                Artifact::of(
                    dir.join(FROZEN_MODEL).display().to_string(),
                    format::DEEPMD_MODEL,
                    executor.name(),
                )
            })
            .collect();
        Ok(gather_outcomes(jobs).replace(TrainedModels { models, dataset }))
    }
}
