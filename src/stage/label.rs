//! Label stage running a reference-calculation command per structure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{copy_into, deal_round_robin, render_template, task_dir, LabelInput, LabelOutput, Labeler, StageContext};
use crate::artifact::{format, Artifact};
use crate::config::StageConfig;
use crate::error::StageError;
use crate::job::{gather_outcomes, submit_with_retry, RetryPolicy, StageFuture};
use crate::script::{BashScript, BashStep, ScriptTemplate};

const TOOL: &str = "cp2k";

/// Workflow settings of the label stage of one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Catalog names of the structures labeled on the first iteration.
    #[serde(default)]
    pub init_system_files: Vec<String>,
    /// Maximum number of structures per iteration, 0 for no limit.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Tera template of the calculation input. Sees `system_file`,
    /// `type_map`, `index` and `resources`.
    pub input_template: String,
    #[serde(default = "default_input_file")]
    pub input_file: String,
    /// Named files used by the template; `@name` values are artifact
    /// references.
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

fn default_limit() -> usize {
    50
}

fn default_input_file() -> String {
    "input.inp".to_string()
}

impl StageConfig for LabelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.input_file.trim().is_empty() {
            return Err("input_file is empty".to_string());
        }
        Ok(())
    }
}

/// Executor settings of the label stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelContextConfig {
    pub script_template: ScriptTemplate,
    pub cmd: String,
    /// Number of jobs the tasks are spread over.
    pub concurrency: usize,
    pub max_tries: u32,
}

impl Default for LabelContextConfig {
    fn default() -> Self {
        Self {
            script_template: ScriptTemplate::default(),
            cmd: TOOL.to_string(),
            concurrency: 5,
            max_tries: 2,
        }
    }
}

impl StageConfig for LabelContextConfig {
    fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Task directories holding reference calculations.
#[derive(Debug, Clone, Default)]
pub struct LabeledTasks {
    outputs: Vec<Artifact>,
}

impl LabelOutput for LabeledTasks {
    fn labeled_system_dataset(&self) -> &[Artifact] {
        &self.outputs
    }
}

/// Runs `<cmd> -i <input_file>` in one task directory per structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLabeler;

#[derive(Serialize)]
struct InputValues<'a> {
    system_file: String,
    type_map: &'a [String],
    index: usize,
    resources: &'a BTreeMap<String, String>,
}

/// Structure files to label, in input order.
fn collect_frames(system_files: &[Artifact]) -> Result<Vec<PathBuf>, StageError> {
    let mut frames = Vec::new();
    for artifact in system_files {
        match artifact.format() {
            format::LAMMPS_OUTPUT_DIR => {
                frames.extend(artifact.attr_strings("candidates").into_iter().map(PathBuf::from));
            }
            format::EXTXYZ | format::LAMMPS_DUMP_TEXT => frames.push(PathBuf::from(&artifact.url)),
            other => {
                return Err(StageError::UnsupportedFormat {
                    url: artifact.url.clone(),
                    format: other.to_string(),
                })
            }
        }
    }
    Ok(frames)
}

fn make_task_dirs(
    frames: &[PathBuf],
    tasks_dir: &Path,
    config: &LabelConfig,
    type_map: &[String],
    resources: &BTreeMap<String, String>,
) -> Result<Vec<PathBuf>, StageError> {
    let mut dirs = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let dir = task_dir(tasks_dir, index);
        std::fs::create_dir_all(&dir)?;
        let system_file = copy_into(frame, &dir)?;
        let input = render_template(
            &config.input_template,
            &InputValues {
                system_file: system_file.display().to_string(),
                type_map,
                index,
                resources,
            },
        )?;
        std::fs::write(dir.join(&config.input_file), input)?;
        dirs.push(dir);
    }
    Ok(dirs)
}

#[async_trait]
impl Labeler for CommandLabeler {
    type Config = LabelConfig;
    type ContextConfig = LabelContextConfig;
    type Output = LabeledTasks;

    fn tool(&self) -> &str {
        TOOL
    }

    async fn label(
        &self,
        input: &LabelInput<LabelConfig>,
        ctx: &StageContext<LabelContextConfig>,
    ) -> Result<StageFuture<LabeledTasks>, StageError> {
        let resource_manager = &ctx.resource_manager;
        let mut system_files = input.system_files.clone();
        if !input.initiated {
            system_files.extend(resource_manager.get_artifacts(&input.config.init_system_files)?);
        }
        let resources = resource_manager.resolve_resources(&input.config.resources)?;
        let mut frames = collect_frames(&system_files)?;
        if input.config.limit > 0 {
            frames.truncate(input.config.limit);
        }

        let (executor, work_dir) = ctx.workspace();
        let tasks_dir = match executor.setup_workspace(&work_dir, &["tasks"]).await?.pop() {
            Some(dir) => dir,
            None => return Err(StageError::InvalidInput("workspace has no tasks directory".to_string())),
        };

        if frames.is_empty() {
            warn!(path_prefix = %ctx.path_prefix.display(), "No structures to label, skipping");
            return Ok(StageFuture::ready(LabeledTasks::default()));
        }

        let config = input.config.clone();
        let type_map = input.type_map.clone();
        let base = tasks_dir.clone();
        let task_dirs = executor
            .run_function(move || make_task_dirs(&frames, &base, &config, &type_map, &resources))
            .await?;

        let context = &ctx.config;
        let cmd = format!("{} -i {} 1>> output 2>> output", context.cmd, input.config.input_file);
        let mut jobs = Vec::new();
        for group in deal_round_robin(task_dirs.clone(), context.concurrency) {
            let steps = group
                .into_iter()
                .map(|dir| BashStep::new(dir, cmd.clone()).with_checkpoint(TOOL))
                .collect();
            let script = BashScript::new(&context.script_template, steps).render()?;
            let job = submit_with_retry(
                executor.clone(),
                script,
                tasks_dir.clone(),
                RetryPolicy::new(context.max_tries),
            )
            .await?;
            jobs.push(job);
        }
        info!(
            path_prefix = %ctx.path_prefix.display(),
            tasks = task_dirs.len(),
            jobs = jobs.len(),
            "Label jobs submitted"
        );

        let outputs = task_dirs
            .iter()
            .map(|dir| Artifact::of(dir.display().to_string(), format::CP2K_OUTPUT_DIR, executor.name()))
            .collect();
        Ok(gather_outcomes(jobs).replace(LabeledTasks { outputs }))
    }
}
