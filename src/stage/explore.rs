//! Explore stage: one simulation task per system and variable combination.
//!
//! The input template sees `system_file`, `type_map`, `mass_map`,
//! `models.<branch>` (frozen model paths of every branch), `resources`, and
//! each configured variable by name. A template is expected to make the
//! simulation write `model_devi_<branch>.out` for every branch, plus one dump
//! file per sampled step under `traj/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{deal_round_robin, render_template, task_dir, ExploreInput, ExploreOutput, Explorer, StageContext};
use crate::artifact::{format, Artifact};
use crate::config::StageConfig;
use crate::error::StageError;
use crate::job::{gather_outcomes, submit_with_retry, RetryPolicy, StageFuture};
use crate::script::{BashScript, BashStep, ScriptTemplate};

const TOOL: &str = "lammps";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExploreConfig {
    /// Catalog names of the starting structures.
    #[serde(default)]
    pub systems: Vec<String>,
    /// Values to sweep; every combination is explored for every system.
    #[serde(default)]
    pub variables: BTreeMap<String, Vec<Value>>,
    pub input_template: String,
    #[serde(default = "default_input_file")]
    pub input_file: String,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

/// Names the template context and output attributes already use.
const RESERVED_VARIABLES: &[&str] = &["system", "system_file", "type_map", "mass_map", "models", "resources"];

fn default_input_file() -> String {
    "in.lammps".to_string()
}

impl StageConfig for ExploreConfig {
    fn validate(&self) -> Result<(), String> {
        if let Some((name, _)) = self.variables.iter().find(|(_, values)| values.is_empty()) {
            return Err(format!("variable '{name}' has no values"));
        }
        if let Some(name) = self.variables.keys().find(|name| RESERVED_VARIABLES.contains(&name.as_str())) {
            return Err(format!("variable name '{name}' is reserved"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExploreContextConfig {
    pub script_template: ScriptTemplate,
    pub lmp_cmd: String,
    pub concurrency: usize,
    pub max_tries: u32,
}

impl Default for ExploreContextConfig {
    fn default() -> Self {
        Self {
            script_template: ScriptTemplate::default(),
            lmp_cmd: "lmp".to_string(),
            concurrency: 5,
            max_tries: 2,
        }
    }
}

impl StageConfig for ExploreContextConfig {
    fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Simulation task directories, one per explored combination.
#[derive(Debug, Clone, Default)]
pub struct ExploreTasks {
    outputs: Vec<Artifact>,
}

impl ExploreOutput for ExploreTasks {
    fn model_devi_dataset(&self) -> &[Artifact] {
        &self.outputs
    }
}

/// Runs `<lmp_cmd> -i <input_file>` for every explore task.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExplorer;

/// Every combination of the variable values, in key order.
///
/// No variables yields a single empty combination.
fn combinations(variables: &BTreeMap<String, Vec<Value>>) -> Vec<BTreeMap<String, Value>> {
    variables
        .iter()
        .fold(vec![BTreeMap::new()], |combos, (name, values)| {
            combos
                .iter()
                .flat_map(|combo| {
                    values.iter().map(move |value| {
                        let mut next = combo.clone();
                        next.insert(name.clone(), value.clone());
                        next
                    })
                })
                .collect()
        })
}

struct ExploreTask {
    system: Artifact,
    variables: BTreeMap<String, Value>,
}

#[derive(Serialize)]
struct InputValues<'a> {
    #[serde(flatten)]
    variables: &'a BTreeMap<String, Value>,
    system_file: &'a str,
    type_map: &'a [String],
    mass_map: &'a [f64],
    models: &'a BTreeMap<String, Vec<String>>,
    resources: &'a BTreeMap<String, String>,
}

struct TaskInputs {
    template: String,
    input_file: String,
    type_map: Vec<String>,
    mass_map: Vec<f64>,
    models: BTreeMap<String, Vec<String>>,
    resources: BTreeMap<String, String>,
}

fn make_task_dirs(tasks: &[ExploreTask], tasks_dir: &Path, inputs: &TaskInputs) -> Result<Vec<PathBuf>, StageError> {
    let mut dirs = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.iter().enumerate() {
        let dir = task_dir(tasks_dir, index);
        std::fs::create_dir_all(dir.join("traj"))?;
        let text = render_template(
            &inputs.template,
            &InputValues {
                variables: &task.variables,
                system_file: &task.system.url,
                type_map: &inputs.type_map,
                mass_map: &inputs.mass_map,
                models: &inputs.models,
                resources: &inputs.resources,
            },
        )?;
        std::fs::write(dir.join(&inputs.input_file), text)?;
        dirs.push(dir);
    }
    Ok(dirs)
}

#[async_trait]
impl Explorer for CommandExplorer {
    type Config = ExploreConfig;
    type ContextConfig = ExploreContextConfig;
    type Output = ExploreTasks;

    fn tool(&self) -> &str {
        TOOL
    }

    async fn explore(
        &self,
        input: &ExploreInput<ExploreConfig>,
        ctx: &StageContext<ExploreContextConfig>,
    ) -> Result<StageFuture<ExploreTasks>, StageError> {
        let config = &input.config;
        let systems = ctx.resource_manager.get_artifacts(&config.systems)?;
        let resources = ctx.resource_manager.resolve_resources(&config.resources)?;

        let (executor, work_dir) = ctx.workspace();
        let tasks_dir = match executor.setup_workspace(&work_dir, &["tasks"]).await?.pop() {
            Some(dir) => dir,
            None => return Err(StageError::InvalidInput("workspace has no tasks directory".to_string())),
        };

        let combos = combinations(&config.variables);
        let tasks: Vec<ExploreTask> = systems
            .iter()
            .flat_map(|system| {
                combos.iter().map(move |variables| ExploreTask {
                    system: system.clone(),
                    variables: variables.clone(),
                })
            })
            .collect();
        if tasks.is_empty() {
            warn!(path_prefix = %ctx.path_prefix.display(), "No systems to explore, skipping");
            return Ok(StageFuture::ready(ExploreTasks::default()));
        }

        let inputs = TaskInputs {
            template: config.input_template.clone(),
            input_file: config.input_file.clone(),
            type_map: input.type_map.clone(),
            mass_map: input.mass_map.clone(),
            models: input
                .models
                .iter()
                .map(|(branch, models)| (branch.clone(), models.iter().map(|m| m.url.clone()).collect()))
                .collect(),
            resources,
        };
        let base = tasks_dir.clone();
        let (tasks, task_dirs) = executor
            .run_function(move || -> Result<_, StageError> {
                let dirs = make_task_dirs(&tasks, &base, &inputs)?;
                Ok((tasks, dirs))
            })
            .await?;

        let context = &ctx.config;
        let cmd = format!("{} -i {} 1>> lammps.log 2>&1", context.lmp_cmd, config.input_file);
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
            "Explore jobs submitted"
        );

        let outputs = tasks
            .into_iter()
            .zip(&task_dirs)
            .map(|(task, dir)| {
                let mut artifact =
                    Artifact::of(dir.display().to_string(), format::LAMMPS_OUTPUT_DIR, executor.name())
                        .with_attr("system", task.system.url);
                artifact.attrs.extend(task.variables);
                artifact
            })
            .collect();
        Ok(gather_outcomes(jobs).replace(ExploreTasks { outputs }))
    }
}
