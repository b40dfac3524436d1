//! Iteration engine tests with recording stages.
//!
//! The stages below do no real work: they create their workspace, record the
//! input they were given, and return outputs derived from it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_yaml::Value;
use tempfile::TempDir;

use mlp_forge::artifact::{Artifact, ArtifactCatalog};
use mlp_forge::config::ContextConfig;
use mlp_forge::error::{JobError, StageError, WorkflowError};
use mlp_forge::executor::{Executor, LocalExecutor};
use mlp_forge::job::StageFuture;
use mlp_forge::resource::ResourceManager;
use mlp_forge::stage::{
    ExploreInput, ExploreOutput, Explorer, LabelInput, LabelOutput, Labeler, SelectInput,
    SelectOutput, Selector, StageContext, TrainInput, TrainOutput, Trainer,
};
use mlp_forge::workflow::{IterationEngine, Stages};
use mlp_forge::ConfigError;

#[derive(Debug, Clone)]
enum Event {
    LabelDispatched { prefix: PathBuf, system_files: Vec<Artifact>, initiated: bool },
    LabelResolved { prefix: PathBuf },
    Trained { prefix: PathBuf, dataset: Vec<Artifact> },
    Explored { prefix: PathBuf, models: BTreeMap<String, Vec<Artifact>>, config: Value },
    Selected { prefix: PathBuf, output: Vec<Artifact> },
}

type Log = Arc<Mutex<Vec<Event>>>;

fn branch_of(prefix: &Path) -> String {
    let name = prefix.file_name().unwrap().to_string_lossy().to_string();
    name.split('-').next().unwrap().to_string()
}

fn iteration_of(prefix: &Path) -> usize {
    let name = prefix.parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
    name.trim_start_matches("iters-").parse().unwrap()
}

async fn workspace<C>(ctx: &StageContext<C>) -> PathBuf {
    let (executor, work_dir) = ctx.workspace();
    executor.setup_workspace(&work_dir, &[]).await.unwrap();
    work_dir
}

fn artifact(url: impl Into<String>) -> Artifact {
    Artifact::of(url, "fake/data", "local")
}

struct Dataset(Vec<Artifact>);

impl LabelOutput for Dataset {
    fn labeled_system_dataset(&self) -> &[Artifact] {
        &self.0
    }
}

impl ExploreOutput for Dataset {
    fn model_devi_dataset(&self) -> &[Artifact] {
        &self.0
    }
}

impl SelectOutput for Dataset {
    fn model_devi_dataset(&self) -> &[Artifact] {
        &self.0
    }
}

struct Models {
    models: Vec<Artifact>,
    dataset: Vec<Artifact>,
}

impl TrainOutput for Models {
    fn mlp_models(&self) -> &[Artifact] {
        &self.models
    }

    fn training_dataset(&self) -> &[Artifact] {
        &self.dataset
    }
}

struct RecordingLabeler(Log);

#[async_trait]
impl Labeler for RecordingLabeler {
    type Config = Value;
    type ContextConfig = Value;
    type Output = Dataset;

    fn tool(&self) -> &str {
        "fake"
    }

    async fn label(
        &self,
        input: &LabelInput<Value>,
        ctx: &StageContext<Value>,
    ) -> Result<StageFuture<Dataset>, StageError> {
        let work_dir = workspace(ctx).await;
        self.0.lock().unwrap().push(Event::LabelDispatched {
            prefix: ctx.path_prefix.clone(),
            system_files: input.system_files.clone(),
            initiated: input.initiated,
        });
        if input.config.get("fail").and_then(Value::as_bool) == Some(true) {
            return Ok(StageFuture::failed(JobError::Failed {
                job_id: uuid::Uuid::new_v4(),
                cwd: work_dir,
                attempts: 2,
                exit_code: Some(1),
            }));
        }

        let mut labeled: Vec<Artifact> = (0..input.system_files.len())
            .map(|i| artifact(work_dir.join(format!("{i:06}")).display().to_string()))
            .collect();
        if !input.initiated {
            labeled.push(artifact(work_dir.join("init").display().to_string()));
        }
        let log = self.0.clone();
        let prefix = ctx.path_prefix.clone();
        Ok(StageFuture::new(async move {
            log.lock().unwrap().push(Event::LabelResolved { prefix });
            Ok(Dataset(labeled))
        }))
    }
}

struct RecordingTrainer(Log);

#[async_trait]
impl Trainer for RecordingTrainer {
    type Config = Value;
    type ContextConfig = Value;
    type Output = Models;

    fn tool(&self) -> &str {
        "fake"
    }

    async fn train(
        &self,
        input: &TrainInput<Value>,
        ctx: &StageContext<Value>,
    ) -> Result<StageFuture<Models>, StageError> {
        let work_dir = workspace(ctx).await;
        let dataset: Vec<Artifact> = input
            .old_dataset
            .iter()
            .chain(&input.new_dataset)
            .cloned()
            .collect();
        self.0.lock().unwrap().push(Event::Trained {
            prefix: ctx.path_prefix.clone(),
            dataset: dataset.clone(),
        });
        let models = vec![artifact(work_dir.join("model.pb").display().to_string())];
        Ok(StageFuture::ready(Models { models, dataset }))
    }
}

struct RecordingExplorer(Log);

#[async_trait]
impl Explorer for RecordingExplorer {
    type Config = Value;
    type ContextConfig = Value;
    type Output = Dataset;

    fn tool(&self) -> &str {
        "fake"
    }

    async fn explore(
        &self,
        input: &ExploreInput<Value>,
        ctx: &StageContext<Value>,
    ) -> Result<StageFuture<Dataset>, StageError> {
        let work_dir = workspace(ctx).await;
        self.0.lock().unwrap().push(Event::Explored {
            prefix: ctx.path_prefix.clone(),
            models: input.models.clone(),
            config: input.config.clone(),
        });
        let tasks = (0..2)
            .map(|i| artifact(work_dir.join(format!("{i:06}")).display().to_string()))
            .collect();
        Ok(StageFuture::ready(Dataset(tasks)))
    }
}

struct RecordingSelector(Log);

#[async_trait]
impl Selector for RecordingSelector {
    type Config = Value;
    type Output = Dataset;

    fn tool(&self) -> &str {
        "fake"
    }

    async fn select(
        &self,
        input: &SelectInput<Value>,
        ctx: &StageContext<()>,
    ) -> Result<StageFuture<Dataset>, StageError> {
        workspace(ctx).await;
        let output: Vec<Artifact> = input
            .model_devi_data
            .iter()
            .take(1)
            .map(|a| a.clone().with_attr("model_devi_file", input.model_devi_file.clone()))
            .collect();
        self.0.lock().unwrap().push(Event::Selected {
            prefix: ctx.path_prefix.clone(),
            output: output.clone(),
        });
        Ok(StageFuture::ready(Dataset(output)))
    }
}

type Engine = IterationEngine<RecordingLabeler, RecordingTrainer, RecordingExplorer, RecordingSelector>;

fn engine(temp: &TempDir, workflow: &str) -> Result<(Engine, Log), ConfigError> {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
    executors.insert(
        "local".to_string(),
        Arc::new(LocalExecutor::new("local", temp.path())),
    );
    let manager = ResourceManager::with_executors(ArtifactCatalog::default(), executors, "local")?;
    let stages = Stages {
        labeler: RecordingLabeler(log.clone()),
        trainer: RecordingTrainer(log.clone()),
        explorer: RecordingExplorer(log.clone()),
        selector: RecordingSelector(log.clone()),
    };
    let raw: Value = serde_yaml::from_str(workflow).unwrap();
    let engine = IterationEngine::new(
        stages,
        Arc::new(manager),
        &ContextConfig::default(),
        &raw,
        "runs/test",
    )?;
    Ok((engine, log))
}

const TWO_BRANCHES: &str = "
general: {type_map: [H, O], mass_map: [1.008, 15.999], max_iters: 2}
branches:
  a: {}
  b: {}
";

#[tokio::test]
async fn test_two_branches_two_iterations() {
    let temp = TempDir::new().unwrap();
    let (engine, log) = engine(&temp, TWO_BRANCHES).unwrap();

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.iterations_completed(), 2);
    for iteration in &summary.iterations {
        assert_eq!(iteration.stage_dirs.len(), 7);
        for name in [
            "a-label-fake",
            "a-train-fake",
            "a-select-fake",
            "b-label-fake",
            "b-train-fake",
            "b-select-fake",
            "explore-fake",
        ] {
            let dir = temp
                .path()
                .join("runs/test")
                .join(format!("iters-{:03}", iteration.iteration))
                .join(name);
            assert!(dir.is_dir(), "missing {}", dir.display());
        }
    }
    assert!(!temp.path().join("runs/test/iters-002").exists());

    let events = log.lock().unwrap().clone();

    // Branch a, iteration 1 labels exactly what branch a selected in iteration 0.
    let selected_a0 = events
        .iter()
        .find_map(|e| match e {
            Event::Selected { prefix, output } if branch_of(prefix) == "a" && iteration_of(prefix) == 0 => {
                Some(output.clone())
            }
            _ => None,
        })
        .unwrap();
    let label_a1 = events
        .iter()
        .find_map(|e| match e {
            Event::LabelDispatched { prefix, system_files, initiated }
                if branch_of(prefix) == "a" && iteration_of(prefix) == 1 =>
            {
                assert!(*initiated);
                Some(system_files.clone())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(label_a1, selected_a0);
    assert_eq!(
        selected_a0[0].attrs["model_devi_file"],
        serde_json::json!("model_devi_a.out")
    );
}

#[tokio::test]
async fn test_training_dataset_is_cumulative() {
    let temp = TempDir::new().unwrap();
    let (engine, log) = engine(&temp, TWO_BRANCHES).unwrap();
    engine.run().await.unwrap();

    let events = log.lock().unwrap().clone();
    let datasets: Vec<(usize, String, Vec<Artifact>)> = events
        .iter()
        .filter_map(|e| match e {
            Event::Trained { prefix, dataset } => {
                Some((iteration_of(prefix), branch_of(prefix), dataset.clone()))
            }
            _ => None,
        })
        .collect();

    for branch in ["a", "b"] {
        let first = &datasets.iter().find(|(i, b, _)| *i == 0 && b == branch).unwrap().2;
        let second = &datasets.iter().find(|(i, b, _)| *i == 1 && b == branch).unwrap().2;
        assert!(second.len() > first.len());
        assert!(first.iter().all(|a| second.contains(a)));
    }
}

#[tokio::test]
async fn test_branches_dispatch_before_resolving() {
    let temp = TempDir::new().unwrap();
    let (engine, log) = engine(&temp, TWO_BRANCHES).unwrap();
    engine.run().await.unwrap();

    let events = log.lock().unwrap().clone();
    let label_events: Vec<&Event> = events
        .iter()
        .filter(|e| matches!(e, Event::LabelDispatched { .. } | Event::LabelResolved { .. }))
        .take(4)
        .collect();
    assert!(matches!(label_events[0], Event::LabelDispatched { .. }));
    assert!(matches!(label_events[1], Event::LabelDispatched { .. }));
    assert!(matches!(label_events[2], Event::LabelResolved { .. }));
    assert!(matches!(label_events[3], Event::LabelResolved { .. }));
}

#[tokio::test]
async fn test_explore_sees_models_of_every_branch() {
    let temp = TempDir::new().unwrap();
    let (engine, log) = engine(&temp, TWO_BRANCHES).unwrap();
    engine.run().await.unwrap();

    let events = log.lock().unwrap().clone();
    let explored: Vec<&BTreeMap<String, Vec<Artifact>>> = events
        .iter()
        .filter_map(|e| match e {
            Event::Explored { models, .. } => Some(models),
            _ => None,
        })
        .collect();
    assert_eq!(explored.len(), 2);
    for models in explored {
        assert_eq!(models.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(models.values().all(|m| m.len() == 1));
    }
}

#[tokio::test]
async fn test_update_table_cursor_and_overlays() {
    let temp = TempDir::new().unwrap();
    let workflow = "
general: {type_map: [H], mass_map: [1.008], max_iters: 4}
branches: {a: {}}
explore: {temp: 100}
update:
  walkthrough:
    table:
      - explore: {temp: 300}
      - explore: {temp: 400}
";
    let (engine, log) = engine(&temp, workflow).unwrap();

    let summary = engine.run().await.unwrap();

    let cursors: Vec<usize> = summary.iterations.iter().map(|i| i.update_cursor).collect();
    assert_eq!(cursors, vec![0, 1, 1, 1]);

    let temps: Vec<u64> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Explored { config, .. } => config["temp"].as_u64(),
            _ => None,
        })
        .collect();
    assert_eq!(temps, vec![300, 400, 400, 400]);
}

#[tokio::test]
async fn test_overlay_can_lower_max_iters() {
    let temp = TempDir::new().unwrap();
    let workflow = "
general: {type_map: [H], mass_map: [1.008], max_iters: 10}
branches: {a: {}}
update:
  walkthrough:
    table:
      - {}
      - general: {max_iters: 2}
";
    let (engine, _) = engine(&temp, workflow).unwrap();

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.iterations_completed(), 2);
}

#[tokio::test]
async fn test_branch_added_by_overlay_seeds_from_initial_data() {
    let temp = TempDir::new().unwrap();
    let workflow = "
general: {type_map: [H], mass_map: [1.008], max_iters: 3}
branches: {a: {}}
update:
  walkthrough:
    table:
      - {}
      - branches: {c: {}}
";
    let (engine, log) = engine(&temp, workflow).unwrap();

    let summary = engine.run().await.unwrap();

    let initiated: Vec<(usize, String, bool)> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::LabelDispatched { prefix, initiated, .. } => {
                Some((iteration_of(prefix), branch_of(prefix), *initiated))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        initiated,
        vec![
            (0, "a".to_string(), false),
            (1, "a".to_string(), true),
            (1, "c".to_string(), false),
            (2, "a".to_string(), true),
            (2, "c".to_string(), true),
        ]
    );
    // The late branch trained on its initial data.
    assert_eq!(summary.iterations[1].branches["c"].trained_on, 1);
}

#[tokio::test]
async fn test_zero_max_iters_runs_nothing() {
    let temp = TempDir::new().unwrap();
    let workflow = "
general: {type_map: [H], mass_map: [1.008], max_iters: 0}
branches: {a: {}}
";
    let (engine, log) = engine(&temp, workflow).unwrap();

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.iterations_completed(), 0);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_branch_aborts_run() {
    let temp = TempDir::new().unwrap();
    let workflow = "
general: {type_map: [H], mass_map: [1.008], max_iters: 3}
branches:
  a: {}
  b: {label: {fail: true}}
";
    let (engine, log) = engine(&temp, workflow).unwrap();

    let err = engine.run().await.unwrap_err();

    match err {
        WorkflowError::Stage { iteration, stage, scope, source } => {
            assert_eq!((iteration, stage, scope.as_str()), (0, "label", "b"));
            assert!(matches!(source, StageError::Job(JobError::Failed { .. })));
        }
        other => panic!("expected stage error, got {other:?}"),
    }
    let trained = log
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, Event::Trained { .. }))
        .count();
    assert_eq!(trained, 0);
}

#[test]
fn test_schema_errors_surface_before_any_work() {
    let temp = TempDir::new().unwrap();
    let workflow = "
general: {type_map: [H, O], mass_map: [1.008]}
branches: {a: {}}
";
    let result = engine(&temp, workflow);

    assert!(matches!(result, Err(ConfigError::Schema { .. })));
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}
