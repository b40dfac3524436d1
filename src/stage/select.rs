//! Select stage: pick structures whose model deviation is in the trust window.
//!
//! Each explore task directory holds a model-deviation file per branch. Rows
//! are `step max_devi_v min_devi_v avg_devi_v max_devi_f ...`, comment lines
//! start with `#`. A frame is *good* when `max_devi_f < f_trust_lo` (the
//! models agree, nothing to learn), *poor* when `max_devi_f >= f_trust_hi`
//! (likely unphysical), and *decent* in between. Decent frames become the
//! candidates labeled in the next iteration.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{SelectInput, SelectOutput, Selector, StageContext};
use crate::artifact::{format, Artifact};
use crate::config::StageConfig;
use crate::error::StageError;
use crate::job::StageFuture;

const TOOL: &str = "threshold";
const STATS_FILE: &str = "stats.tsv";
const MAX_DEVI_F_COLUMN: usize = 4;
const DUMP_DIR: &str = "traj";
const DUMP_EXTENSION: &str = "lammpstrj";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub f_trust_lo: f64,
    pub f_trust_hi: f64,
    /// Maximum number of candidates, 0 for no limit.
    #[serde(default)]
    pub limit: usize,
}

impl StageConfig for ThresholdConfig {
    fn validate(&self) -> Result<(), String> {
        if self.f_trust_lo > self.f_trust_hi {
            return Err(format!(
                "f_trust_lo ({}) is greater than f_trust_hi ({})",
                self.f_trust_lo, self.f_trust_hi
            ));
        }
        Ok(())
    }
}

/// Explore tasks that produced candidates.
#[derive(Debug, Clone, Default)]
pub struct SelectedCandidates {
    outputs: Vec<Artifact>,
}

impl SelectOutput for SelectedCandidates {
    fn model_devi_dataset(&self) -> &[Artifact] {
        &self.outputs
    }
}

/// Selects frames by maximum force deviation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdSelector;

#[derive(Debug, Default, PartialEq)]
struct Classified {
    good: usize,
    decent: Vec<u64>,
    poor: usize,
}

fn read_model_devi(path: &Path) -> Result<Vec<(u64, f64)>, StageError> {
    let text = std::fs::read_to_string(path)?;
    parse_model_devi(&text).map_err(|message| {
        StageError::InvalidInput(format!("{}: {message}", path.display()))
    })
}

fn parse_model_devi(text: &str) -> Result<Vec<(u64, f64)>, String> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let columns: Vec<&str> = line.split_whitespace().collect();
        let (Some(step), Some(max_devi_f)) = (columns.first(), columns.get(MAX_DEVI_F_COLUMN)) else {
            return Err(format!("line {} has {} columns", lineno + 1, columns.len()));
        };
        // Steps are written as floats by some versions.
        let step = step
            .parse::<f64>()
            .map_err(|e| format!("line {}: bad step '{step}': {e}", lineno + 1))?;
        let max_devi_f = max_devi_f
            .parse::<f64>()
            .map_err(|e| format!("line {}: bad deviation '{max_devi_f}': {e}", lineno + 1))?;
        rows.push((step as u64, max_devi_f));
    }
    Ok(rows)
}

fn classify(rows: &[(u64, f64)], config: &ThresholdConfig) -> Classified {
    let mut classified = Classified::default();
    for &(step, max_devi_f) in rows {
        if max_devi_f < config.f_trust_lo {
            classified.good += 1;
        } else if max_devi_f < config.f_trust_hi {
            classified.decent.push(step);
        } else {
            classified.poor += 1;
        }
    }
    classified
}

/// Dump files under `<task_dir>/traj`, keyed by the step in their file stem.
fn dump_files(task_dir: &Path) -> BTreeMap<u64, PathBuf> {
    WalkDir::new(task_dir.join(DUMP_DIR))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == DUMP_EXTENSION))
        .filter_map(|entry| {
            let step = entry.path().file_stem()?.to_str()?.parse::<u64>().ok()?;
            Some((step, entry.into_path()))
        })
        .collect()
}

fn select_candidates(
    data: &[Artifact],
    model_devi_file: &str,
    config: &ThresholdConfig,
    work_dir: &Path,
) -> Result<Vec<Artifact>, StageError> {
    let mut stats = String::from("url\tgood\tdecent\tpoor\tcandidates\n");
    let mut outputs = Vec::new();
    let mut budget = if config.limit > 0 { config.limit } else { usize::MAX };

    for artifact in data {
        let task_dir = Path::new(&artifact.url);
        let devi_path = task_dir.join(model_devi_file);
        if !devi_path.is_file() {
            warn!(path = %devi_path.display(), "Model deviation file not found, no candidates");
            continue;
        }

        let classified = classify(&read_model_devi(&devi_path)?, config);
        let dumps = dump_files(task_dir);
        let mut candidates: Vec<String> = classified
            .decent
            .iter()
            .filter_map(|step| dumps.get(step))
            .map(|path| path.display().to_string())
            .collect();
        candidates.truncate(budget);
        budget -= candidates.len();

        let _ = writeln!(
            stats,
            "{}\t{}\t{}\t{}\t{}",
            artifact.url,
            classified.good,
            classified.decent.len(),
            classified.poor,
            candidates.len()
        );
        debug!(
            url = %artifact.url,
            good = classified.good,
            decent = classified.decent.len(),
            poor = classified.poor,
            candidates = candidates.len(),
            "Classified explore task"
        );

        if candidates.is_empty() {
            continue;
        }
        outputs.push(
            artifact
                .clone()
                .with_attr("candidates", candidates)
                .with_attr("good", classified.good)
                .with_attr("decent", classified.decent.len())
                .with_attr("poor", classified.poor),
        );
    }

    std::fs::write(work_dir.join(STATS_FILE), stats)?;
    Ok(outputs)
}

#[async_trait]
impl Selector for ThresholdSelector {
    type Config = ThresholdConfig;
    type Output = SelectedCandidates;

    fn tool(&self) -> &str {
        TOOL
    }

    async fn select(
        &self,
        input: &SelectInput<ThresholdConfig>,
        ctx: &StageContext<()>,
    ) -> Result<StageFuture<SelectedCandidates>, StageError> {
        if let Some(artifact) = input
            .model_devi_data
            .iter()
            .find(|a| a.format() != format::LAMMPS_OUTPUT_DIR)
        {
            return Err(StageError::UnsupportedFormat {
                url: artifact.url.clone(),
                format: artifact.format().to_string(),
            });
        }

        let (executor, work_dir) = ctx.workspace();
        executor.setup_workspace(&work_dir, &[]).await?;

        if input.model_devi_data.is_empty() {
            warn!(path_prefix = %ctx.path_prefix.display(), "No explore results to select from, skipping");
            return Ok(StageFuture::ready(SelectedCandidates::default()));
        }

        let data = input.model_devi_data.clone();
        let model_devi_file = input.model_devi_file.clone();
        let config = input.config.clone();
        let outputs = executor
            .run_function(move || select_candidates(&data, &model_devi_file, &config, &work_dir))
            .await?;

        let candidates: usize = outputs.iter().map(|a| a.attr_strings("candidates").len()).sum();
        info!(
            path_prefix = %ctx.path_prefix.display(),
            model_devi_file = %input.model_devi_file,
            tasks = outputs.len(),
            candidates = candidates,
            "Selection finished"
        );
        Ok(StageFuture::ready(SelectedCandidates { outputs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactCatalog;
    use crate::executor::{Executor, LocalExecutor};
    use crate::resource::ResourceManager;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    const MODEL_DEVI: &str = "\
#       step         max_devi_v         min_devi_v         avg_devi_v         max_devi_f         min_devi_f         avg_devi_f
           0       1.0e-02       1.0e-03       5.0e-03       0.05       0.01       0.02
          10       1.0e-02       1.0e-03       5.0e-03       0.15       0.01       0.02
          20       1.0e-02       1.0e-03       5.0e-03       0.25       0.01       0.02
          30       1.0e-02       1.0e-03       5.0e-03       0.45       0.01       0.02
";

    fn threshold(limit: usize) -> ThresholdConfig {
        ThresholdConfig {
            f_trust_lo: 0.1,
            f_trust_hi: 0.3,
            limit,
        }
    }

    fn explore_task(root: &Path, name: &str, steps: &[u64]) -> Artifact {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join(DUMP_DIR)).unwrap();
        std::fs::write(dir.join("model_devi_neu.out"), MODEL_DEVI).unwrap();
        for step in steps {
            std::fs::write(dir.join(DUMP_DIR).join(format!("{step}.lammpstrj")), "ITEM: TIMESTEP\n").unwrap();
        }
        Artifact::of(dir.display().to_string(), format::LAMMPS_OUTPUT_DIR, "local").with_attr("TEMP", 300)
    }

    fn context(temp: &TempDir) -> StageContext<()> {
        let mut executors: HashMap<String, Arc<dyn Executor>> = HashMap::new();
        executors.insert(
            "local".to_string(),
            Arc::new(LocalExecutor::new("local", temp.path())),
        );
        let manager =
            ResourceManager::with_executors(ArtifactCatalog::default(), executors, "local").unwrap();
        StageContext::new((), "iters-000/neu-select-threshold", Arc::new(manager))
    }

    #[test]
    fn test_parse_and_classify() {
        let rows = parse_model_devi(MODEL_DEVI).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], (10, 0.15));

        let classified = classify(&rows, &threshold(0));
        assert_eq!(
            classified,
            Classified {
                good: 1,
                decent: vec![10, 20],
                poor: 1
            }
        );
    }

    #[test]
    fn test_boundaries() {
        let rows = vec![(0, 0.1), (1, 0.3)];
        let classified = classify(&rows, &threshold(0));
        assert_eq!(classified.decent, vec![0]);
        assert_eq!(classified.poor, 1);
    }

    #[test]
    fn test_parse_rejects_short_rows() {
        assert!(parse_model_devi("0 0.1 0.2\n").is_err());
        assert!(parse_model_devi("x 1 2 3 4\n").is_err());
    }

    #[test]
    fn test_inverted_window_is_invalid() {
        let config = ThresholdConfig {
            f_trust_lo: 0.5,
            f_trust_hi: 0.1,
            limit: 0,
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_select_candidates() {
        let temp = TempDir::new().unwrap();
        let explore = temp.path().join("explore");
        let with_dumps = explore_task(&explore, "000000", &[0, 10, 20, 30]);
        let no_dumps = explore_task(&explore, "000001", &[]);
        let input = SelectInput {
            config: threshold(0),
            model_devi_data: vec![with_dumps.clone(), no_dumps],
            model_devi_file: "model_devi_neu.out".to_string(),
        };
        let ctx = context(&temp);

        let output = ThresholdSelector.select(&input, &ctx).await.unwrap().result().await.unwrap();

        let selected = output.model_devi_dataset();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].url, with_dumps.url);
        assert_eq!(selected[0].attrs["TEMP"], 300);
        let candidates = selected[0].attr_strings("candidates");
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].ends_with("traj/10.lammpstrj"));
        assert!(candidates[1].ends_with("traj/20.lammpstrj"));

        let stats = std::fs::read_to_string(
            temp.path().join("iters-000/neu-select-threshold").join(STATS_FILE),
        )
        .unwrap();
        assert_eq!(stats.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_limit_and_missing_files() {
        let temp = TempDir::new().unwrap();
        let explore = temp.path().join("explore");
        let first = explore_task(&explore, "000000", &[10, 20]);
        let second = explore_task(&explore, "000001", &[10, 20]);
        let input = SelectInput {
            config: threshold(1),
            model_devi_data: vec![first, second],
            model_devi_file: "model_devi_red.out".to_string(),
        };
        let ctx = context(&temp);

        // No red deviation files were written.
        let output = ThresholdSelector.select(&input, &ctx).await.unwrap().result().await.unwrap();
        assert!(output.model_devi_dataset().is_empty());

        let input = SelectInput {
            model_devi_file: "model_devi_neu.out".to_string(),
            ..input
        };
        let output = ThresholdSelector.select(&input, &ctx).await.unwrap().result().await.unwrap();
        assert_eq!(output.model_devi_dataset().len(), 1);
        assert_eq!(output.model_devi_dataset()[0].attr_strings("candidates").len(), 1);
    }

    #[tokio::test]
    async fn test_no_data_resolves_to_empty_output() {
        let temp = TempDir::new().unwrap();
        let input = SelectInput {
            config: threshold(0),
            model_devi_data: vec![],
            model_devi_file: "model_devi_neu.out".to_string(),
        };

        let output = ThresholdSelector
            .select(&input, &context(&temp))
            .await
            .unwrap()
            .result()
            .await
            .unwrap();

        assert!(output.model_devi_dataset().is_empty());
        let work_dir = temp.path().join("iters-000/neu-select-threshold");
        assert!(work_dir.is_dir());
        assert!(!work_dir.join(STATS_FILE).exists());
    }

    #[tokio::test]
    async fn test_rejects_foreign_formats() {
        let temp = TempDir::new().unwrap();
        let input = SelectInput {
            config: threshold(0),
            model_devi_data: vec![Artifact::of("/w/000000", format::CP2K_OUTPUT_DIR, "local")],
            model_devi_file: "model_devi_neu.out".to_string(),
        };

        let err = ThresholdSelector.select(&input, &context(&temp)).await.unwrap_err();
        assert!(matches!(err, StageError::UnsupportedFormat { .. }));
    }
}
