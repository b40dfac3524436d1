//! Record of what a run produced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::WorkflowError;
use crate::stage::UpdateOutcome;

/// Per-branch counts of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BranchSummary {
    pub labeled: usize,
    pub trained_on: usize,
    pub models: usize,
    /// Explore tasks that yielded candidates.
    pub selected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationSummary {
    pub iteration: usize,
    /// Update table cursor in effect during the iteration.
    pub update_cursor: usize,
    /// Stage directories, relative to the run's path prefix.
    pub stage_dirs: Vec<PathBuf>,
    pub explored: usize,
    pub branches: BTreeMap<String, BranchSummary>,
    pub update: UpdateOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub path_prefix: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub iterations: Vec<IterationSummary>,
}

impl RunSummary {
    pub fn new(path_prefix: impl Into<PathBuf>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            started_at: Utc::now(),
            finished_at: None,
            iterations: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn iterations_completed(&self) -> usize {
        self.iterations.len()
    }

    /// Writes the summary as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> Result<(), WorkflowError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_json() {
        let temp = TempDir::new().unwrap();
        let mut summary = RunSummary::new("runs/h2o");
        let mut branches = BTreeMap::new();
        branches.insert(
            "neu".to_string(),
            BranchSummary {
                labeled: 3,
                trained_on: 3,
                models: 4,
                selected: 1,
            },
        );
        summary.iterations.push(IterationSummary {
            iteration: 0,
            update_cursor: 0,
            stage_dirs: vec![PathBuf::from("iters-000/neu-label-cp2k")],
            explored: 2,
            branches,
            update: UpdateOutcome::Empty,
        });
        summary.finish();

        let path = temp.path().join("runs/h2o/summary.json");
        summary.write_json(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["iterations"][0]["branches"]["neu"]["models"], 4);
        assert_eq!(written["iterations"][0]["update"]["status"], "empty");
        assert!(written["finished_at"].is_string());
    }
}
