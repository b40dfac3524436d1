//! Update stage: walk through the update table one entry per iteration.

use serde::Serialize;
use serde_yaml::Value;
use tracing::{debug, info};

use crate::config::{merge_values, WorkflowConfig};
use crate::error::ConfigError;

/// What an update did to the table cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// The cursor moved to the next entry.
    Advanced { cursor: usize },
    /// The table is empty; the workflow configuration is static.
    Empty,
    /// The cursor already sits on the last entry, which stays in effect.
    Exhausted { cursor: usize },
}

/// Owns the raw workflow section and the update table cursor.
///
/// The configuration in effect is the raw section with the entry under the
/// cursor merged on top. The cursor starts at 0 and never moves past the
/// last entry.
#[derive(Debug, Clone)]
pub struct WalkthroughUpdater {
    base: Value,
    table: Vec<Value>,
    cursor: usize,
}

impl WalkthroughUpdater {
    /// Reads the table from `update.walkthrough.table` of the raw section.
    pub fn new(raw_workflow: &Value) -> Result<Self, ConfigError> {
        let base = WorkflowConfig::from_value(raw_workflow)?;
        Ok(Self {
            base: raw_workflow.clone(),
            table: base.update.walkthrough.table,
            cursor: 0,
        })
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Raw workflow section with the entry at `cursor` applied.
    pub fn effective_value(&self, cursor: usize) -> Value {
        match self.table.get(cursor.min(self.table.len().saturating_sub(1))) {
            Some(overlay) => merge_values(&self.base, overlay),
            None => self.base.clone(),
        }
    }

    /// Typed workflow configuration at `cursor`.
    pub fn workflow_at(&self, cursor: usize) -> Result<WorkflowConfig, ConfigError> {
        WorkflowConfig::from_value(&self.effective_value(cursor))
    }

    /// Typed workflow configuration currently in effect.
    pub fn workflow(&self) -> Result<WorkflowConfig, ConfigError> {
        self.workflow_at(self.cursor)
    }

    /// Moves the cursor forward by at most one entry.
    pub fn update(&mut self) -> UpdateOutcome {
        if self.table.is_empty() {
            debug!("Update table is empty, configuration unchanged");
            return UpdateOutcome::Empty;
        }
        if self.cursor + 1 >= self.table.len() {
            info!(cursor = self.cursor, "Update table exhausted, keeping last entry");
            return UpdateOutcome::Exhausted { cursor: self.cursor };
        }
        self.cursor += 1;
        info!(cursor = self.cursor, entries = self.table.len(), "Advanced update table");
        UpdateOutcome::Advanced { cursor: self.cursor }
    }
}
