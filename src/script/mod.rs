//! Bash script rendering for submitted work.
//!
//! Stages never hand raw commands to an executor. They describe the work as
//! a list of [`BashStep`]s and wrap them in the executor's [`ScriptTemplate`]
//! (scheduler directives, module loads, environment setup). The rendered
//! script runs every step in its own subshell and stops at the first failure.
//!
//! A step with a checkpoint tag is skipped when its checkpoint file already
//! exists, so resubmitting a partially finished job only redoes the steps
//! that did not complete.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};

/// Suffix of checkpoint marker files.
pub const CHECKPOINT_SUFFIX: &str = ".checkpoint";

const SCRIPT_TEMPLATE: &str = r#"{{ shebang }}
{{ header }}

{{ setup }}

{% for step in steps -%}
# step {{ loop.index }}
{% if step.checkpoint_file -%}
if [ -f "{{ step.checkpoint_file }}" ]; then
  echo "hit checkpoint: {{ step.checkpoint_file }}"
else
  (cd "{{ step.cwd }}" && {{ step.cmd }}) || exit $?
  touch "{{ step.checkpoint_file }}"
fi
{% else -%}
(cd "{{ step.cwd }}" && {{ step.cmd }}) || exit $?
{% endif %}
{% endfor -%}
{{ teardown }}
"#;

/// Executor-specific frame around the steps of a job script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptTemplate {
    pub shebang: String,
    /// Lines right after the shebang, e.g. `#SBATCH` directives.
    pub header: String,
    /// Commands run before the first step.
    pub setup: String,
    /// Commands run after the last step.
    pub teardown: String,
}

impl Default for ScriptTemplate {
    fn default() -> Self {
        Self {
            shebang: "#!/bin/bash".to_string(),
            header: String::new(),
            setup: String::new(),
            teardown: String::new(),
        }
    }
}

/// One command run inside a task directory.
#[derive(Debug, Clone, PartialEq)]
pub struct BashStep {
    pub cwd: PathBuf,
    pub cmd: String,
    pub checkpoint: Option<String>,
}

impl BashStep {
    pub fn new(cwd: impl Into<PathBuf>, cmd: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            cmd: cmd.into(),
            checkpoint: None,
        }
    }

    /// Marks the step as skippable once it has succeeded.
    pub fn with_checkpoint(mut self, tag: impl Into<String>) -> Self {
        self.checkpoint = Some(tag.into());
        self
    }

    /// Path of the marker file written after the step succeeds.
    pub fn checkpoint_file(&self) -> Option<PathBuf> {
        self.checkpoint
            .as_ref()
            .map(|tag| self.cwd.join(format!("{tag}{CHECKPOINT_SUFFIX}")))
    }
}

#[derive(Serialize)]
struct StepView {
    cwd: String,
    cmd: String,
    checkpoint_file: Option<String>,
}

#[derive(Serialize)]
struct ScriptView<'a> {
    shebang: &'a str,
    header: &'a str,
    setup: &'a str,
    teardown: &'a str,
    steps: Vec<StepView>,
}

/// A template plus the steps of one job.
#[derive(Debug, Clone)]
pub struct BashScript<'a> {
    template: &'a ScriptTemplate,
    steps: Vec<BashStep>,
}

impl<'a> BashScript<'a> {
    pub fn new(template: &'a ScriptTemplate, steps: Vec<BashStep>) -> Self {
        Self { template, steps }
    }

    pub fn steps(&self) -> &[BashStep] {
        &self.steps
    }

    /// Renders the script text.
    pub fn render(&self) -> Result<String, tera::Error> {
        let view = ScriptView {
            shebang: &self.template.shebang,
            header: &self.template.header,
            setup: &self.template.setup,
            teardown: &self.template.teardown,
            steps: self
                .steps
                .iter()
                .map(|step| StepView {
                    cwd: display(&step.cwd),
                    cmd: step.cmd.clone(),
                    checkpoint_file: step.checkpoint_file().map(|p| display(&p)),
                })
                .collect(),
        };
        let context = Context::from_serialize(&view)?;
        Tera::one_off(SCRIPT_TEMPLATE, &context, false)
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
