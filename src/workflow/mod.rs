//! Iteration engine for the active-learning loop.
//!
//! Each iteration runs, for every branch:
//!
//! 1. **label** the previous selection (the initial structures on iteration 0),
//! 2. **train** on the previous training set plus the new labels,
//! 3. **explore** once, with the models of every branch,
//! 4. **select** candidates from the exploration by the branch's threshold,
//! 5. **update**: advance the update table cursor.
//!
//! Stage workspaces are laid out as
//! `<path_prefix>/iters-<NNN>/<branch>-<stage>-<tool>/`, with the shared
//! explore stage in `<path_prefix>/iters-<NNN>/explore-<tool>/`.
//!
//! # Example
//!
//! ```rust,ignore
//! use mlp_forge::stage::{CommandExplorer, CommandLabeler, CommandTrainer, ThresholdSelector};
//! use mlp_forge::workflow::{IterationEngine, Stages};
//!
//! let stages = Stages {
//!     labeler: CommandLabeler,
//!     trainer: CommandTrainer,
//!     explorer: CommandExplorer,
//!     selector: ThresholdSelector,
//! };
//! let engine = IterationEngine::new(stages, resource_manager, &context, &config.workflow, "runs/h2o")?;
//! let summary = engine.run().await?;
//! ```

pub mod engine;
pub mod summary;

pub use engine::{iteration_dir, model_devi_file, IterationEngine, Stages};
pub use summary::{BranchSummary, IterationSummary, RunSummary};
