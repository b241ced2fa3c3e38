//! Transformation steps that prepare a module for export
//!
//! Steps are plain objects implementing [`ExportStep`], queued in a
//! [`StepPipeline`] and run in the order they were added. The pipeline stops at
//! the first failure; nothing is retried.
//!
//! [`add_export_steps`] queues the standard export sequence:
//!
//! 1. [`InsertMainFunction`] ensures a single `main` entry point.
//! 2. [`DuplicateShapeDeterminingConstants`] gives every placement group its own
//!    copy of shape-determining constants (optional).
//! 3. [`LowerToExecutor`] converts the module to executor form.
//! 4. [`MergeInitializersToMain`] folds initializer functions into `main`.
//!
//! The order matters: lowering assumes `main` exists, duplication has to see
//! the functional form before lowering, and merging works on the final shape
//! of `main`.

use crate::error::{Error, Result};
use crate::ir::Module;
use crate::progress::{self, ExportEvent, ProgressFn};
use tracing::{debug, warn};

pub mod duplicate_constants;
pub mod insert_main;
pub mod lower_to_executor;
pub mod merge_initializers;
pub mod unfreeze_constants;

pub use duplicate_constants::DuplicateShapeDeterminingConstants;
pub use insert_main::InsertMainFunction;
pub use lower_to_executor::LowerToExecutor;
pub use merge_initializers::{MergeInitializersToMain, INIT_OP_NAME, RESTORE_OP_NAME};
pub use unfreeze_constants::{UnfreezeConstants, FILE_PREFIX_NAME, RESTORE_FUNCTION_NAME};

/// A module-rewriting step
pub trait ExportStep {
    /// Name of the step, reported in errors and diagnostics
    fn name(&self) -> &'static str;

    /// Rewrite the module in place
    fn run(&self, module: &mut Module) -> anyhow::Result<()>;
}

/// Ordered sequence of export steps
#[derive(Default)]
pub struct StepPipeline {
    steps: Vec<Box<dyn ExportStep>>,
}

impl std::fmt::Debug for StepPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepPipeline")
            .field("steps", &self.step_names())
            .finish()
    }
}

impl StepPipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    pub fn add_step(&mut self, step: Box<dyn ExportStep>) {
        self.steps.push(step);
    }

    /// Builder form of [`StepPipeline::add_step`]
    pub fn with_step<S: ExportStep + 'static>(mut self, step: S) -> Self {
        self.add_step(Box::new(step));
        self
    }

    /// Names of the queued steps, in run order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Number of queued steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if no steps are queued
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, stopping at the first failure
    pub fn run(&self, module: &mut Module) -> Result<()> {
        self.run_with_progress(module, None)
    }

    /// Like [`StepPipeline::run`], reporting each step to `progress`
    pub fn run_with_progress(
        &self,
        module: &mut Module,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let total = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            let name = step.name();
            progress::report(
                progress,
                ExportEvent::StepStarted {
                    step: name.to_string(),
                    index: i + 1,
                    total,
                },
            );
            debug!(step = name, ops = module.op_count(), "running export step");

            if let Err(source) = step.run(module) {
                warn!(step = name, error = %source, "export step failed");
                return Err(Error::transformation(name, source));
            }

            progress::report(
                progress,
                ExportEvent::StepCompleted {
                    step: name.to_string(),
                },
            );
        }
        Ok(())
    }
}

/// Queue the steps that transform a quantized module into exportable form
pub fn add_export_steps(pipeline: &mut StepPipeline, duplicate_shape_determining_constants: bool) {
    pipeline.add_step(Box::new(InsertMainFunction));
    if duplicate_shape_determining_constants {
        pipeline.add_step(Box::new(DuplicateShapeDeterminingConstants));
    }
    pipeline.add_step(Box::new(LowerToExecutor));
    pipeline.add_step(Box::new(MergeInitializersToMain));
}

/// Build a pipeline holding the standard export sequence
pub fn export_pipeline(duplicate_shape_determining_constants: bool) -> StepPipeline {
    let mut pipeline = StepPipeline::new();
    add_export_steps(&mut pipeline, duplicate_shape_determining_constants);
    pipeline
}
