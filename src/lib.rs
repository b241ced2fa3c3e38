#![allow(rustdoc::missing_doc_code_examples)]
#![allow(clippy::missing_docs_in_private_items)]

//! quant-export - export stage of a quantization compiler
//!
//! This crate takes a quantized program [`ir::Module`] and turns it into an
//! [`ExportedModel`]: a single serializable graph plus everything a runtime
//! needs to load it. It provides:
//!
//! - **Configuration**: [`ExportOptions`], built in code or read from JSON
//! - **Transformation steps**: entry-point insertion, shape-determining constant
//!   duplication, lowering to executor form and initializer merging, run in a
//!   fixed order by a [`StepPipeline`]
//! - **Unfreezing**: optional move of large constants into variables restored
//!   from a checkpoint
//! - **Assembly**: graph extraction and the [`create_exported_model`] assembler
//! - **Progress Reporting**: optional callbacks for every stage
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use quant_export::{export_module, ExportOptions};
//! use quant_export::ir::Module;
//! use std::path::Path;
//!
//! # fn quantized_module() -> Module { Module::new() }
//! let options = ExportOptions::default()
//!     .with_unfreeze_constants(true)
//!     .with_checkpoint_dir("./export/variables");
//!
//! let mut module = quantized_module();
//! let model = export_module(&mut module, &options)?;
//! model.save_json(Path::new("./export/model.json"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Custom step sequences
//!
//! ```rust
//! use quant_export::passes::{InsertMainFunction, LowerToExecutor, StepPipeline};
//!
//! let pipeline = StepPipeline::new()
//!     .with_step(InsertMainFunction)
//!     .with_step(LowerToExecutor);
//! assert_eq!(pipeline.step_names(), ["insert_main_function", "lower_to_executor"]);
//! ```

#![warn(missing_docs)]

// Public modules
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod export;
pub mod exported_model;
pub mod graph;
pub mod ir;
pub mod passes;
pub mod progress;

// Re-export commonly used types
pub use checkpoint::{
    attach_saver, load_checkpoint, CheckpointVariable, CheckpointWriter,
    SafeTensorsCheckpointWriter,
};
pub use config::ExportOptions;
pub use error::{Error, Result};
pub use export::{export_module, export_module_with};
pub use exported_model::{
    create_exported_model, AssetFileDef, ExportedModel, SaverDef, SaverVersion,
};
pub use graph::{GraphDef, NodeDef};
pub use ir::{Dialect, Function, Module, Operation};
pub use passes::{add_export_steps, export_pipeline, ExportStep, StepPipeline};
pub use progress::{ExportEvent, ProgressFn};
