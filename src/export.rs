//! Export driver
//!
//! Runs the whole export for one module: validate the options, optionally
//! unfreeze constants, run the transformation steps, write the checkpoint,
//! extract the graph and assemble the [`ExportedModel`].
//!
//! # Examples
//! ```rust
//! use quant_export::{export_module, ExportOptions};
//! use quant_export::ir::{DataType, Function, Module, OpKind, Operation};
//!
//! let mut module = Module::new()
//!     .with_function(
//!         Function::entry("serving_default")
//!             .with_arg("x", DataType::F32)
//!             .with_op(Operation::new("y", OpKind::Relu).with_inputs(["x"]))
//!             .with_result("y"),
//!     )?
//!     .with_alias("serve", "serving_default");
//!
//! let model = export_module(&mut module, &ExportOptions::default())?;
//! assert_eq!(model.init_node_name, "init_op");
//! assert_eq!(model.function_aliases["serve"], "main");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::checkpoint::{
    attach_saver, CheckpointVariable, CheckpointWriter, SafeTensorsCheckpointWriter,
};
use crate::config::ExportOptions;
use crate::error::{Error, Result};
use crate::exported_model::{create_exported_model, AssetFileDef, ExportedModel};
use crate::graph::GraphDef;
use crate::ir::Module;
use crate::passes::{export_pipeline, ExportStep, UnfreezeConstants, INIT_OP_NAME};
use crate::progress::{self, ExportEvent, ProgressFn};
use tracing::{debug, info, info_span, warn};

/// Export `module` with the default checkpoint writer and no progress reporting
pub fn export_module(module: &mut Module, options: &ExportOptions) -> Result<ExportedModel> {
    export_module_with(module, options, &SafeTensorsCheckpointWriter, None)
}

/// Export `module`, writing variables through `writer`
///
/// The module is left in its transformed state, also on failure. Options are
/// validated before anything is touched.
pub fn export_module_with(
    module: &mut Module,
    options: &ExportOptions,
    writer: &dyn CheckpointWriter,
    progress: Option<&ProgressFn>,
) -> Result<ExportedModel> {
    options.validate()?;

    let label = options.debug_label();
    let span = info_span!("export", label = %label);
    let _guard = span.enter();
    info!("{}", options.summary());
    progress::report(progress, ExportEvent::Started { label });

    let variables = if options.unfreeze_constants {
        unfreeze(module, options, progress)?
    } else {
        Vec::new()
    };

    export_pipeline(options.duplicate_shape_determining_constants)
        .run_with_progress(module, progress)?;

    let mut saver_def = None;
    let mut checkpoint_dir = None;
    if !variables.is_empty() {
        let dir = options.checkpoint_dir().ok_or_else(|| {
            Error::invalid_config("unfreeze_constants requires a non-empty checkpoint_dir")
        })?;
        saver_def = Some(attach_saver(module, &variables)?);

        progress::report(
            progress,
            ExportEvent::WritingCheckpoint {
                dir: dir.to_path_buf(),
                variables: variables.len(),
            },
        );
        writer.write(dir, &variables)?;
        progress::report(progress, ExportEvent::CheckpointWritten);
        checkpoint_dir = Some(dir);
    } else if options.unfreeze_constants {
        debug!("no constants were unfrozen; skipping checkpoint");
    }

    progress::report(progress, ExportEvent::Assembling);
    let graph = GraphDef::from_module(module)?;
    let asset_file_defs: Vec<AssetFileDef> = module
        .assets
        .iter()
        .map(|asset| AssetFileDef {
            tensor_name: format!("{}:0", asset.name),
            filename: asset.filename.clone(),
        })
        .collect();

    let model = create_exported_model(
        graph,
        INIT_OP_NAME,
        checkpoint_dir,
        saver_def,
        &module.function_aliases,
        &asset_file_defs,
    )?;

    let node_count = model.graph.node.len();
    info!(nodes = node_count, checkpoint = model.has_checkpoint(), "export complete");
    progress::report(progress, ExportEvent::Complete { node_count });
    Ok(model)
}

/// Run the unfreeze step, keeping the variables it moved out of the graph
fn unfreeze(
    module: &mut Module,
    options: &ExportOptions,
    progress: Option<&ProgressFn>,
) -> Result<Vec<CheckpointVariable>> {
    let step = UnfreezeConstants::new(options.unfreeze_size_threshold_bytes);
    let name = step.name();
    progress::report(
        progress,
        ExportEvent::StepStarted {
            step: name.to_string(),
            index: 1,
            total: 1,
        },
    );

    let variables = step.unfreeze(module).map_err(|source| {
        warn!(step = name, error = %source, "export step failed");
        Error::transformation(name, source)
    })?;

    progress::report(
        progress,
        ExportEvent::StepCompleted {
            step: name.to_string(),
        },
    );
    Ok(variables)
}
