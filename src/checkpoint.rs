//! Checkpoint side channel for unfrozen constants
//!
//! Variables created by unfreezing are restored at load time from a checkpoint
//! directory instead of being embedded in the graph. This module writes those
//! variables out, adds the save ops to `main` and builds the [`SaverDef`] that
//! tells the runtime how to save and restore them.
//!
//! The on-disk layout written by [`SafeTensorsCheckpointWriter`] is:
//!
//! ```text
//! <dir>/variables.safetensors   tensor payloads keyed by shared name
//! <dir>/checkpoint.json         index: names, element types and shapes in write order
//! ```

use crate::error::{Error, Result};
use crate::exported_model::{SaverDef, SaverVersion};
use crate::graph::PRODUCER;
use crate::ir::{
    DataType, Dialect, Function, Module, OpKind, Operation, TensorValue, MAIN_FUNCTION_NAME,
};
use crate::passes::RESTORE_OP_NAME;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Tensor payload file inside a checkpoint directory
pub const VARIABLES_FILE_NAME: &str = "variables.safetensors";

/// Index file inside a checkpoint directory
pub const INDEX_FILE_NAME: &str = "checkpoint.json";

/// Name scope of the save ops added to `main`
pub const SAVER_SCOPE: &str = "saver";

const INDEX_FORMAT_VERSION: u32 = 1;

/// A variable whose initial value lives in the checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointVariable {
    /// Shared name of the variable resource
    pub name: String,
    /// Value restored into the variable
    pub value: TensorValue,
}

/// Destination for checkpoint variables
pub trait CheckpointWriter {
    /// Persist `variables` under `dir`, creating the directory if needed
    fn write(&self, dir: &Path, variables: &[CheckpointVariable]) -> Result<()>;
}

/// Writes variables as a safetensors file plus a JSON index
#[derive(Debug, Clone, Default)]
pub struct SafeTensorsCheckpointWriter;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointIndex {
    format_version: u32,
    producer: String,
    variables: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    dtype: DataType,
    shape: Vec<usize>,
}

impl CheckpointWriter for SafeTensorsCheckpointWriter {
    fn write(&self, dir: &Path, variables: &[CheckpointVariable]) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| {
            Error::checkpoint(format!(
                "Failed to create checkpoint directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut views = Vec::with_capacity(variables.len());
        for variable in variables {
            let value = &variable.value;
            let view = TensorView::new(
                to_safetensors_dtype(value.dtype()),
                value.shape().to_vec(),
                value.data(),
            )?;
            views.push((variable.name.as_str(), view));
        }

        let mut metadata = HashMap::new();
        metadata.insert("producer".to_string(), PRODUCER.to_string());
        let bytes = safetensors::serialize(views, Some(metadata))?;
        fs::write(dir.join(VARIABLES_FILE_NAME), bytes)?;

        // Index last, via temp file and rename: a readable index means the
        // payload next to it is complete.
        let index = CheckpointIndex {
            format_version: INDEX_FORMAT_VERSION,
            producer: PRODUCER.to_string(),
            variables: variables
                .iter()
                .map(|variable| IndexEntry {
                    name: variable.name.clone(),
                    dtype: variable.value.dtype(),
                    shape: variable.value.shape().to_vec(),
                })
                .collect(),
        };
        let data = serde_json::to_string_pretty(&index)?;
        let index_file = dir.join(INDEX_FILE_NAME);
        let temp_file = dir.join(format!("{}.tmp", INDEX_FILE_NAME));
        fs::write(&temp_file, data)?;
        fs::rename(&temp_file, &index_file)
            .map_err(|e| Error::checkpoint(format!("Failed to rename checkpoint index: {}", e)))?;

        debug!(dir = %dir.display(), variables = variables.len(), "wrote checkpoint");
        Ok(())
    }
}

/// Read back variables written by [`SafeTensorsCheckpointWriter`], in write order
pub fn load_checkpoint(dir: &Path) -> Result<Vec<CheckpointVariable>> {
    let index_data = fs::read_to_string(dir.join(INDEX_FILE_NAME)).map_err(|e| {
        Error::checkpoint(format!(
            "Failed to read checkpoint index in {}: {}",
            dir.display(),
            e
        ))
    })?;
    let index: CheckpointIndex = serde_json::from_str(&index_data)?;
    if index.format_version != INDEX_FORMAT_VERSION {
        return Err(Error::checkpoint(format!(
            "Unsupported checkpoint index version {}",
            index.format_version
        )));
    }

    let payload = fs::read(dir.join(VARIABLES_FILE_NAME))?;
    let tensors = SafeTensors::deserialize(&payload)?;

    index
        .variables
        .into_iter()
        .map(|entry| {
            let view = tensors.tensor(&entry.name)?;
            if view.dtype() != to_safetensors_dtype(entry.dtype) || view.shape() != entry.shape {
                return Err(Error::checkpoint(format!(
                    "Variable `{}` does not match its index entry",
                    entry.name
                )));
            }
            let value = TensorValue::new(entry.dtype, entry.shape, view.data().to_vec())
                .map_err(|e| Error::checkpoint(format!("Variable `{}`: {}", entry.name, e)))?;
            Ok(CheckpointVariable {
                name: entry.name,
                value,
            })
        })
        .collect()
}

/// Add save ops for `variables` to `main` and describe them in a [`SaverDef`]
///
/// Expects a merged module: `main` must already hold the restore ops for every
/// variable, all reading from the same prefix placeholder, and the
/// `restore_op` anchor. The prefix placeholder becomes the filename tensor.
/// Save reads each variable through its merged handle and writes them under
/// that prefix.
pub fn attach_saver(module: &mut Module, variables: &[CheckpointVariable]) -> Result<SaverDef> {
    if module.dialect() != Dialect::Executor {
        return Err(Error::malformed_export(
            "save ops can only be attached to a module in executor form",
        ));
    }
    if variables.is_empty() {
        return Err(Error::checkpoint("no variables to save"));
    }
    let main = module.main_mut().ok_or_else(|| {
        Error::malformed_export(format!("module has no `{}` function", MAIN_FUNCTION_NAME))
    })?;
    if !main.op(RESTORE_OP_NAME).is_some_and(|op| op.kind == OpKind::NoOp) {
        return Err(Error::malformed_export(format!(
            "`{}` has no `{}` anchor",
            MAIN_FUNCTION_NAME, RESTORE_OP_NAME
        )));
    }

    let mut prefix: Option<String> = None;
    let mut handles = Vec::with_capacity(variables.len());
    for variable in variables {
        let restored = main
            .ops
            .iter()
            .find(|op| {
                op.is_initializer
                    && matches!(
                        &op.kind,
                        OpKind::RestoreTensor { tensor_name, .. } if *tensor_name == variable.name
                    )
            })
            .ok_or_else(|| {
                Error::malformed_export(format!(
                    "variable `{}` is never restored in `{}`",
                    variable.name, MAIN_FUNCTION_NAME
                ))
            })?;
        let file = restored.inputs.first().cloned().ok_or_else(|| {
            Error::malformed_export(format!("restore of `{}` has no prefix input", variable.name))
        })?;
        match &prefix {
            Some(existing) if *existing != file => {
                return Err(Error::malformed_export(format!(
                    "variables are restored from both `{}` and `{}`",
                    existing, file
                )))
            }
            Some(_) => {}
            None => prefix = Some(file),
        }

        let handle = main
            .ops
            .iter()
            .find(|op| {
                op.is_initializer
                    && matches!(
                        &op.kind,
                        OpKind::VarHandle { shared_name } if *shared_name == variable.name
                    )
            })
            .map(|op| op.name.clone())
            .ok_or_else(|| {
                Error::malformed_export(format!("variable `{}` has no handle", variable.name))
            })?;
        handles.push(handle);
    }
    let prefix = prefix.ok_or_else(|| Error::checkpoint("no variables to save"))?;
    if !main.op(&prefix).is_some_and(|op| op.kind == OpKind::Placeholder) {
        return Err(Error::malformed_export(format!(
            "checkpoint prefix `{}` is not a placeholder",
            prefix
        )));
    }

    let mut save_inputs = vec![prefix.clone()];
    for (variable, handle) in variables.iter().zip(handles) {
        let read = main.unique_value_name(&format!("{}/{}/read", SAVER_SCOPE, variable.name));
        push(main, Operation::new(read.clone(), OpKind::ReadVariable).with_inputs([handle]))?;
        save_inputs.push(read);
    }
    let save = main.unique_value_name(&format!("{}/save", SAVER_SCOPE));
    push(
        main,
        Operation::new(
            save.clone(),
            OpKind::SaveTensors {
                tensor_names: variables.iter().map(|v| v.name.clone()).collect(),
            },
        )
        .with_inputs(save_inputs),
    )?;
    let save_path = main.unique_value_name(&format!("{}/save_path", SAVER_SCOPE));
    push(
        main,
        Operation::new(save_path.clone(), OpKind::Identity)
            .with_inputs([prefix.clone()])
            .with_control_input(save),
    )?;

    debug!(prefix = %prefix, variables = variables.len(), "attached saver");
    Ok(SaverDef {
        filename_tensor_name: format!("{}:0", prefix),
        save_tensor_name: format!("{}:0", save_path),
        restore_op_name: RESTORE_OP_NAME.to_string(),
        variable_names: variables.iter().map(|v| v.name.clone()).collect(),
        version: SaverVersion::V2,
    })
}

fn push(main: &mut Function, op: Operation) -> Result<()> {
    main.push_op(op)
        .map_err(|e| Error::malformed_export(e.to_string()))
}

fn to_safetensors_dtype(dtype: DataType) -> Dtype {
    match dtype {
        DataType::F32 => Dtype::F32,
        DataType::F16 => Dtype::F16,
        DataType::BF16 => Dtype::BF16,
        DataType::I8 | DataType::QInt8 => Dtype::I8,
        DataType::U8 => Dtype::U8,
        DataType::I32 | DataType::QInt32 => Dtype::I32,
        DataType::I64 => Dtype::I64,
        DataType::Bool => Dtype::BOOL,
    }
}
