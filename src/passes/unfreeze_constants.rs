//! Moving large constants out of the graph into checkpointed variables
//!
//! Each selected constant is replaced by a variable read. The restore
//! initializer reads the variable back from the checkpoint file named by its
//! `file_prefix` input, so the value itself never appears in the graph. The
//! values are handed back to the caller to be written to that checkpoint.

use super::ExportStep;
use crate::checkpoint::CheckpointVariable;
use crate::config::DEFAULT_UNFREEZE_SIZE_THRESHOLD_BYTES;
use crate::ir::{Dialect, Function, FunctionKind, InitializerType, Module, OpKind, Operation};
use anyhow::{bail, Context};
use std::collections::HashSet;
use tracing::debug;

/// Restore initializer that receives the unfrozen values
pub const RESTORE_FUNCTION_NAME: &str = "restore_unfrozen_constants";

/// Placeholder in the restore initializer fed with the checkpoint prefix
pub const FILE_PREFIX_NAME: &str = "file_prefix";

/// Replace large constants with variables restored from a checkpoint
///
/// Shape-determining constants stay frozen: their values must be known when the
/// graph is compiled.
#[derive(Debug, Clone)]
pub struct UnfreezeConstants {
    /// Constants smaller than this stay in the graph
    pub size_threshold_bytes: usize,
}

impl Default for UnfreezeConstants {
    fn default() -> Self {
        Self {
            size_threshold_bytes: DEFAULT_UNFREEZE_SIZE_THRESHOLD_BYTES,
        }
    }
}

impl UnfreezeConstants {
    /// Create the step with a custom size threshold
    pub fn new(size_threshold_bytes: usize) -> Self {
        Self {
            size_threshold_bytes,
        }
    }
}

/// A constant selected for unfreezing
struct Selected {
    function: String,
    op: String,
}

impl ExportStep for UnfreezeConstants {
    fn name(&self) -> &'static str {
        "unfreeze_constants"
    }

    fn run(&self, module: &mut Module) -> anyhow::Result<()> {
        self.unfreeze(module).map(|_| ())
    }
}

impl UnfreezeConstants {
    /// Unfreeze the selected constants and return their values, in program order
    ///
    /// The returned variables are exactly the ones the restore initializer
    /// reads from the checkpoint.
    pub fn unfreeze(&self, module: &mut Module) -> anyhow::Result<Vec<CheckpointVariable>> {
        if module.dialect() != Dialect::Functional {
            bail!("constants must be unfrozen before lowering to executor form");
        }
        if let Some(existing) = module.function(RESTORE_FUNCTION_NAME) {
            if existing.kind != FunctionKind::Initializer(InitializerType::Restore) {
                bail!("`{RESTORE_FUNCTION_NAME}` exists but is not a restore initializer");
            }
        }

        let selected = self.select(module);
        if selected.is_empty() {
            debug!("no constants to unfreeze");
            return Ok(Vec::new());
        }

        let mut shared_names = existing_shared_names(module);
        let mut restore = module
            .remove_function(RESTORE_FUNCTION_NAME)
            .unwrap_or_else(|| Function::initializer(RESTORE_FUNCTION_NAME, InitializerType::Restore));

        let mut variables = Vec::with_capacity(selected.len());
        let result = ensure_file_prefix(&mut restore).and_then(|()| {
            selected.iter().try_for_each(|target| {
                let function = module
                    .function_mut(&target.function)
                    .with_context(|| format!("function `{}` disappeared", target.function))?;
                let variable = unfreeze_one(function, &target.op, &mut restore, &mut shared_names)?;
                variables.push(variable);
                Ok(())
            })
        });
        module.add_function(restore)?;
        result?;

        debug!(count = variables.len(), "unfroze constants into `{}`", RESTORE_FUNCTION_NAME);
        Ok(variables)
    }

    fn select(&self, module: &Module) -> Vec<Selected> {
        let mut selected = Vec::new();
        for function in module.functions().iter().filter(|f| !f.is_initializer()) {
            let shape_constants = function.shape_determining_constants();
            selected.extend(
                function
                    .ops
                    .iter()
                    .filter(|op| op.is_constant() && !shape_constants.contains(&op.name))
                    .filter(|op| {
                        op.value
                            .as_ref()
                            .is_some_and(|v| v.byte_size() >= self.size_threshold_bytes)
                    })
                    .map(|op| Selected {
                        function: function.name.clone(),
                        op: op.name.clone(),
                    }),
            );
        }
        selected
    }
}

fn existing_shared_names(module: &Module) -> HashSet<String> {
    module
        .functions()
        .iter()
        .flat_map(|f| f.ops.iter())
        .filter_map(|op| match &op.kind {
            OpKind::VarHandle { shared_name } => Some(shared_name.clone()),
            _ => None,
        })
        .collect()
}

fn unique_shared_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut n = 0;
    while taken.contains(&candidate) {
        n += 1;
        candidate = format!("{}_{}", base, n);
    }
    taken.insert(candidate.clone());
    candidate
}

fn ensure_file_prefix(restore: &mut Function) -> anyhow::Result<()> {
    match restore.op(FILE_PREFIX_NAME) {
        Some(op) if op.kind == OpKind::Placeholder => Ok(()),
        Some(_) => bail!(
            "`{FILE_PREFIX_NAME}` in `{RESTORE_FUNCTION_NAME}` is not a placeholder"
        ),
        None => {
            restore
                .ops
                .insert(0, Operation::new(FILE_PREFIX_NAME, OpKind::Placeholder));
            Ok(())
        }
    }
}

fn unfreeze_one(
    function: &mut Function,
    name: &str,
    restore: &mut Function,
    shared_names: &mut HashSet<String>,
) -> anyhow::Result<CheckpointVariable> {
    let index = function
        .op_index(name)
        .with_context(|| format!("constant `{}` disappeared", name))?;
    let value = function.ops[index]
        .value
        .clone()
        .with_context(|| format!("constant `{}` has no value", name))?;
    let device = function.ops[index].device.clone();
    let shared_name = unique_shared_name(name, shared_names);

    let handle_name = function.unique_value_name(&format!("{}/variable", name));
    let handle = Operation::new(
        handle_name.clone(),
        OpKind::VarHandle {
            shared_name: shared_name.clone(),
        },
    )
    .on_device(device.clone());
    let read = Operation::new(name, OpKind::ReadVariable)
        .with_inputs([handle_name])
        .on_device(device);
    function.ops[index] = read;
    function.ops.insert(index, handle);

    let restore_handle = restore.unique_value_name(&shared_name);
    restore.push_op(Operation::new(
        restore_handle.clone(),
        OpKind::VarHandle {
            shared_name: shared_name.clone(),
        },
    ))?;
    let restored = restore.unique_value_name(&format!("{}/restore", shared_name));
    restore.push_op(
        Operation::new(
            restored.clone(),
            OpKind::RestoreTensor {
                tensor_name: shared_name.clone(),
                dtype: value.dtype(),
            },
        )
        .with_inputs([FILE_PREFIX_NAME]),
    )?;
    let assign = restore.unique_value_name(&format!("{}/assign", shared_name));
    restore.push_op(
        Operation::new(assign, OpKind::AssignVariable).with_inputs([restore_handle, restored]),
    )?;

    Ok(CheckpointVariable {
        name: shared_name,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, TensorValue};

    fn weights(n: usize) -> TensorValue {
        TensorValue::from_f32(vec![n], &vec![0.25; n]).unwrap()
    }

    fn model() -> Module {
        Module::new()
            .with_function(
                Function::entry("main")
                    .with_arg("x", DataType::F32)
                    .with_op(Operation::constant("kernel", weights(64)).on_device("/device:CPU:0"))
                    .with_op(Operation::constant("bias", weights(2)))
                    .with_op(Operation::constant("shape", TensorValue::from_i64(&[8; 40])))
                    .with_op(Operation::new("mm", OpKind::MatMul).with_inputs(["x", "kernel"]))
                    .with_op(Operation::new("out", OpKind::Add).with_inputs(["mm", "bias"]))
                    .with_op(Operation::new("r", OpKind::Reshape).with_inputs(["out", "shape"]))
                    .with_result("r"),
            )
            .unwrap()
    }

    #[test]
    fn test_large_constant_becomes_variable() {
        let mut module = model();
        UnfreezeConstants::new(64).run(&mut module).unwrap();

        let main = module.main().unwrap();
        let handle = main.op("kernel/variable").unwrap();
        assert_eq!(handle.kind.shared_name(), Some("kernel"));
        assert_eq!(handle.device, "/device:CPU:0");

        let read = main.op("kernel").unwrap();
        assert_eq!(read.kind, OpKind::ReadVariable);
        assert_eq!(read.inputs, ["kernel/variable"]);
        assert!(main.op_index("kernel/variable").unwrap() < main.op_index("kernel").unwrap());
        assert_eq!(main.op("mm").unwrap().inputs, ["x", "kernel"]);
        assert!(main.verify().is_ok());

        // Small and shape-determining constants stay frozen.
        assert!(main.op("bias").unwrap().is_constant());
        assert!(main.op("shape").unwrap().is_constant());

        let restore = module.function(RESTORE_FUNCTION_NAME).unwrap();
        assert_eq!(
            restore.kind,
            FunctionKind::Initializer(InitializerType::Restore)
        );
        assert_eq!(restore.op(FILE_PREFIX_NAME).unwrap().kind, OpKind::Placeholder);
        let restored = restore.op("kernel/restore").unwrap();
        assert_eq!(
            restored.kind,
            OpKind::RestoreTensor {
                tensor_name: "kernel".to_string(),
                dtype: DataType::F32,
            }
        );
        assert_eq!(restored.inputs, [FILE_PREFIX_NAME]);
        assert_eq!(
            restore.op("kernel/assign").unwrap().inputs,
            ["kernel", "kernel/restore"]
        );
        assert!(restore.verify().is_ok());
    }

    #[test]
    fn test_restore_function_holds_no_values() {
        let mut module = model();
        let variables = UnfreezeConstants::new(64).unfreeze(&mut module).unwrap();

        assert_eq!(variables.len(), 1);
        assert_eq!(variables[0].name, "kernel");
        assert_eq!(variables[0].value, weights(64));

        let embedded: Vec<_> = module
            .functions()
            .iter()
            .flat_map(|f| f.ops.iter())
            .filter(|op| op.value.as_ref() == Some(&weights(64)))
            .map(|op| op.name.as_str())
            .collect();
        assert!(embedded.is_empty(), "value still embedded in {:?}", embedded);
    }

    #[test]
    fn test_existing_restore_function_is_extended() {
        let mut module = model()
            .with_function(
                Function::initializer(RESTORE_FUNCTION_NAME, InitializerType::Restore)
                    .with_op(Operation::new(
                        "table",
                        OpKind::HashTable {
                            shared_name: "vocab".to_string(),
                        },
                    )),
            )
            .unwrap();
        UnfreezeConstants::new(64).run(&mut module).unwrap();

        let restore = module.function(RESTORE_FUNCTION_NAME).unwrap();
        assert_eq!(restore.ops[0].name, FILE_PREFIX_NAME);
        assert!(restore.op("table").is_some());
        assert!(restore.op("kernel/assign").is_some());
    }

    #[test]
    fn test_conflicting_file_prefix_rejected() {
        let mut module = model()
            .with_function(
                Function::initializer(RESTORE_FUNCTION_NAME, InitializerType::Restore)
                    .with_op(Operation::constant(FILE_PREFIX_NAME, TensorValue::from_i32(&[0]))),
            )
            .unwrap();
        assert!(UnfreezeConstants::new(64).run(&mut module).is_err());
    }

    #[test]
    fn test_shared_names_unique_across_functions() {
        let mut module = model()
            .with_function(
                Function::new("helper", FunctionKind::Private)
                    .with_op(Operation::constant("kernel", weights(64)))
                    .with_result("kernel"),
            )
            .unwrap();
        UnfreezeConstants::new(64).run(&mut module).unwrap();

        let helper = module.function("helper").unwrap();
        assert_eq!(
            helper.op("kernel/variable").unwrap().kind.shared_name(),
            Some("kernel_1")
        );
        // One prefix placeholder, then handle, restore and assign per variable.
        let restore = module.function(RESTORE_FUNCTION_NAME).unwrap();
        assert_eq!(restore.ops.len(), 7);
        assert!(restore.op("kernel_1/restore").is_some());
    }

    #[test]
    fn test_nothing_selected_leaves_module_alone() {
        let mut module = model();
        let variables = UnfreezeConstants::new(1 << 20).unfreeze(&mut module).unwrap();
        assert!(variables.is_empty());
        assert!(module.function(RESTORE_FUNCTION_NAME).is_none());
        assert!(module.main().unwrap().op("kernel").unwrap().is_constant());
    }

    #[test]
    fn test_refuses_executor_form() {
        let mut module = model();
        module.set_dialect(Dialect::Executor);
        assert!(UnfreezeConstants::default().run(&mut module).is_err());
    }
}
