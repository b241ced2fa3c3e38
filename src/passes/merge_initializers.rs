//! Folding session initializers into `main`
//!
//! The exported graph has a single body. Initializer functions are inlined into
//! `main` under a `{function}/` prefix, and two `NoOp` anchors are wired up:
//! `restore_op` runs the checkpoint restore ops, `init_op` runs everything else
//! and also waits for `restore_op`. Every side-effecting op of `main` waits for
//! `init_op`.

use super::ExportStep;
use crate::ir::{Dialect, Function, FunctionKind, InitializerType, Module, OpKind, Operation};
use anyhow::{bail, Context};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Name of the anchor op that triggers all initialization
pub const INIT_OP_NAME: &str = "init_op";

/// Name of the anchor op that restores variables from the checkpoint
pub const RESTORE_OP_NAME: &str = "restore_op";

/// Merge initializer functions into `main`
///
/// Must run after lowering. Running it twice changes nothing.
pub struct MergeInitializersToMain;

impl ExportStep for MergeInitializersToMain {
    fn name(&self) -> &'static str {
        "merge_initializers_to_main"
    }

    fn run(&self, module: &mut Module) -> anyhow::Result<()> {
        if module.dialect() != Dialect::Executor {
            bail!("initializers can only be merged once the module is in executor form");
        }
        if module.main().is_none() {
            bail!("module has no `main` function to merge initializers into");
        }

        let initializer_names: Vec<String> = module
            .initializer_functions()
            .map(|f| f.name.clone())
            .collect();
        for name in &initializer_names {
            if let Some(function) = module.function(name) {
                if !function.args.is_empty() {
                    bail!(
                        "initializer function `{}` takes {} argument(s); initializers must take none",
                        name,
                        function.args.len()
                    );
                }
            }
        }

        let mut initializers = Vec::with_capacity(initializer_names.len());
        for name in &initializer_names {
            if let Some(function) = module.remove_function(name) {
                initializers.push(function);
            }
        }

        let main = module
            .main_mut()
            .context("`main` disappeared while merging initializers")?;

        let mut restore_deps = Vec::new();
        let mut init_deps = Vec::new();
        for function in &initializers {
            let sinks = inline_initializer(main, function)?;
            match function.kind {
                FunctionKind::Initializer(InitializerType::Restore) => restore_deps.extend(sinks),
                _ => init_deps.extend(sinks),
            }
            debug!(function = %function.name, "merged initializer into main");
        }

        if !restore_deps.is_empty() {
            let restore_op = ensure_noop(main, RESTORE_OP_NAME)?;
            for dep in restore_deps {
                restore_op.add_control_input(dep);
            }
        }

        let has_restore = main.op(RESTORE_OP_NAME).is_some();
        let init_op = ensure_noop(main, INIT_OP_NAME)?;
        for dep in init_deps {
            init_op.add_control_input(dep);
        }
        if has_restore {
            init_op.add_control_input(RESTORE_OP_NAME);
        }

        for op in &mut main.ops {
            if op.kind.is_side_effecting() && !op.is_initializer {
                op.add_control_input(INIT_OP_NAME);
            }
        }

        main.sort_topologically()
            .context("merged `main` could not be ordered")?;
        Ok(())
    }
}

/// Copy an initializer body into `main`; returns the merged names of its sinks
fn inline_initializer(main: &mut Function, function: &Function) -> anyhow::Result<Vec<String>> {
    let mut renamed: HashMap<&str, String> = HashMap::with_capacity(function.ops.len());
    for op in &function.ops {
        let mut candidate = main.unique_value_name(&format!("{}/{}", function.name, op.name));
        // Names reserved earlier in this loop are not in `main` yet.
        let mut n = 0;
        while renamed.values().any(|taken| *taken == candidate) {
            n += 1;
            candidate = main.unique_value_name(&format!("{}/{}_{}", function.name, op.name, n));
        }
        renamed.insert(op.name.as_str(), candidate);
    }
    let rename = |name: &String| renamed.get(name.as_str()).cloned().unwrap_or_else(|| name.clone());

    let consumed: HashSet<&str> = function
        .ops
        .iter()
        .flat_map(|op| op.inputs.iter().chain(op.control_inputs.iter()))
        .map(String::as_str)
        .collect();

    let mut sinks = Vec::new();
    for op in &function.ops {
        let merged = Operation {
            name: rename(&op.name),
            kind: op.kind.clone(),
            inputs: op.inputs.iter().map(rename).collect(),
            control_inputs: op.control_inputs.iter().map(rename).collect(),
            device: op.device.clone(),
            value: op.value.clone(),
            is_initializer: true,
        };
        if !consumed.contains(op.name.as_str()) || function.results.contains(&op.name) {
            sinks.push(merged.name.clone());
        }
        main.push_op(merged)?;
    }
    Ok(sinks)
}

fn ensure_noop<'a>(main: &'a mut Function, name: &str) -> anyhow::Result<&'a mut Operation> {
    match main.op_index(name) {
        Some(index) if main.ops[index].kind == OpKind::NoOp => Ok(&mut main.ops[index]),
        Some(_) => bail!("`{}` already exists in `main` and is not a NoOp", name),
        None => {
            let mut anchor = Operation::new(name, OpKind::NoOp);
            anchor.is_initializer = true;
            main.push_op(anchor)?;
            let last = main.ops.len() - 1;
            Ok(&mut main.ops[last])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, TensorValue};

    fn table_init() -> Function {
        Function::initializer("init_tables", InitializerType::Init)
            .with_op(Operation::new(
                "table",
                OpKind::HashTable {
                    shared_name: "vocab".to_string(),
                },
            ))
            .with_op(Operation::constant("keys", TensorValue::from_i64(&[1, 2])))
            .with_op(Operation::constant("values", TensorValue::from_i64(&[10, 20])))
            .with_op(
                Operation::new("init", OpKind::InitializeTable)
                    .with_inputs(["table", "keys", "values"]),
            )
    }

    fn variable_restore() -> Function {
        Function::initializer("restore", InitializerType::Restore)
            .with_op(Operation::new(
                "handle",
                OpKind::VarHandle {
                    shared_name: "w".to_string(),
                },
            ))
            .with_op(Operation::constant(
                "saved",
                TensorValue::from_f32(vec![2], &[1.0, 2.0]).unwrap(),
            ))
            .with_op(Operation::new("assign", OpKind::AssignVariable).with_inputs(["handle", "saved"]))
    }

    fn lowered_module() -> Module {
        let main = Function::entry("main")
            .with_arg("ids", DataType::I64)
            .with_op(Operation::new(
                "table",
                OpKind::HashTable {
                    shared_name: "vocab".to_string(),
                },
            ))
            .with_op(Operation::new("lookup", OpKind::LookupTable).with_inputs(["table", "ids"]))
            .with_result("lookup");
        let mut module = Module::new()
            .with_function(main)
            .unwrap()
            .with_function(table_init())
            .unwrap()
            .with_function(variable_restore())
            .unwrap();
        module.set_dialect(Dialect::Executor);
        module
    }

    #[test]
    fn test_initializers_are_inlined_and_anchored() {
        let mut module = lowered_module();
        MergeInitializersToMain.run(&mut module).unwrap();

        assert_eq!(module.functions().len(), 1);
        let main = module.main().unwrap();

        let init = main.op("init_tables/init").unwrap();
        assert!(init.is_initializer);
        assert_eq!(
            init.inputs,
            ["init_tables/table", "init_tables/keys", "init_tables/values"]
        );

        let restore_op = main.op(RESTORE_OP_NAME).unwrap();
        assert_eq!(restore_op.control_inputs, ["restore/assign"]);

        let init_op = main.op(INIT_OP_NAME).unwrap();
        assert!(init_op.control_inputs.contains(&"init_tables/init".to_string()));
        assert!(init_op.control_inputs.contains(&RESTORE_OP_NAME.to_string()));

        assert_eq!(main.op("lookup").unwrap().control_inputs, [INIT_OP_NAME]);
        assert!(main.op("restore/assign").unwrap().control_inputs.is_empty());

        let lookup = main.op_index("lookup").unwrap();
        assert!(main.op_index(INIT_OP_NAME).unwrap() < lookup);
        assert!(main.verify().is_ok());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut module = lowered_module();
        MergeInitializersToMain.run(&mut module).unwrap();
        let once = module.main().unwrap().clone();

        MergeInitializersToMain.run(&mut module).unwrap();

        assert_eq!(module.main().unwrap(), &once);
    }

    #[test]
    fn test_init_op_exists_without_initializers() {
        let mut module = Module::new()
            .with_function(Function::entry("main").with_op(Operation::new("noop", OpKind::NoOp)))
            .unwrap();
        module.set_dialect(Dialect::Executor);

        MergeInitializersToMain.run(&mut module).unwrap();

        let main = module.main().unwrap();
        assert!(main.op(INIT_OP_NAME).unwrap().control_inputs.is_empty());
        assert!(main.op(RESTORE_OP_NAME).is_none());
    }

    #[test]
    fn test_requires_executor_form() {
        let mut module = lowered_module();
        module.set_dialect(Dialect::Functional);
        assert!(MergeInitializersToMain.run(&mut module).is_err());
        assert_eq!(module.functions().len(), 3);
    }

    #[test]
    fn test_initializer_with_args_is_rejected() {
        let mut module = lowered_module();
        module
            .add_function(
                Function::initializer("bad", InitializerType::Init).with_arg("x", DataType::F32),
            )
            .unwrap();
        let err = MergeInitializersToMain.run(&mut module).unwrap_err();
        assert!(err.to_string().contains("bad"));
        assert!(module.function("init_tables").is_some());
    }
}
