//! Lowering from the functional form to the executor form
//!
//! The executor form is what the graph serializer expects: every function body
//! is topologically ordered and side-effecting operations are chained with
//! explicit control edges, so the runtime cannot reorder them.

use super::ExportStep;
use crate::ir::{Dialect, Function, Module, MAIN_FUNCTION_NAME};
use anyhow::{bail, Context};
use tracing::debug;

/// Convert the module to executor form
///
/// Requires the `main` entry point to exist already.
pub struct LowerToExecutor;

impl ExportStep for LowerToExecutor {
    fn name(&self) -> &'static str {
        "lower_to_executor"
    }

    fn run(&self, module: &mut Module) -> anyhow::Result<()> {
        if module.main().is_none() {
            bail!("lowering requires a `{MAIN_FUNCTION_NAME}` function; insert it first");
        }
        for function in module.functions_mut() {
            function
                .sort_topologically()
                .with_context(|| format!("failed to order `{}`", function.name))?;
            let edges = chain_side_effects(function);
            debug!(function = %function.name, control_edges = edges, "lowered function");
        }
        module.set_dialect(Dialect::Executor);
        Ok(())
    }
}

/// Link each side-effecting op to the previous one; returns edges added
fn chain_side_effects(function: &mut Function) -> usize {
    let mut previous: Option<String> = None;
    let mut added = 0;
    for op in &mut function.ops {
        if !op.kind.is_side_effecting() {
            continue;
        }
        if let Some(prev) = previous.take() {
            if op.add_control_input(prev) {
                added += 1;
            }
        }
        previous = Some(op.name.clone());
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, OpKind, Operation, TensorValue};

    fn stateful_main() -> Function {
        Function::entry("main")
            .with_arg("x", DataType::F32)
            .with_op(Operation::new("read", OpKind::ReadVariable).with_inputs(["handle"]))
            .with_op(Operation::new(
                "handle",
                OpKind::VarHandle {
                    shared_name: "w".to_string(),
                },
            ))
            .with_op(Operation::constant(
                "update",
                TensorValue::from_f32(vec![1], &[2.0]).unwrap(),
            ))
            .with_op(Operation::new("assign", OpKind::AssignVariable).with_inputs(["handle", "update"]))
            .with_op(Operation::new("lookup", OpKind::LookupTable).with_inputs(["x"]))
            .with_result("read")
    }

    #[test]
    fn test_orders_ops_and_chains_side_effects() {
        let mut module = Module::new().with_function(stateful_main()).unwrap();
        LowerToExecutor.run(&mut module).unwrap();

        assert_eq!(module.dialect(), Dialect::Executor);
        let main = module.main().unwrap();
        let names: Vec<_> = main.ops.iter().map(|op| op.name.as_str()).collect();
        assert_eq!(names, ["handle", "read", "update", "assign", "lookup"]);
        assert_eq!(main.op("assign").unwrap().control_inputs, ["read"]);
        assert_eq!(main.op("lookup").unwrap().control_inputs, ["assign"]);
        assert!(main.op("read").unwrap().control_inputs.is_empty());
    }

    #[test]
    fn test_lowering_twice_adds_nothing() {
        let mut module = Module::new().with_function(stateful_main()).unwrap();
        LowerToExecutor.run(&mut module).unwrap();
        let once = module.main().unwrap().clone();
        LowerToExecutor.run(&mut module).unwrap();
        assert_eq!(module.main().unwrap(), &once);
    }

    #[test]
    fn test_requires_main() {
        let mut module = Module::new().with_function(Function::entry("predict")).unwrap();
        assert!(LowerToExecutor.run(&mut module).is_err());
        assert_eq!(module.dialect(), Dialect::Functional);
    }

    #[test]
    fn test_dangling_reference_fails() {
        let mut module = Module::new()
            .with_function(
                Function::entry("main")
                    .with_op(Operation::new("y", OpKind::Relu).with_inputs(["ghost"])),
            )
            .unwrap();
        let err = LowerToExecutor.run(&mut module).unwrap_err();
        assert!(format!("{:#}", err).contains("ghost"));
    }
}
