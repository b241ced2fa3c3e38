//! Entry-point synthesis
//!
//! Makes sure the module has exactly one designated entry, `main`, which
//! becomes the top-level program of the exported graph.

use super::ExportStep;
use crate::ir::{Function, FunctionKind, Module, OpKind, Operation, MAIN_FUNCTION_NAME};
use anyhow::{bail, Context};
use tracing::debug;

/// Insert or designate the `main` function
///
/// - An existing entry function named `main` is left alone. A `main` of any
///   other kind is rejected.
/// - A single entry function is renamed to `main`; call sites and alias
///   targets follow the rename.
/// - Several entry functions get a synthesized `main` that calls each of them.
///   The callees are demoted to private functions and keep their names, so
///   aliases keep resolving.
pub struct InsertMainFunction;

impl ExportStep for InsertMainFunction {
    fn name(&self) -> &'static str {
        "insert_main_function"
    }

    fn run(&self, module: &mut Module) -> anyhow::Result<()> {
        if let Some(main) = module.main() {
            if main.kind != FunctionKind::Entry {
                bail!(
                    "`{MAIN_FUNCTION_NAME}` exists but is a {:?} function, not an entry",
                    main.kind
                );
            }
            debug!("`main` already present");
            return Ok(());
        }

        let entries: Vec<String> = module.entry_functions().map(|f| f.name.clone()).collect();
        match entries.as_slice() {
            [] => bail!("module has no entry function to designate as `{MAIN_FUNCTION_NAME}`"),
            [only] => {
                debug!(function = %only, "renaming sole entry function to `main`");
                module
                    .rename_function(only, MAIN_FUNCTION_NAME)
                    .with_context(|| format!("failed to rename `{only}`"))?;
            }
            _ => {
                let main = synthesize_main(module, &entries)?;
                for name in &entries {
                    if let Some(function) = module.function_mut(name) {
                        function.kind = FunctionKind::Private;
                    }
                }
                debug!(entries = entries.len(), "synthesized `main` calling every entry");
                module.add_function(main)?;
            }
        }
        Ok(())
    }
}

fn synthesize_main(module: &Module, entries: &[String]) -> anyhow::Result<Function> {
    let mut main = Function::entry(MAIN_FUNCTION_NAME);
    for name in entries {
        let entry = module
            .function(name)
            .with_context(|| format!("entry function `{name}` disappeared"))?;

        let mut inputs = Vec::with_capacity(entry.args.len());
        for arg in &entry.args {
            let forwarded = main.unique_value_name(&format!("{}_{}", entry.name, arg.name));
            main = main.with_arg(forwarded.clone(), arg.dtype);
            inputs.push(forwarded);
        }

        let call_name = main.unique_value_name(&format!("{}_call", entry.name));
        main.push_op(
            Operation::new(
                call_name.clone(),
                OpKind::Call {
                    callee: entry.name.clone(),
                },
            )
            .with_inputs(inputs),
        )?;
        main.results.push(call_name);
    }
    Ok(main)
}
