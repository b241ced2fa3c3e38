//! Shape-determining constant duplication
//!
//! A constant that determines a tensor shape must be known when each placement
//! group is compiled ahead of time. When such a constant is consumed from more
//! than one placement, every group gets its own copy instead of a reference
//! across the boundary. `Identity` and `Cast` ops between the constant and the
//! shape operand are copied along with it, so the whole path sits on the
//! consumer's device.

use super::ExportStep;
use crate::ir::{Dialect, Function, Module};
use anyhow::bail;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Give every placement group its own copy of shared shape-determining constants
///
/// Must run before lowering: it refuses modules already in executor form.
pub struct DuplicateShapeDeterminingConstants;

impl ExportStep for DuplicateShapeDeterminingConstants {
    fn name(&self) -> &'static str {
        "duplicate_shape_determining_constants"
    }

    fn run(&self, module: &mut Module) -> anyhow::Result<()> {
        if module.dialect() != Dialect::Functional {
            bail!("shape-determining constants must be duplicated before lowering to executor form");
        }
        for function in module.functions_mut() {
            let copies = duplicate_in_function(function);
            if copies > 0 {
                debug!(function = %function.name, copies, "duplicated shape-determining constants");
            }
        }
        Ok(())
    }
}

/// Returns the number of copies created
fn duplicate_in_function(function: &mut Function) -> usize {
    clone_shape_chains(function) + split_direct_users(function)
}

/// Copy every constant path feeding a shape operand onto the consumer's device
///
/// Walks each shape operand back through shape-transparent ops to its constant.
/// Everything from the consumer down to the last link placed elsewhere is
/// copied; links below that already sit on the right device are shared.
fn clone_shape_chains(function: &mut Function) -> usize {
    let edges: Vec<(String, usize)> = function
        .ops
        .iter()
        .flat_map(|op| {
            op.kind
                .shape_operand_indices()
                .iter()
                .filter(|&&idx| idx < op.inputs.len())
                .map(move |&idx| (op.name.clone(), idx))
        })
        .collect();

    // (original, device) -> copy placed on that device
    let mut placed: HashMap<(String, String), String> = HashMap::new();
    let mut rewired = Vec::new();
    let mut copies = 0;

    for (consumer, operand) in edges {
        let Some(consumer_op) = function.op(&consumer) else {
            continue;
        };
        let device = consumer_op.device.clone();
        let Some(chain) = constant_chain(function, &consumer_op.inputs[operand]) else {
            continue;
        };
        let Some(deepest) = chain
            .iter()
            .rposition(|link| function.op(link).is_some_and(|op| op.device != device))
        else {
            continue;
        };

        let mut below = chain.get(deepest + 1).cloned();
        for link in chain[..=deepest].iter().rev() {
            let key = (link.clone(), device.clone());
            let copy = match placed.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let Some(copy) = place_copy(function, link, &device, below.as_deref()) else {
                        break;
                    };
                    copies += 1;
                    placed.insert(key, copy.clone());
                    copy
                }
            };
            rewired.push(link.clone());
            below = Some(copy);
        }

        if let (Some(index), Some(copy)) = (function.op_index(&consumer), below) {
            function.ops[index].inputs[operand] = copy;
        }
    }

    remove_orphans(function, rewired);
    copies
}

/// Names from `value` back to the constant it forwards, `None` if it reaches none
fn constant_chain(function: &Function, value: &str) -> Option<Vec<String>> {
    let mut chain = Vec::new();
    let mut current = value;
    while chain.len() <= function.ops.len() {
        let op = function.op(current)?;
        chain.push(op.name.clone());
        if op.is_constant() {
            return Some(chain);
        }
        if !op.kind.is_shape_transparent() {
            return None;
        }
        current = op.inputs.first()?;
    }
    None
}

/// Insert a copy of `original` on `device` right after it, fed by `input`
fn place_copy(
    function: &mut Function,
    original: &str,
    device: &str,
    input: Option<&str>,
) -> Option<String> {
    let index = function.op_index(original)?;
    let mut copy = function.ops[index].clone();
    copy.name = unique_copy_name(function, original);
    copy.device = device.to_string();
    if let (Some(input), Some(slot)) = (input, copy.inputs.first_mut()) {
        *slot = input.to_string();
    }
    let name = copy.name.clone();
    function.ops.insert(index + 1, copy);
    Some(name)
}

/// Drop rewired originals nothing uses anymore
fn remove_orphans(function: &mut Function, mut candidates: Vec<String>) {
    while let Some(position) = candidates
        .iter()
        .position(|name| function.op(name).is_some() && !function.is_used(name))
    {
        let name = candidates.swap_remove(position);
        function.remove_op(&name);
    }
}

/// Split the direct users of shared shape-determining constants by placement
fn split_direct_users(function: &mut Function) -> usize {
    let shape_constants = function.shape_determining_constants();
    let candidates: Vec<String> = function
        .ops
        .iter()
        .filter(|op| shape_constants.contains(&op.name))
        .map(|op| op.name.clone())
        .collect();

    let mut copies = 0;
    for name in candidates {
        let Some(original_device) = function.op(&name).map(|op| op.device.clone()) else {
            continue;
        };

        // Users grouped by placement; BTreeMap keeps copy naming deterministic.
        let mut foreign_groups: BTreeMap<String, Vec<(String, usize)>> = BTreeMap::new();
        for (op_idx, operand_idx) in function.uses_of(&name) {
            let user = &function.ops[op_idx];
            if user.device != original_device {
                foreign_groups
                    .entry(user.device.clone())
                    .or_default()
                    .push((user.name.clone(), operand_idx));
            }
        }

        for (device, uses) in foreign_groups {
            let Some(copy) = place_copy(function, &name, &device, None) else {
                continue;
            };
            for (user, operand_idx) in uses {
                if let Some(op) = function.op_mut(&user) {
                    op.inputs[operand_idx] = copy.clone();
                }
            }
            copies += 1;
        }

        if !function.is_used(&name) {
            function.remove_op(&name);
        }
    }
    copies
}

fn unique_copy_name(function: &Function, base: &str) -> String {
    let stem = format!("{}_dup", base);
    let mut candidate = stem.clone();
    let mut n = 0;
    while function.has_value(&candidate) {
        n += 1;
        candidate = format!("{}_{}", stem, n);
    }
    candidate
}
