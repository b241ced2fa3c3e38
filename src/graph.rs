//! Serializable graph representation extracted from a lowered module
//!
//! The layout follows the usual dataflow-graph interchange shape: a flat list of
//! nodes for the top-level program plus a library of functions. Data inputs are
//! plain node names and control inputs carry a `^` prefix.

use crate::error::{Error, Result};
use crate::ir::{Dialect, Function, Module, OpKind, Operation, TensorValue, MAIN_FUNCTION_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix marking a control input in a node's input list
pub const CONTROL_INPUT_PREFIX: char = '^';

/// Producer string recorded in every exported graph
pub const PRODUCER: &str = concat!("quant-export/", env!("CARGO_PKG_VERSION"));

// Placeholder ops inside functions only ever carry checkpoint prefixes
const STRING_DTYPE: &str = "DT_STRING";

/// Node attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    /// String attribute
    S(String),
    /// Integer attribute
    I(i64),
    /// Boolean attribute
    B(bool),
    /// List of strings
    Strings(Vec<String>),
    /// Function reference
    Func(String),
    /// Tensor payload
    Tensor(TensorValue),
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDef {
    /// Unique node name
    pub name: String,
    /// Operation name
    pub op: String,
    /// Data inputs followed by `^`-prefixed control inputs
    pub input: Vec<String>,
    /// Placement
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    /// Attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attr: BTreeMap<String, AttrValue>,
}

impl NodeDef {
    /// Data inputs, without control inputs
    pub fn data_inputs(&self) -> impl Iterator<Item = &str> {
        self.input
            .iter()
            .filter(|i| !i.starts_with(CONTROL_INPUT_PREFIX))
            .map(String::as_str)
    }

    /// Control inputs with the `^` prefix stripped
    pub fn control_inputs(&self) -> impl Iterator<Item = &str> {
        self.input
            .iter()
            .filter_map(|i| i.strip_prefix(CONTROL_INPUT_PREFIX))
    }

    /// Constant payload, for `Const` nodes
    pub fn tensor_value(&self) -> Option<&TensorValue> {
        match self.attr.get("value") {
            Some(AttrValue::Tensor(value)) => Some(value),
            _ => None,
        }
    }
}

/// Function in the graph's library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Function name
    pub name: String,
    /// Argument names
    pub input_args: Vec<String>,
    /// Returned value names
    pub output_args: Vec<String>,
    /// Body
    pub node_def: Vec<NodeDef>,
}

/// Graph producer/consumer versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDef {
    /// Producer identifier
    pub producer: String,
    /// Oldest consumer able to read the graph
    pub min_consumer: u32,
}

impl Default for VersionDef {
    fn default() -> Self {
        Self {
            producer: PRODUCER.to_string(),
            min_consumer: 0,
        }
    }
}

/// The serializable computation graph
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraphDef {
    /// Name under which the top-level program is addressed
    pub entry: String,
    /// Top-level nodes
    pub node: Vec<NodeDef>,
    /// Function library
    pub library: Vec<FunctionDef>,
    /// Versions
    pub versions: VersionDef,
}

impl GraphDef {
    /// Extract the graph from a lowered module
    ///
    /// `main` becomes the top-level node list and every other function goes to
    /// the library. Fails if the module has not been lowered yet.
    pub fn from_module(module: &Module) -> Result<Self> {
        if module.dialect() != Dialect::Executor {
            return Err(Error::malformed_export(
                "graph extraction requires a module lowered to executor form",
            ));
        }
        let main = module.main().ok_or_else(|| {
            Error::malformed_export(format!(
                "module has no `{}` function to export",
                MAIN_FUNCTION_NAME
            ))
        })?;

        let mut node: Vec<NodeDef> = main
            .args
            .iter()
            .map(|arg| NodeDef {
                name: arg.name.clone(),
                op: "Placeholder".to_string(),
                input: Vec::new(),
                device: String::new(),
                attr: BTreeMap::from([(
                    "dtype".to_string(),
                    AttrValue::S(arg.dtype.name().to_string()),
                )]),
            })
            .collect();
        node.extend(main.ops.iter().map(node_from_op));
        node.extend(main.results.iter().enumerate().map(|(i, result)| NodeDef {
            name: format!("output_{}", i),
            op: "Identity".to_string(),
            input: vec![result.clone()],
            device: String::new(),
            attr: BTreeMap::new(),
        }));

        let library = module
            .functions()
            .iter()
            .filter(|f| f.name != MAIN_FUNCTION_NAME)
            .map(function_def_from)
            .collect();

        Ok(Self {
            entry: MAIN_FUNCTION_NAME.to_string(),
            node,
            library,
            versions: VersionDef::default(),
        })
    }

    /// True when the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.node.is_empty()
    }

    /// Look up a top-level node
    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.node.iter().find(|n| n.name == name)
    }

    /// Whether a top-level node with this name exists
    pub fn has_node(&self, name: &str) -> bool {
        self.node(name).is_some()
    }

    /// Whether a `node:output` tensor name refers to a top-level node
    ///
    /// A name without an output index refers to output 0.
    pub fn has_tensor(&self, tensor: &str) -> bool {
        let node = match tensor.rsplit_once(':') {
            Some((node, index)) if index.parse::<usize>().is_ok() => node,
            _ => tensor,
        };
        self.has_node(node)
    }

    /// Top-level nodes running the given operation
    pub fn nodes_by_op<'a>(&'a self, op: &'a str) -> impl Iterator<Item = &'a NodeDef> + 'a {
        self.node.iter().filter(move |n| n.op == op)
    }

    /// Look up a library function
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.library.iter().find(|f| f.name == name)
    }

    /// Whether `name` resolves to the entry program or a library function
    pub fn has_function(&self, name: &str) -> bool {
        (!self.entry.is_empty() && self.entry == name) || self.function(name).is_some()
    }
}

fn node_from_op(op: &Operation) -> NodeDef {
    let mut attr = BTreeMap::new();
    if let Some(value) = &op.value {
        attr.insert("value".to_string(), AttrValue::Tensor(value.clone()));
        attr.insert(
            "dtype".to_string(),
            AttrValue::S(value.dtype().name().to_string()),
        );
    }
    match &op.kind {
        OpKind::Call { callee } => {
            attr.insert("f".to_string(), AttrValue::Func(callee.clone()));
        }
        OpKind::VarHandle { shared_name } | OpKind::HashTable { shared_name } => {
            attr.insert("shared_name".to_string(), AttrValue::S(shared_name.clone()));
        }
        OpKind::Placeholder => {
            attr.insert("dtype".to_string(), AttrValue::S(STRING_DTYPE.to_string()));
        }
        OpKind::RestoreTensor { tensor_name, dtype } => {
            attr.insert(
                "tensor_names".to_string(),
                AttrValue::Strings(vec![tensor_name.clone()]),
            );
            attr.insert("dtype".to_string(), AttrValue::S(dtype.name().to_string()));
        }
        OpKind::SaveTensors { tensor_names } => {
            attr.insert(
                "tensor_names".to_string(),
                AttrValue::Strings(tensor_names.clone()),
            );
        }
        _ => {}
    }
    if op.is_initializer {
        attr.insert("_initializer".to_string(), AttrValue::B(true));
    }

    let input = op
        .inputs
        .iter()
        .cloned()
        .chain(
            op.control_inputs
                .iter()
                .map(|c| format!("{}{}", CONTROL_INPUT_PREFIX, c)),
        )
        .collect();

    NodeDef {
        name: op.name.clone(),
        op: op.kind.op_name().to_string(),
        input,
        device: op.device.clone(),
        attr,
    }
}

fn function_def_from(function: &Function) -> FunctionDef {
    FunctionDef {
        name: function.name.clone(),
        input_args: function.args.iter().map(|a| a.name.clone()).collect(),
        output_args: function.results.clone(),
        node_def: function.ops.iter().map(node_from_op).collect(),
    }
}
