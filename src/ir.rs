//! In-memory program representation consumed by the export pipeline
//!
//! A [`Module`] holds functions in insertion order. Each [`Function`] is a list of
//! single-result [`Operation`]s; an operation's name doubles as the name of the
//! value it produces, so data edges are plain name references. Control edges are
//! kept separately in `control_inputs`.
//!
//! The module starts out in [`Dialect::Functional`] form and is switched to
//! [`Dialect::Executor`] by the lowering step. Steps that only make sense on one
//! side of that boundary check the dialect before touching anything.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use thiserror::Error;

/// Name of the designated top-level function
pub const MAIN_FUNCTION_NAME: &str = "main";

/// Structural errors raised while inspecting or editing a module
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    /// Referenced function does not exist
    #[error("function `{0}` not found")]
    FunctionNotFound(String),

    /// A function with this name already exists
    #[error("function `{0}` already exists")]
    DuplicateFunction(String),

    /// An operation or argument with this name already exists in the function
    #[error("value `{value}` is already defined in function `{function}`")]
    DuplicateValue {
        /// Function being edited
        function: String,
        /// Conflicting value name
        value: String,
    },

    /// An operation consumes a value nobody produces
    #[error("`{op}` in function `{function}` references unknown value `{value}`")]
    UnknownValue {
        /// Function containing the operation
        function: String,
        /// Consuming operation
        op: String,
        /// Missing value name
        value: String,
    },

    /// Data or control edges form a cycle
    #[error("function `{function}` contains a cycle through `{op}`")]
    Cycle {
        /// Function containing the cycle
        function: String,
        /// One operation on the cycle
        op: String,
    },

    /// Tensor payload does not match its declared shape and dtype
    #[error("tensor data has {actual} bytes, expected {expected}")]
    ValueSize {
        /// Bytes implied by shape and dtype
        expected: usize,
        /// Bytes supplied
        actual: usize,
    },
}

/// Element type of a tensor value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// bfloat16
    BF16,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 8-bit integer
    U8,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
    /// Boolean, one byte per element
    Bool,
    /// Quantized 8-bit integer
    QInt8,
    /// Quantized 32-bit integer (accumulators, biases)
    QInt32,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool | Self::QInt8 => 1,
            Self::F16 | Self::BF16 => 2,
            Self::F32 | Self::I32 | Self::QInt32 => 4,
            Self::I64 => 8,
        }
    }

    /// Serialized type name
    pub fn name(&self) -> &'static str {
        match self {
            Self::F32 => "DT_FLOAT",
            Self::F16 => "DT_HALF",
            Self::BF16 => "DT_BFLOAT16",
            Self::I8 => "DT_INT8",
            Self::U8 => "DT_UINT8",
            Self::I32 => "DT_INT32",
            Self::I64 => "DT_INT64",
            Self::Bool => "DT_BOOL",
            Self::QInt8 => "DT_QINT8",
            Self::QInt32 => "DT_QINT32",
        }
    }
}

/// Dense constant payload stored as little-endian bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    dtype: DataType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl TensorValue {
    /// Create a value from raw little-endian bytes
    pub fn new(dtype: DataType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, IrError> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if expected != data.len() {
            return Err(IrError::ValueSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// 1-D `I32` value
    pub fn from_i32(values: &[i32]) -> Self {
        Self {
            dtype: DataType::I32,
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// 1-D `I64` value
    pub fn from_i64(values: &[i64]) -> Self {
        Self {
            dtype: DataType::I64,
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// `F32` value with an explicit shape
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, IrError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DataType::F32, shape, data)
    }

    /// Element type
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Dimensions
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Payload size in bytes
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Decode integer values, widening `I32` to `i64`
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self.dtype {
            DataType::I32 => Some(
                self.data
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                    .collect(),
            ),
            DataType::I64 => Some(
                self.data
                    .chunks_exact(8)
                    .map(|c| {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(c);
                        i64::from_le_bytes(bytes)
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Operation kinds understood by the export steps
///
/// Anything else is carried through untouched as [`OpKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Constant holding a [`TensorValue`]
    Const,
    /// Graph input fed at run time
    Placeholder,
    /// Forwards its operand
    Identity,
    /// Element type conversion
    Cast,
    /// Reshape; operand 1 is the target shape
    Reshape,
    /// Fill; operand 0 is the output shape
    Fill,
    /// Tile; operand 1 holds the multiples
    Tile,
    /// Broadcast; operand 1 is the target shape
    BroadcastTo,
    /// Slice; operands 1 and 2 are begin and size
    Slice,
    /// Pad; operand 1 holds the paddings
    Pad,
    /// Insert a dimension; operand 1 is the axis
    ExpandDims,
    /// Element-wise addition
    Add,
    /// Element-wise multiplication
    Mul,
    /// Matrix product
    MatMul,
    /// 2-D convolution
    Conv2D,
    /// Rectified linear unit
    Relu,
    /// Float to quantized
    Quantize,
    /// Quantized to float
    Dequantize,
    /// Matrix product on quantized operands
    QuantizedMatMul,
    /// Call to another function of the module
    Call {
        /// Called function
        callee: String,
    },
    /// Resource handle to a variable
    VarHandle {
        /// Name under which the variable is checkpointed
        shared_name: String,
    },
    /// Reads the current value of a variable
    ReadVariable,
    /// Writes a value into a variable
    AssignVariable,
    /// Reads one tensor from the checkpoint whose prefix is operand 0
    RestoreTensor {
        /// Name of the tensor inside the checkpoint
        tensor_name: String,
        /// Element type of the restored tensor
        dtype: DataType,
    },
    /// Writes tensors to the checkpoint whose prefix is operand 0
    ///
    /// The remaining operands are the values, in `tensor_names` order.
    SaveTensors {
        /// Checkpoint names of the saved tensors
        tensor_names: Vec<String>,
    },
    /// Resource handle to a lookup table
    HashTable {
        /// Name shared between initializer and users
        shared_name: String,
    },
    /// Fills a lookup table
    InitializeTable,
    /// Queries a lookup table
    LookupTable,
    /// Does nothing; used as a control anchor
    NoOp,
    /// Any other operation, carried through by name
    Custom(String),
}

impl OpKind {
    /// Operation name as it appears in the serialized graph
    pub fn op_name(&self) -> &str {
        match self {
            Self::Const => "Const",
            Self::Placeholder => "Placeholder",
            Self::Identity => "Identity",
            Self::Cast => "Cast",
            Self::Reshape => "Reshape",
            Self::Fill => "Fill",
            Self::Tile => "Tile",
            Self::BroadcastTo => "BroadcastTo",
            Self::Slice => "Slice",
            Self::Pad => "Pad",
            Self::ExpandDims => "ExpandDims",
            Self::Add => "AddV2",
            Self::Mul => "Mul",
            Self::MatMul => "MatMul",
            Self::Conv2D => "Conv2D",
            Self::Relu => "Relu",
            Self::Quantize => "UniformQuantize",
            Self::Dequantize => "UniformDequantize",
            Self::QuantizedMatMul => "UniformQuantizedDot",
            Self::Call { .. } => "PartitionedCall",
            Self::VarHandle { .. } => "VarHandleOp",
            Self::ReadVariable => "ReadVariableOp",
            Self::AssignVariable => "AssignVariableOp",
            Self::RestoreTensor { .. } => "RestoreV2",
            Self::SaveTensors { .. } => "SaveV2",
            Self::HashTable { .. } => "HashTableV2",
            Self::InitializeTable => "InitializeTableV2",
            Self::LookupTable => "LookupTableFindV2",
            Self::NoOp => "NoOp",
            Self::Custom(name) => name,
        }
    }

    /// Operand positions whose values determine the shape of the result
    pub fn shape_operand_indices(&self) -> &'static [usize] {
        match self {
            Self::Fill => &[0],
            Self::Reshape | Self::Tile | Self::BroadcastTo | Self::Pad | Self::ExpandDims => &[1],
            Self::Slice => &[1, 2],
            _ => &[],
        }
    }

    /// Ops that forward a shape-determining value unchanged in meaning
    pub fn is_shape_transparent(&self) -> bool {
        matches!(self, Self::Identity | Self::Cast)
    }

    /// Ops whose relative order must be kept once lowered
    pub fn is_side_effecting(&self) -> bool {
        matches!(
            self,
            Self::Call { .. }
                | Self::ReadVariable
                | Self::AssignVariable
                | Self::RestoreTensor { .. }
                | Self::SaveTensors { .. }
                | Self::InitializeTable
                | Self::LookupTable
        )
    }

    /// Called function, for `Call`
    pub fn callee(&self) -> Option<&str> {
        match self {
            Self::Call { callee } => Some(callee),
            _ => None,
        }
    }

    /// Resource name, for handle-producing ops
    pub fn shared_name(&self) -> Option<&str> {
        match self {
            Self::VarHandle { shared_name } | Self::HashTable { shared_name } => Some(shared_name),
            _ => None,
        }
    }
}

/// A single-result operation
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Unique within the function; also names the produced value
    pub name: String,
    /// What the operation does
    pub kind: OpKind,
    /// Consumed values, in operand order
    pub inputs: Vec<String>,
    /// Operations that must run before this one
    pub control_inputs: Vec<String>,
    /// Placement; empty means unplaced
    pub device: String,
    /// Payload of a `Const`
    pub value: Option<TensorValue>,
    /// Set on operations merged in from an initializer function
    pub is_initializer: bool,
}

impl Operation {
    /// Create an operation with no operands
    pub fn new<S: Into<String>>(name: S, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            control_inputs: Vec::new(),
            device: String::new(),
            value: None,
            is_initializer: false,
        }
    }

    /// Create a constant
    pub fn constant<S: Into<String>>(name: S, value: TensorValue) -> Self {
        let mut op = Self::new(name, OpKind::Const);
        op.value = Some(value);
        op
    }

    /// Set operands
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Append a control input
    pub fn with_control_input<S: Into<String>>(mut self, name: S) -> Self {
        self.add_control_input(name);
        self
    }

    /// Set placement
    pub fn on_device<S: Into<String>>(mut self, device: S) -> Self {
        self.device = device.into();
        self
    }

    /// Check if this is a constant
    pub fn is_constant(&self) -> bool {
        self.kind == OpKind::Const
    }

    /// Add a control input unless already present; returns whether it was added
    pub fn add_control_input<S: Into<String>>(&mut self, name: S) -> bool {
        let name = name.into();
        if self.control_inputs.contains(&name) {
            return false;
        }
        self.control_inputs.push(name);
        true
    }
}

/// Session initializer flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitializerType {
    /// Restores variables from a checkpoint
    Restore,
    /// Initializes other resources (tables, constant-initialized variables)
    Init,
}

/// Role of a function within the module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// User-callable signature
    Entry,
    /// Helper only reachable through calls
    Private,
    /// Runs once before any entry, to set up resources
    Initializer(InitializerType),
}

/// Function argument
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// Value name inside the function body
    pub name: String,
    /// Element type
    pub dtype: DataType,
}

/// A function: arguments, a body of operations and returned values
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Symbol name, unique within the module
    pub name: String,
    /// Role
    pub kind: FunctionKind,
    /// Arguments
    pub args: Vec<Argument>,
    /// Body in program order
    pub ops: Vec<Operation>,
    /// Returned values
    pub results: Vec<String>,
}

impl Function {
    /// Create an empty function
    pub fn new<S: Into<String>>(name: S, kind: FunctionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            args: Vec::new(),
            ops: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Create an empty entry function
    pub fn entry<S: Into<String>>(name: S) -> Self {
        Self::new(name, FunctionKind::Entry)
    }

    /// Create an empty initializer function
    pub fn initializer<S: Into<String>>(name: S, init_type: InitializerType) -> Self {
        Self::new(name, FunctionKind::Initializer(init_type))
    }

    /// Append an argument
    pub fn with_arg<S: Into<String>>(mut self, name: S, dtype: DataType) -> Self {
        self.args.push(Argument {
            name: name.into(),
            dtype,
        });
        self
    }

    /// Append an operation (no duplicate check; use [`Function::push_op`] for that)
    pub fn with_op(mut self, op: Operation) -> Self {
        self.ops.push(op);
        self
    }

    /// Append a returned value
    pub fn with_result<S: Into<String>>(mut self, name: S) -> Self {
        self.results.push(name.into());
        self
    }

    /// Whether this is an initializer function
    pub fn is_initializer(&self) -> bool {
        matches!(self.kind, FunctionKind::Initializer(_))
    }

    /// Append an operation, rejecting duplicate value names
    pub fn push_op(&mut self, op: Operation) -> Result<(), IrError> {
        if self.has_value(&op.name) {
            return Err(IrError::DuplicateValue {
                function: self.name.clone(),
                value: op.name,
            });
        }
        self.ops.push(op);
        Ok(())
    }

    /// Look up an operation by name
    pub fn op(&self, name: &str) -> Option<&Operation> {
        self.ops.iter().find(|op| op.name == name)
    }

    /// Look up an operation by name, mutably
    pub fn op_mut(&mut self, name: &str) -> Option<&mut Operation> {
        self.ops.iter_mut().find(|op| op.name == name)
    }

    /// Position of an operation in program order
    pub fn op_index(&self, name: &str) -> Option<usize> {
        self.ops.iter().position(|op| op.name == name)
    }

    /// Whether an argument or operation defines `name`
    pub fn has_value(&self, name: &str) -> bool {
        self.args.iter().any(|arg| arg.name == name) || self.op(name).is_some()
    }

    /// Remove an operation; its uses are left dangling
    pub fn remove_op(&mut self, name: &str) -> Option<Operation> {
        let index = self.op_index(name)?;
        Some(self.ops.remove(index))
    }

    /// `(op index, operand index)` for every data use of `value`
    pub fn uses_of(&self, value: &str) -> Vec<(usize, usize)> {
        self.ops
            .iter()
            .enumerate()
            .flat_map(|(op_idx, op)| {
                op.inputs
                    .iter()
                    .enumerate()
                    .filter(move |(_, input)| input.as_str() == value)
                    .map(move |(operand_idx, _)| (op_idx, operand_idx))
            })
            .collect()
    }

    /// Whether `value` is consumed by any op or returned
    pub fn is_used(&self, value: &str) -> bool {
        self.results.iter().any(|r| r == value)
            || self.ops.iter().any(|op| {
                op.inputs.iter().any(|i| i == value) || op.control_inputs.iter().any(|c| c == value)
            })
    }

    /// Generate an unused value name starting from `base`
    pub fn unique_value_name(&self, base: &str) -> String {
        if !self.has_value(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !self.has_value(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    /// Constants that reach a shape operand, possibly through shape-transparent ops
    pub fn shape_determining_constants(&self) -> HashSet<String> {
        let by_name: HashMap<&str, &Operation> =
            self.ops.iter().map(|op| (op.name.as_str(), op)).collect();

        let mut worklist: Vec<&str> = self
            .ops
            .iter()
            .flat_map(|op| {
                op.kind
                    .shape_operand_indices()
                    .iter()
                    .filter_map(move |&idx| op.inputs.get(idx).map(String::as_str))
            })
            .collect();

        let mut visited = HashSet::new();
        let mut constants = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !visited.insert(value) {
                continue;
            }
            let Some(&producer) = by_name.get(value) else {
                continue;
            };
            if producer.is_constant() {
                constants.insert(producer.name.clone());
            } else if producer.kind.is_shape_transparent() {
                worklist.extend(producer.inputs.iter().map(String::as_str));
            }
        }
        constants
    }

    /// Check that every referenced value is defined
    pub fn verify(&self) -> Result<(), IrError> {
        for op in &self.ops {
            for value in op.inputs.iter().chain(op.control_inputs.iter()) {
                if !self.has_value(value) {
                    return Err(IrError::UnknownValue {
                        function: self.name.clone(),
                        op: op.name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        for result in &self.results {
            if !self.has_value(result) {
                return Err(IrError::UnknownValue {
                    function: self.name.clone(),
                    op: "<return>".to_string(),
                    value: result.clone(),
                });
            }
        }
        Ok(())
    }

    /// Reorder the body so every op follows its data and control producers
    ///
    /// Kahn's algorithm, always releasing the ready op that came first in the
    /// current program order, so an already-sorted body is left untouched.
    pub fn sort_topologically(&mut self) -> Result<(), IrError> {
        self.verify()?;

        let index: HashMap<&str, usize> = self
            .ops
            .iter()
            .enumerate()
            .map(|(i, op)| (op.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.ops.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.ops.len()];
        for (i, op) in self.ops.iter().enumerate() {
            let producers: HashSet<usize> = op
                .inputs
                .iter()
                .chain(op.control_inputs.iter())
                .filter_map(|value| index.get(value.as_str()).copied())
                .collect();
            in_degree[i] = producers.len();
            for producer in producers {
                dependents[producer].push(i);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.ops.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() != self.ops.len() {
            let stuck = in_degree
                .iter()
                .position(|&degree| degree > 0)
                .map(|i| self.ops[i].name.clone())
                .unwrap_or_default();
            return Err(IrError::Cycle {
                function: self.name.clone(),
                op: stuck,
            });
        }

        let mut slots: Vec<Option<Operation>> = self.ops.drain(..).map(Some).collect();
        self.ops = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();
        Ok(())
    }
}

/// Representation stage of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// Optimization-oriented form produced by the quantizer
    #[default]
    Functional,
    /// Executor-oriented form with explicit side-effect ordering
    Executor,
}

/// Auxiliary file the model needs at load time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Placeholder name the file path is fed into
    pub name: String,
    /// File name relative to the model's assets directory
    pub filename: String,
}

/// A program under transformation
#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: Vec<Function>,
    /// User-facing alias to internal function name
    pub function_aliases: BTreeMap<String, String>,
    /// Asset references, in load order
    pub assets: Vec<Asset>,
    dialect: Dialect,
}

impl Module {
    /// Create an empty module in functional form
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function, rejecting duplicate names
    pub fn add_function(&mut self, function: Function) -> Result<(), IrError> {
        if self.contains_function(&function.name) {
            return Err(IrError::DuplicateFunction(function.name));
        }
        self.functions.push(function);
        Ok(())
    }

    /// Builder form of [`Module::add_function`]
    pub fn with_function(mut self, function: Function) -> Result<Self, IrError> {
        self.add_function(function)?;
        Ok(self)
    }

    /// Add a function alias
    pub fn with_alias<A: Into<String>, F: Into<String>>(mut self, alias: A, function: F) -> Self {
        self.function_aliases.insert(alias.into(), function.into());
        self
    }

    /// Add an asset reference
    pub fn with_asset<N: Into<String>, F: Into<String>>(mut self, name: N, filename: F) -> Self {
        self.assets.push(Asset {
            name: name.into(),
            filename: filename.into(),
        });
        self
    }

    /// Functions in insertion order
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Functions in insertion order, mutably
    pub fn functions_mut(&mut self) -> &mut [Function] {
        &mut self.functions
    }

    /// Look up a function
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Look up a function, mutably
    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    /// Whether a function with this name exists
    pub fn contains_function(&self, name: &str) -> bool {
        self.function(name).is_some()
    }

    /// Remove a function by name
    pub fn remove_function(&mut self, name: &str) -> Option<Function> {
        let index = self.functions.iter().position(|f| f.name == name)?;
        Some(self.functions.remove(index))
    }

    /// The `main` function, if present
    pub fn main(&self) -> Option<&Function> {
        self.function(MAIN_FUNCTION_NAME)
    }

    /// The `main` function, mutably
    pub fn main_mut(&mut self) -> Option<&mut Function> {
        self.function_mut(MAIN_FUNCTION_NAME)
    }

    /// Entry functions in insertion order
    pub fn entry_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions
            .iter()
            .filter(|f| f.kind == FunctionKind::Entry)
    }

    /// Initializer functions in insertion order
    pub fn initializer_functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|f| f.is_initializer())
    }

    /// Rename a function, rewriting call sites and alias targets
    pub fn rename_function(&mut self, old: &str, new: &str) -> Result<(), IrError> {
        if old == new {
            return Ok(());
        }
        if self.contains_function(new) {
            return Err(IrError::DuplicateFunction(new.to_string()));
        }
        let function = self
            .function_mut(old)
            .ok_or_else(|| IrError::FunctionNotFound(old.to_string()))?;
        function.name = new.to_string();

        for function in &mut self.functions {
            for op in &mut function.ops {
                if let OpKind::Call { callee } = &mut op.kind {
                    if callee == old {
                        *callee = new.to_string();
                    }
                }
            }
        }
        for target in self.function_aliases.values_mut() {
            if target == old {
                *target = new.to_string();
            }
        }
        Ok(())
    }

    /// Current representation stage
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Switch representation stage
    pub fn set_dialect(&mut self, dialect: Dialect) {
        self.dialect = dialect;
    }

    /// Total number of operations across all functions
    pub fn op_count(&self) -> usize {
        self.functions.iter().map(|f| f.ops.len()).sum()
    }
}
