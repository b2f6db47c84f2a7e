//! Core graph data types.
//!
//! A graph is a flat, topologically ordered node list over named values.
//! Node indices double as program counters for partial runs.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tensor::{DType, TensorValue};

/// Index of a value in the graph's value table.
pub type ValueId = usize;

/// Attribute value used by ops in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Float(f32),
    Double(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
    IntList(Vec<i64>),
    DType(DType),
}

/// Named attribute for an op invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpAttr {
    pub name: String,
    pub value: AttrValue,
}

/// Collection of op attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpAttrs {
    pub items: Vec<OpAttr>,
}

impl OpAttrs {
    /// Build an empty attribute set.
    pub fn none() -> Self {
        Self { items: Vec::new() }
    }

    /// Append an attribute, builder style.
    pub fn with(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.items.push(OpAttr {
            name: name.into(),
            value,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.items
            .iter()
            .find(|attr| attr.name == name)
            .map(|attr| &attr.value)
    }

    /// Read a numeric attribute as `f64`.
    pub fn float(&self, name: &str) -> Result<Option<f64>> {
        match self.get(name) {
            None => Ok(None),
            Some(AttrValue::Float(value)) => Ok(Some(*value as f64)),
            Some(AttrValue::Double(value)) => Ok(Some(*value)),
            Some(AttrValue::Int(value)) => Ok(Some(*value as f64)),
            Some(AttrValue::UInt(value)) => Ok(Some(*value as f64)),
            Some(other) => Err(anyhow!("attribute {} is not numeric: {:?}", name, other)),
        }
    }

    /// Read an integer attribute as `usize`.
    pub fn usize(&self, name: &str) -> Result<Option<usize>> {
        match self.get(name) {
            None => Ok(None),
            Some(AttrValue::Int(value)) if *value >= 0 => Ok(Some(*value as usize)),
            Some(AttrValue::UInt(value)) => Ok(Some(*value as usize)),
            Some(other) => Err(anyhow!(
                "attribute {} is not a non-negative integer: {:?}",
                name,
                other
            )),
        }
    }
}

/// Operation kind of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Identity,
    Add,
    Sub,
    Mul,
    Scale,
    Relu,
    ReluGrad,
    MatMul,
    Transpose,
    ReduceSumRows,
    TopK,
    BeamSearchTopK,
    ZeroPointErase,
    ZeroPointRestore,
    /// Forward/backward split marker. Inputs are the forward fetches,
    /// outputs are fed by the caller when the backward half runs.
    Yield,
    Custom(String),
}

impl OpKind {
    /// String identifier for the op kind.
    pub fn as_str(&self) -> &str {
        match self {
            OpKind::Identity => "identity",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Scale => "scale",
            OpKind::Relu => "relu",
            OpKind::ReluGrad => "relu_grad",
            OpKind::MatMul => "matmul",
            OpKind::Transpose => "transpose",
            OpKind::ReduceSumRows => "reduce_sum_rows",
            OpKind::TopK => "topk",
            OpKind::BeamSearchTopK => "beam_search_topk",
            OpKind::ZeroPointErase => "zero_point_erase",
            OpKind::ZeroPointRestore => "zero_point_restore",
            OpKind::Yield => "yield",
            OpKind::Custom(name) => name,
        }
    }

    pub fn is_yield(&self) -> bool {
        matches!(self, OpKind::Yield)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OpKind {
    type Err = anyhow::Error;

    /// Unknown names parse as `Custom`.
    fn from_str(value: &str) -> Result<Self> {
        Ok(match value {
            "identity" => OpKind::Identity,
            "add" => OpKind::Add,
            "sub" => OpKind::Sub,
            "mul" => OpKind::Mul,
            "scale" => OpKind::Scale,
            "relu" => OpKind::Relu,
            "relu_grad" => OpKind::ReluGrad,
            "matmul" => OpKind::MatMul,
            "transpose" => OpKind::Transpose,
            "reduce_sum_rows" => OpKind::ReduceSumRows,
            "topk" => OpKind::TopK,
            "beam_search_topk" => OpKind::BeamSearchTopK,
            "zero_point_erase" => OpKind::ZeroPointErase,
            "zero_point_restore" => OpKind::ZeroPointRestore,
            "yield" => OpKind::Yield,
            "" => return Err(anyhow!("empty op name")),
            other => OpKind::Custom(other.to_string()),
        })
    }
}

/// Declared metadata of a graph value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    pub dtype: Option<DType>,
    /// Declared shape; a `0` dim matches any extent.
    pub shape: Option<Vec<usize>>,
}

/// A graph node with index, identity and value bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub index: usize,
    pub uuid: Uuid,
    pub name: String,
    pub op: OpKind,
    pub attrs: OpAttrs,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

/// Compiled graph: values, initializers and topologically ordered nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    values: Vec<ValueInfo>,
    names: HashMap<String, ValueId>,
    nodes: Vec<Node>,
    inputs: Vec<ValueId>,
    outputs: Vec<ValueId>,
    initializers: HashMap<ValueId, Arc<TensorValue>>,
    producers: Vec<Option<usize>>,
    consumers: Vec<Vec<usize>>,
}

impl Graph {
    /// Create an empty graph.
    ///
    /// # Example
    /// ```no_run
    /// # use partialrun::{DType, Graph, OpAttrs, OpKind};
    /// # fn main() -> anyhow::Result<()> {
    /// let mut g = Graph::new();
    /// g.add_input("x", Some(DType::F32), Some(vec![0, 4]))?;
    /// g.add_node("relu_0", OpKind::Relu, OpAttrs::none(), &["x"], &["y"])?;
    /// g.mark_output("y")?;
    /// # Ok(()) }
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    fn declare(
        &mut self,
        name: &str,
        dtype: Option<DType>,
        shape: Option<Vec<usize>>,
    ) -> Result<ValueId> {
        if self.names.contains_key(name) {
            return Err(anyhow!("value {} already defined", name));
        }
        let id = self.values.len();
        self.values.push(ValueInfo {
            name: name.to_string(),
            dtype,
            shape,
        });
        self.names.insert(name.to_string(), id);
        self.producers.push(None);
        self.consumers.push(Vec::new());
        Ok(id)
    }

    /// Declare a graph input fed by the caller.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        dtype: Option<DType>,
        shape: Option<Vec<usize>>,
    ) -> Result<ValueId> {
        let name = name.into();
        let id = self.declare(&name, dtype, shape)?;
        self.inputs.push(id);
        Ok(id)
    }

    /// Declare a constant value available to every run.
    pub fn add_initializer(
        &mut self,
        name: impl Into<String>,
        value: TensorValue,
    ) -> Result<ValueId> {
        let name = name.into();
        let id = self.declare(&name, Some(value.dtype()), Some(value.shape().to_vec()))?;
        self.initializers.insert(id, Arc::new(value));
        Ok(id)
    }

    /// Append a node. Inputs must already be defined; outputs must be new.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        op: OpKind,
        attrs: OpAttrs,
        inputs: &[&str],
        outputs: &[&str],
    ) -> Result<usize> {
        let name = name.into();
        let index = self.nodes.len();
        let input_ids = inputs
            .iter()
            .map(|input| {
                self.value_id(input)
                    .ok_or_else(|| anyhow!("node {} reads undefined value {}", name, input))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut output_ids = Vec::with_capacity(outputs.len());
        for output in outputs {
            let id = self.declare(output, None, None)?;
            self.producers[id] = Some(index);
            output_ids.push(id);
        }
        for id in &input_ids {
            if !self.consumers[*id].contains(&index) {
                self.consumers[*id].push(index);
            }
        }
        self.nodes.push(Node {
            index,
            uuid: Uuid::new_v4(),
            name,
            op,
            attrs,
            inputs: input_ids,
            outputs: output_ids,
        });
        Ok(index)
    }

    /// Declare dtype/shape of a value produced by a node.
    pub fn annotate(
        &mut self,
        name: &str,
        dtype: Option<DType>,
        shape: Option<Vec<usize>>,
    ) -> Result<()> {
        let id = self
            .value_id(name)
            .ok_or_else(|| anyhow!("unknown value {}", name))?;
        let info = &mut self.values[id];
        info.dtype = dtype;
        info.shape = shape;
        Ok(())
    }

    /// Mark a value as a graph output; outputs outlive every partial run.
    pub fn mark_output(&mut self, name: &str) -> Result<()> {
        let id = self
            .value_id(name)
            .ok_or_else(|| anyhow!("unknown output {}", name))?;
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    pub fn value_id(&self, name: &str) -> Option<ValueId> {
        self.names.get(name).copied()
    }

    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id]
    }

    pub fn value_name(&self, id: ValueId) -> &str {
        &self.values[id].name
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Total node count, the end program counter of a full run.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn is_output(&self, id: ValueId) -> bool {
        self.outputs.contains(&id)
    }

    pub fn initializer(&self, id: ValueId) -> Option<&Arc<TensorValue>> {
        self.initializers.get(&id)
    }

    pub fn is_initializer(&self, id: ValueId) -> bool {
        self.initializers.contains_key(&id)
    }

    /// Index of the node producing `id`, if any.
    pub fn producer(&self, id: ValueId) -> Option<usize> {
        self.producers[id]
    }

    /// Indices of the nodes reading `id`, ascending.
    pub fn consumers(&self, id: ValueId) -> &[usize] {
        &self.consumers[id]
    }

    /// True if some node at index `>= boundary` reads `id`.
    pub fn consumed_at_or_after(&self, id: ValueId, boundary: usize) -> bool {
        self.consumers(id).iter().any(|index| *index >= boundary)
    }

    /// Indices of all yield nodes, ascending.
    pub fn yield_nodes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|node| node.op.is_yield())
            .map(|node| node.index)
            .collect()
    }
}
