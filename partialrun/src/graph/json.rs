use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tensor::TensorValue;

use super::{Graph, OpAttrs, OpKind, ValueInfo};

#[derive(Serialize, Deserialize)]
struct NodeDoc {
    name: String,
    op: OpKind,
    #[serde(default)]
    attrs: OpAttrs,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct InitializerDoc {
    name: String,
    value: TensorValue,
}

/// Name-keyed form of a graph; value ids and node uuids are rebuilt on load.
#[derive(Serialize, Deserialize)]
struct GraphDoc {
    inputs: Vec<ValueInfo>,
    #[serde(default)]
    initializers: Vec<InitializerDoc>,
    nodes: Vec<NodeDoc>,
    /// Declared metadata of node outputs.
    #[serde(default)]
    annotations: Vec<ValueInfo>,
    outputs: Vec<String>,
}

pub struct GraphSerialize;

impl GraphSerialize {
    pub fn json(graph: &Graph) -> Result<Value> {
        let names = |ids: &[usize]| {
            ids.iter()
                .map(|id| graph.value_name(*id).to_string())
                .collect::<Vec<_>>()
        };
        let mut initializers = (0..graph.value_count())
            .filter_map(|id| {
                graph.initializer(id).map(|value| InitializerDoc {
                    name: graph.value_name(id).to_string(),
                    value: value.as_ref().clone(),
                })
            })
            .collect::<Vec<_>>();
        initializers.sort_by(|a, b| a.name.cmp(&b.name));
        let annotations = graph
            .nodes()
            .iter()
            .flat_map(|node| node.outputs.iter())
            .map(|id| graph.value(*id))
            .filter(|info| info.dtype.is_some() || info.shape.is_some())
            .cloned()
            .collect();
        let doc = GraphDoc {
            inputs: graph.inputs().iter().map(|id| graph.value(*id).clone()).collect(),
            initializers,
            nodes: graph
                .nodes()
                .iter()
                .map(|node| NodeDoc {
                    name: node.name.clone(),
                    op: node.op.clone(),
                    attrs: node.attrs.clone(),
                    inputs: names(&node.inputs),
                    outputs: names(&node.outputs),
                })
                .collect(),
            annotations,
            outputs: names(graph.outputs()),
        };
        Ok(serde_json::to_value(doc)?)
    }
}

pub struct GraphDeserialize;

impl GraphDeserialize {
    pub fn from_json(value: Value) -> Result<Graph> {
        let doc: GraphDoc = serde_json::from_value(value)?;
        let mut graph = Graph::new();
        for input in doc.inputs {
            graph.add_input(input.name, input.dtype, input.shape)?;
        }
        for init in doc.initializers {
            graph.add_initializer(init.name, init.value)?;
        }
        for node in doc.nodes {
            let inputs = node.inputs.iter().map(String::as_str).collect::<Vec<_>>();
            let outputs = node.outputs.iter().map(String::as_str).collect::<Vec<_>>();
            graph.add_node(node.name, node.op, node.attrs, &inputs, &outputs)?;
        }
        for info in doc.annotations {
            let produced = graph.value_id(&info.name).and_then(|id| graph.producer(id));
            if produced.is_none() {
                return Err(anyhow!("annotation for {} which no node produces", info.name));
            }
            graph.annotate(&info.name, info.dtype, info.shape)?;
        }
        for output in &doc.outputs {
            graph.mark_output(output)?;
        }
        Ok(graph)
    }
}
