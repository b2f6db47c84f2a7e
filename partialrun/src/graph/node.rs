use super::{Graph, Node};

pub fn describe_node(graph: &Graph, node: &Node) -> String {
    let names = |ids: &[usize]| {
        ids.iter()
            .map(|id| graph.value_name(*id))
            .collect::<Vec<_>>()
            .join(",")
    };
    if node.op.is_yield() {
        return format!(
            "yield {} ({}) >> {}",
            node.name,
            names(&node.inputs),
            names(&node.outputs)
        );
    }
    format!(
        "op {} {}({}) >> {}",
        node.name,
        node.op,
        names(&node.inputs),
        names(&node.outputs)
    )
}
