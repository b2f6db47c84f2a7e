mod json;
mod node;
mod types;

pub use json::{GraphDeserialize, GraphSerialize};
pub use node::describe_node;
pub use types::{AttrValue, Graph, Node, OpAttr, OpAttrs, OpKind, ValueId, ValueInfo};
