//! Serialized form of graphs and results crossing a process or network
//! boundary.
//!
//! A graph travels as a flat node list in dependency order. Output nodes name
//! their inputs by index into that list, so shared nodes are written once and
//! stay shared after decoding. Const values and results are written with the
//! mapper of their type.

use serde::{Deserialize, Serialize};

use crate::boxed::Boxed;
use crate::error::{Error, TransportError};
use crate::graph::{Graph, Inputs, Node, NodeKind, topological_order};
use crate::mapper::MapperFactory;
use crate::types::Type;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "nodeType", rename_all = "camelCase")]
pub enum WireNode {
    Const {
        #[serde(rename = "type")]
        ty: Type,
        val: serde_json::Value,
    },
    Output {
        #[serde(rename = "type")]
        ty: Type,
        #[serde(rename = "fromOp")]
        from_op: WireOp,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireOp {
    pub name: String,
    pub inputs: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireGraph {
    pub nodes: Vec<WireNode>,
    pub roots: Vec<usize>,
}

fn malformed(message: impl Into<String>) -> Error {
    Error::Transport(TransportError::Malformed(message.into()))
}

impl WireGraph {
    pub fn encode(roots: &[Node], mappers: &MapperFactory) -> Result<Self, Error> {
        let order = topological_order(roots, |_| {});
        let index: rustc_hash::FxHashMap<_, usize> = order
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id(), i))
            .collect();
        let position = |node: &Node| {
            index
                .get(&node.id())
                .copied()
                .ok_or_else(|| malformed(format!("node {} missing from walk", node.id())))
        };

        let mut nodes = Vec::with_capacity(order.len());
        for node in &order {
            let wire = match node.kind() {
                NodeKind::Const(boxed) => WireNode::Const {
                    ty: node.ty().clone(),
                    val: mappers.mapper_for(node.ty())?.save_boxed(boxed)?,
                },
                NodeKind::Output { op, inputs } => WireNode::Output {
                    ty: node.ty().clone(),
                    from_op: WireOp {
                        name: op.name().to_string(),
                        inputs: inputs.iter().map(position).collect::<Result<_, _>>()?,
                    },
                },
            };
            nodes.push(wire);
        }
        let roots = roots.iter().map(position).collect::<Result<_, _>>()?;
        Ok(WireGraph { nodes, roots })
    }

    /// Rebuild the graph in `graph`, returning the root nodes. Inputs must
    /// refer to earlier entries.
    pub fn decode(&self, graph: &mut Graph, mappers: &MapperFactory) -> Result<Vec<Node>, Error> {
        let mut built: Vec<Node> = Vec::with_capacity(self.nodes.len());
        for (i, wire) in self.nodes.iter().enumerate() {
            let node = match wire {
                WireNode::Const { ty, val } => {
                    let boxed = mappers.mapper_for(ty)?.load_boxed(val)?;
                    graph.typed_constant(ty.clone(), boxed)?
                }
                WireNode::Output { ty, from_op } => {
                    let inputs = from_op
                        .inputs
                        .iter()
                        .map(|&input| {
                            built.get(input).cloned().ok_or_else(|| {
                                malformed(format!("node {i} refers to node {input} out of order"))
                            })
                        })
                        .collect::<Result<Inputs, _>>()?;
                    graph.output(&from_op.name, inputs, ty.clone())?
                }
            };
            built.push(node);
        }
        self.roots
            .iter()
            .map(|&root| {
                built
                    .get(root)
                    .cloned()
                    .ok_or_else(|| malformed(format!("root {root} out of range")))
            })
            .collect()
    }
}

/// Encode results, each with the mapper of its root node's type.
pub fn encode_results(
    results: &[Boxed],
    types: &[Type],
    mappers: &MapperFactory,
) -> Result<Vec<serde_json::Value>, Error> {
    if results.len() != types.len() {
        return Err(malformed(format!(
            "{} results for {} types",
            results.len(),
            types.len()
        )));
    }
    results
        .iter()
        .zip(types)
        .map(|(result, ty)| -> Result<_, Error> {
            Ok(mappers.mapper_for(ty)?.save_boxed(result)?)
        })
        .collect()
}

pub fn decode_results(
    encoded: &[serde_json::Value],
    types: &[Type],
    mappers: &MapperFactory,
) -> Result<Vec<Boxed>, Error> {
    if encoded.len() != types.len() {
        return Err(malformed(format!(
            "{} results for {} roots",
            encoded.len(),
            types.len()
        )));
    }
    encoded
        .iter()
        .zip(types)
        .map(|(value, ty)| -> Result<_, Error> {
            Ok(mappers.mapper_for(ty)?.load_boxed(value)?)
        })
        .collect()
}
