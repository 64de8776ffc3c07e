//! Lazy computation graph.
//!
//! Nodes are immutable and cheap to clone. Output nodes are interned by
//! `(op, inputs)` so building the same call twice yields the same node and
//! the graph stays a DAG.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::boxed::Boxed;
use crate::error::TypeError;
use crate::ops::{OpDef, OpRegistry, tag_getter};
use crate::types::{Type, non_none, type_of, value_fits};
use crate::value::Value;

/// Prefix of generated tag-getter op names: `get-tag:<tag name>`.
pub const TAG_GETTER_PREFIX: &str = "get-tag:";

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    fn fresh() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

pub type Inputs = SmallVec<[Node; 4]>;

#[derive(Debug)]
pub enum NodeKind {
    Const(Boxed),
    Output { op: Arc<OpDef>, inputs: Inputs },
}

#[derive(Debug)]
struct NodeData {
    id: NodeId,
    ty: Type,
    kind: NodeKind,
}

/// Handle to an immutable graph node. Equality and hashing follow node
/// identity, not structure.
#[derive(Clone, Debug)]
pub struct Node(Arc<NodeData>);

impl Node {
    fn make(ty: Type, kind: NodeKind) -> Self {
        Node(Arc::new(NodeData {
            id: NodeId::fresh(),
            ty,
            kind,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.0.id
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }

    pub fn kind(&self) -> &NodeKind {
        &self.0.kind
    }

    pub fn op(&self) -> Option<&Arc<OpDef>> {
        match &self.0.kind {
            NodeKind::Output { op, .. } => Some(op),
            NodeKind::Const(_) => None,
        }
    }

    pub fn inputs(&self) -> &[Node] {
        match &self.0.kind {
            NodeKind::Output { inputs, .. } => inputs,
            NodeKind::Const(_) => &[],
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

type InternKey = (Arc<str>, SmallVec<[NodeId; 4]>);

/// Graph builder: type-checks calls against an op registry and interns
/// output nodes.
#[derive(Debug)]
pub struct Graph {
    registry: Arc<OpRegistry>,
    interned: FxHashMap<InternKey, Node>,
    tag_getters: FxHashMap<(Arc<str>, Type), Arc<OpDef>>,
}

impl Graph {
    pub fn new(registry: Arc<OpRegistry>) -> Self {
        Self {
            registry,
            interned: FxHashMap::default(),
            tag_getters: FxHashMap::default(),
        }
    }

    pub fn with_builtins() -> Self {
        Self::new(Arc::new(OpRegistry::with_builtins()))
    }

    pub fn registry(&self) -> &Arc<OpRegistry> {
        &self.registry
    }

    /// Number of distinct output nodes built so far.
    pub fn len(&self) -> usize {
        self.interned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interned.is_empty()
    }

    /// Constant typed by its value.
    pub fn constant(&mut self, value: impl Into<Value>) -> Node {
        let value = value.into();
        Node::make(type_of(&value), NodeKind::Const(Boxed::new(value)))
    }

    /// Constant of a boxed value. Tags on the box are reflected in the node's
    /// type as a tagged value.
    pub fn boxed_constant(&mut self, boxed: Boxed) -> Result<Node, TypeError> {
        let ty = if boxed.is_tagged() {
            Type::tagged(type_of(&boxed.tags_as_value()), type_of(boxed.value()))?
        } else {
            type_of(boxed.value())
        };
        Ok(Node::make(ty, NodeKind::Const(boxed)))
    }

    /// Constant with a declared type the value must fit.
    pub fn typed_constant(&mut self, ty: Type, boxed: Boxed) -> Result<Node, TypeError> {
        if !value_fits(boxed.value(), &ty) {
            return Err(TypeError::ConstMismatch {
                declared: ty,
                literal: type_of(boxed.value()),
            });
        }
        Ok(Node::make(ty, NodeKind::Const(boxed)))
    }

    /// Call `name` on `inputs`, resolving overloads against the input types.
    pub fn call(&mut self, name: &str, inputs: &[Node]) -> Result<Node, TypeError> {
        let types: Vec<Type> = inputs.iter().map(|n| n.ty().clone()).collect();
        let dispatch = self.registry.dispatch(name, &types)?;
        let ty = dispatch.op.call_type(&types, dispatch.matched)?;
        Ok(self.intern(dispatch.op, inputs.iter().cloned().collect(), ty))
    }

    /// Read tag `tag_name` off `node`. The tag must be part of the node's
    /// tag shape; the result is `None` wherever the runtime value is untagged.
    pub fn tag(&mut self, node: &Node, tag_name: &str) -> Result<Node, TypeError> {
        let op = self.tag_getter_for(tag_name, node.ty())?;
        let types = [node.ty().clone()];
        let matched = op
            .match_inputs(&types)
            .ok_or_else(|| TypeError::NoMatchingOverload {
                op: op.name().to_string(),
                inputs: types.to_vec(),
            })?;
        let ty = op.call_type(&types, matched)?;
        let mut inputs = Inputs::new();
        inputs.push(node.clone());
        Ok(self.intern(op, inputs, ty))
    }

    fn tag_getter_for(&mut self, tag_name: &str, input: &Type) -> Result<Arc<OpDef>, TypeError> {
        let op_name = format!("{TAG_GETTER_PREFIX}{tag_name}");
        let tag_type = match non_none(input).tag_shape() {
            Some(Type::TypedDict { props }) => props.get(tag_name).cloned(),
            _ => None,
        }
        .ok_or_else(|| TypeError::NoMatchingOverload {
            op: op_name.clone(),
            inputs: vec![input.clone()],
        })?;
        let key = (Arc::from(tag_name), tag_type.clone());
        if let Some(op) = self.tag_getters.get(&key) {
            return Ok(op.clone());
        }
        let op = Arc::new(tag_getter(tag_name, tag_type, &op_name)?);
        self.tag_getters.insert(key, op.clone());
        Ok(op)
    }

    /// Output node with an already-known type, as read back from the wire.
    /// Generated tag getters are rebuilt from their input's tag shape.
    pub fn output(&mut self, name: &str, inputs: Inputs, ty: Type) -> Result<Node, TypeError> {
        let op = match name.strip_prefix(TAG_GETTER_PREFIX) {
            Some(tag_name) => {
                let input = inputs.first().map(|n| n.ty().clone()).unwrap_or(Type::None);
                self.tag_getter_for(tag_name, &input)?
            }
            None => self
                .registry
                .get(name)
                .cloned()
                .ok_or_else(|| TypeError::UnknownOp(name.to_string()))?,
        };
        if op.inputs().len() != inputs.len() {
            return Err(TypeError::Arity {
                op: name.to_string(),
                expected: op.inputs().len(),
                found: inputs.len(),
            });
        }
        Ok(self.intern(op, inputs, ty))
    }

    fn intern(&mut self, op: Arc<OpDef>, inputs: Inputs, ty: Type) -> Node {
        let key: InternKey = (Arc::from(op.name()), inputs.iter().map(Node::id).collect());
        self.interned
            .entry(key)
            .or_insert_with(|| Node::make(ty, NodeKind::Output { op, inputs }))
            .clone()
    }

    /// Replace the canonical entry for `node`'s call with one carrying `ty`.
    /// Later calls with the same op and inputs return the replacement.
    pub fn replace_type(&mut self, node: &Node, ty: Type) -> Node {
        match node.kind() {
            NodeKind::Const(boxed) => Node::make(ty, NodeKind::Const(boxed.clone())),
            NodeKind::Output { op, inputs } => {
                let key: InternKey = (Arc::from(op.name()), inputs.iter().map(Node::id).collect());
                let replacement = Node::make(
                    ty,
                    NodeKind::Output {
                        op: op.clone(),
                        inputs: inputs.clone(),
                    },
                );
                self.interned.insert(key, replacement.clone());
                replacement
            }
        }
    }
}

/// Post-order walk from the roots: every node appears once, after its inputs.
/// `revisit` sees each later arrival at an already visited node.
pub fn topological_order(roots: &[Node], mut revisit: impl FnMut(&Node)) -> Vec<Node> {
    let mut order = Vec::new();
    let mut seen = FxHashSet::default();
    let mut stack: Vec<(Node, bool)> = roots.iter().rev().map(|n| (n.clone(), false)).collect();
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !seen.insert(node.id()) {
            revisit(&node);
            continue;
        }
        let inputs: Vec<Node> = node.inputs().iter().rev().cloned().collect();
        stack.push((node, true));
        stack.extend(inputs.into_iter().map(|input| (input, false)));
    }
    order
}
