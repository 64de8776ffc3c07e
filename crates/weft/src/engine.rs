//! Graph execution.
//!
//! Nodes are evaluated once each, in dependency order. Pure ops consult the
//! shared [`ResultCache`] keyed by realized input values; impure ops and
//! no-cache executions always run. Operation failures propagate to the
//! caller unchanged and are never cached.

use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::boxed::Boxed;
use crate::cache::{CacheKey, CachedResult, ResultCache};
use crate::error::{Error, OperationError};
use crate::graph::{Graph, Node, NodeId, NodeKind, topological_order};
use crate::ops::{self, InputMatch, OpContext, OpDef};
use crate::stats::ExecuteStats;
use crate::storage::StorageContext;
use crate::types::Type;
use crate::value::Value;

/// Per-request execution options.
#[derive(Clone, Debug, Default)]
pub struct ExecuteContext {
    /// Re-run every op, bypassing the result cache for reads and writes.
    pub no_cache: bool,
    pub storage: Option<StorageContext>,
}

impl ExecuteContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    pub fn with_storage(mut self, storage: StorageContext) -> Self {
        self.storage = Some(storage);
        self
    }

    fn op_context(&self) -> OpContext<'_> {
        OpContext::new(self.storage.as_ref())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Engine {
    cache: Arc<ResultCache>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine sharing an existing result cache.
    pub fn with_cache(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Evaluate `nodes`, returning one result per node in the same order.
    pub fn execute(&self, nodes: &[Node], ctx: &ExecuteContext) -> Result<Vec<Boxed>, Error> {
        let (results, stats) = self.execute_with_stats(nodes, ctx)?;
        if !stats.is_empty() {
            log::info!("execution summary\n{stats}");
        }
        Ok(results)
    }

    pub fn execute_with_stats(
        &self,
        nodes: &[Node],
        ctx: &ExecuteContext,
    ) -> Result<(Vec<Boxed>, ExecuteStats), Error> {
        let mut stats = ExecuteStats::new();
        let order = topological_order(nodes, |node| {
            if let Some(op) = node.op() {
                stats.record_already_executed(op.name());
            }
        });
        log::debug!("executing {} nodes for {} roots", order.len(), nodes.len());

        let mut results: FxHashMap<NodeId, Boxed> = FxHashMap::default();
        for node in &order {
            let result = match node.kind() {
                NodeKind::Const(boxed) => boxed.clone(),
                NodeKind::Output { op, inputs } => {
                    let values = inputs
                        .iter()
                        .map(|input| evaluated(&results, input))
                        .collect::<Result<Vec<_>, _>>()?;
                    self.run_op(op, &values, ctx, &mut stats)?
                }
            };
            results.insert(node.id(), result);
        }

        let outputs = nodes
            .iter()
            .map(|node| evaluated(&results, node))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((outputs, stats))
    }

    fn run_op(
        &self,
        op: &Arc<OpDef>,
        inputs: &[Boxed],
        ctx: &ExecuteContext,
        stats: &mut ExecuteStats,
    ) -> Result<Boxed, Error> {
        if short_circuits(op, inputs) {
            log::debug!("{} received None, yielding None", op.name());
            return Ok(Boxed::none());
        }

        let key = if op.is_pure() && !ctx.no_cache {
            CacheKey::new(op.name(), inputs)
        } else {
            None
        };

        let cached = key.and_then(|key| self.cache.get(&key));
        let mut output = match cached {
            Some(hit) => {
                log::debug!("cache hit for {}", op.name());
                stats.record_cache_hit(op.name());
                hit.to_boxed()
            }
            None => {
                log::debug!("running {}", op.name());
                let started = Instant::now();
                let output = op.invoke(&ctx.op_context(), inputs).map_err(|e| {
                    log::info!("op {} failed: {e}", op.name());
                    OperationError {
                        op: op.name().to_string(),
                        message: e.to_string(),
                    }
                })?;
                stats.record_run(op.name(), started.elapsed());
                if let Some(key) = key {
                    if !output.is_none() {
                        self.cache.insert(
                            key,
                            CachedResult {
                                value: output.value().clone(),
                                tags: output.tags().clone(),
                            },
                        );
                    }
                }
                output
            }
        };

        if op.tag_flow() && !output.is_none() {
            if let Some(first) = inputs.first() {
                output.inherit_tags(first.tags());
            }
        }
        Ok(output)
    }

    /// Evaluate `node`'s inputs, compute its op's refined output type, and make
    /// the refined node canonical in `graph`.
    pub fn refine(&self, graph: &mut Graph, node: &Node, ctx: &ExecuteContext) -> Result<Node, Error> {
        let Some(op) = node.op() else {
            return Ok(node.clone());
        };
        let inputs = self.execute(node.inputs(), ctx)?;
        if short_circuits(op, &inputs) {
            return Ok(node.clone());
        }
        let types: Vec<Type> = node.inputs().iter().map(|n| n.ty().clone()).collect();
        let values: Vec<Value> = inputs.into_iter().map(Boxed::into_value).collect();
        let refined = ops::refine(op, &ctx.op_context(), &types, &values).map_err(|e| {
            OperationError {
                op: op.name().to_string(),
                message: e.to_string(),
            }
        })?;
        let matched = op.match_inputs(&types).unwrap_or(InputMatch::Exact);
        let ty = op.wrap_output(&types, matched, refined)?;
        log::debug!("refined {} from {} to {ty}", op.name(), node.ty());
        Ok(graph.replace_type(node, ty))
    }
}

/// A `None` input at a position the op does not accept it.
fn short_circuits(op: &OpDef, inputs: &[Boxed]) -> bool {
    inputs
        .iter()
        .enumerate()
        .any(|(i, value)| value.is_none() && !op.accepts_none(i))
}

fn evaluated(results: &FxHashMap<NodeId, Boxed>, node: &Node) -> Result<Boxed, Error> {
    results.get(&node.id()).cloned().ok_or_else(|| {
        Error::Operation(OperationError {
            op: node.op().map(|op| op.name().to_string()).unwrap_or_default(),
            message: format!("node {} was not evaluated", node.id()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::optional;

    #[test]
    fn adds_constants() {
        let mut graph = Graph::with_builtins();
        let nine = graph.constant(9.0);
        let three = graph.constant(3.0);
        let sum = graph.call("add", &[nine, three]).unwrap();
        let out = Engine::new().execute(&[sum], &ExecuteContext::new()).unwrap();
        assert_eq!(out, [Value::number(12.0)]);
    }

    #[test]
    fn shared_nodes_run_once_per_execution() {
        let mut graph = Graph::with_builtins();
        let one = graph.constant(1.0);
        let two = graph.call("add", &[one.clone(), one]).unwrap();
        let four = graph.call("add", &[two.clone(), two.clone()]).unwrap();
        let (out, stats) = Engine::new()
            .execute_with_stats(&[four, two], &ExecuteContext::new().with_no_cache(true))
            .unwrap();
        assert_eq!(out, [Value::number(4.0), Value::number(2.0)]);
        let add = stats.op("number-add").unwrap();
        assert_eq!(add.count, 2);
        assert!(add.already_executed >= 1);
    }

    #[test]
    fn none_inputs_short_circuit_nullable_calls() {
        let mut graph = Graph::with_builtins();
        let maybe = graph
            .typed_constant(optional(Type::Int), Boxed::none())
            .unwrap();
        let one = graph.constant(1.0);
        let sum = graph.call("add", &[maybe, one]).unwrap();
        assert_eq!(sum.ty(), &optional(Type::Int));
        let out = Engine::new().execute(&[sum], &ExecuteContext::new()).unwrap();
        assert_eq!(out, [Value::None]);
        assert!(!out[0].is_tagged());
    }

    #[test]
    fn failures_carry_the_op_name_and_are_not_cached() {
        let mut graph = Graph::with_builtins();
        let one = graph.constant(1.0);
        let zero = graph.constant(0.0);
        let div = graph.call("div", &[one, zero]).unwrap();
        let engine = Engine::new();
        let err = engine.execute(&[div], &ExecuteContext::new()).unwrap_err();
        assert!(err.is_operation_failure());
        match err {
            Error::Operation(e) => {
                assert_eq!(e.op, "number-div");
                assert_eq!(e.message, "division by zero");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn refine_replaces_declared_types() {
        let mut graph = Graph::with_builtins();
        let text = graph.constant(r#"{"a": [1, 2]}"#);
        let parsed = graph.call("parse", &[text]).unwrap();
        let refined = Engine::new()
            .refine(&mut graph, &parsed, &ExecuteContext::new())
            .unwrap();
        assert_eq!(
            refined.ty(),
            &Type::typed_dict([("a", Type::list(Type::Int))]).unwrap()
        );
        let key = graph.constant("a");
        let picked = graph.call("pick", &[refined, key]).unwrap();
        assert_eq!(picked.ty(), &optional(Type::Any));
    }
}
