//! Server half of a serialized round trip, shared by the worker process and
//! the network service.

use std::sync::Arc;

use weft::mapper::MapperContext;
use weft::wire::{WireGraph, encode_results};
use weft::{
    Engine, Error, ExecuteContext, Graph, MapperFactory, OpRegistry, StorageContext, Type,
};

use crate::protocol::{Command, Request, Response};

/// Decodes wire graphs, runs them on one engine and encodes the results.
///
/// The engine's result cache is shared by every request the handler serves,
/// so concurrent requests may race to fill the same key; any writer's value
/// is correct.
#[derive(Debug)]
pub struct Handler {
    engine: Engine,
    registry: Arc<OpRegistry>,
    storage: Option<StorageContext>,
    mappers: MapperFactory,
}

impl Handler {
    pub fn new(storage: Option<StorageContext>) -> Self {
        Self::with_registry(Arc::new(OpRegistry::with_builtins()), storage)
    }

    pub fn with_registry(registry: Arc<OpRegistry>, storage: Option<StorageContext>) -> Self {
        Self {
            engine: Engine::new(),
            registry,
            storage,
            mappers: MapperFactory::new(MapperContext::transport()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn execute(
        &self,
        graph: &WireGraph,
        no_cache: bool,
    ) -> Result<Vec<serde_json::Value>, Error> {
        let mut nodes = Graph::new(self.registry.clone());
        let roots = graph.decode(&mut nodes, &self.mappers)?;
        let mut ctx = ExecuteContext::new().with_no_cache(no_cache);
        ctx.storage = self.storage.clone();

        let results = self.engine.execute(&roots, &ctx)?;
        let types: Vec<Type> = roots.iter().map(|root| root.ty().clone()).collect();
        encode_results(&results, &types, &self.mappers)
    }

    /// Answer an execute request. Shutdown is a transport concern and is
    /// acknowledged with an empty result list.
    pub fn handle(&self, request: &Request) -> Response {
        match &request.command {
            Command::Execute { graph, no_cache } => match self.execute(graph, *no_cache) {
                Ok(results) => Response::ok(request.id, results),
                Err(e) => {
                    log::info!("request {} failed: {e}", request.id);
                    Response::failure(request.id, &e)
                }
            },
            Command::Shutdown => Response::ok(request.id, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{STATUS_BAD_REQUEST, STATUS_INTERNAL, STATUS_OK};
    use serde_json::json;
    use weft::ErrorKind;

    fn execute_request(graph: serde_json::Value) -> Request {
        serde_json::from_value(json!({
            "id": 1,
            "command": {"type": "execute", "graph": graph},
        }))
        .unwrap()
    }

    #[test]
    fn executes_wire_graphs() {
        let request = execute_request(json!({
            "nodes": [
                {"nodeType": "const", "type": {"kind": "int"}, "val": 9},
                {"nodeType": "const", "type": {"kind": "int"}, "val": 3},
                {"nodeType": "output", "type": {"kind": "int"},
                 "fromOp": {"name": "number-add", "inputs": [0, 1]}},
            ],
            "roots": [2],
        }));
        let response = Handler::new(None).handle(&request);
        assert_eq!(response.status, STATUS_OK);
        assert_eq!(response.results, Some(vec![json!(12)]));
    }

    #[test]
    fn operation_failures_keep_their_op() {
        let request = execute_request(json!({
            "nodes": [
                {"nodeType": "const", "type": {"kind": "string"}, "val": "abcd"},
                {"nodeType": "output", "type": {"kind": "any"},
                 "fromOp": {"name": "json-parse", "inputs": [0]}},
            ],
            "roots": [1],
        }));
        let response = Handler::new(None).handle(&request);
        assert_eq!(response.status, STATUS_INTERNAL);
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Operation);
        assert_eq!(error.op.as_deref(), Some("json-parse"));
    }

    #[test]
    fn forward_references_are_bad_requests() {
        let request = execute_request(json!({
            "nodes": [
                {"nodeType": "output", "type": {"kind": "int"},
                 "fromOp": {"name": "number-add", "inputs": [1, 1]}},
                {"nodeType": "const", "type": {"kind": "int"}, "val": 1},
            ],
            "roots": [0],
        }));
        let response = Handler::new(None).handle(&request);
        assert_eq!(response.status, STATUS_BAD_REQUEST);
        assert_eq!(response.error.unwrap().kind, ErrorKind::Malformed);
    }

    #[test]
    fn repeated_requests_hit_the_shared_cache() {
        let handler = Handler::new(None);
        let request = execute_request(json!({
            "nodes": [
                {"nodeType": "const", "type": {"kind": "string"}, "val": "[1, 2]"},
                {"nodeType": "output", "type": {"kind": "any"},
                 "fromOp": {"name": "json-parse", "inputs": [0]}},
            ],
            "roots": [1],
        }));
        handler.handle(&request);
        handler.handle(&request);
        assert_eq!(handler.engine().cache().len(), 1);
    }
}
