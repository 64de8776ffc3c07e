//! The contract every backend implements.

use weft::mapper::MapperContext;
use weft::wire::{WireGraph, decode_results};
use weft::{Boxed, Error, MapperFactory, Node, TransportError, Type};

use crate::protocol::{Command, Request, Response};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Re-run every op, bypassing the result cache.
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Serving,
    ShutDown,
}

/// Executes graphs on behalf of a [`Client`](crate::Client).
///
/// `start` moves a server from created to serving; `shutdown` is terminal.
/// `execute` is only valid while serving and otherwise fails with
/// [`TransportError::NotServing`].
pub trait Server: Send {
    fn start(&mut self) -> Result<(), Error>;

    fn execute(&mut self, nodes: &[Node], options: ExecuteOptions) -> Result<Vec<Boxed>, Error>;

    fn shutdown(&mut self) -> Result<(), Error>;

    fn state(&self) -> ServerState;
}

/// Lifecycle bookkeeping shared by the backends.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ServerState,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: ServerState::Created,
        }
    }

    pub(crate) fn state(&self) -> ServerState {
        self.state
    }

    /// Whether `start` has work to do. Restarting a shut-down server fails.
    pub(crate) fn should_start(&self) -> Result<bool, TransportError> {
        match self.state {
            ServerState::Created => Ok(true),
            ServerState::Serving => Ok(false),
            ServerState::ShutDown => Err(TransportError::NotServing),
        }
    }

    pub(crate) fn ensure_serving(&self) -> Result<(), TransportError> {
        match self.state {
            ServerState::Serving => Ok(()),
            _ => Err(TransportError::NotServing),
        }
    }

    pub(crate) fn serving(&mut self) {
        self.state = ServerState::Serving;
    }

    pub(crate) fn shut_down(&mut self) {
        self.state = ServerState::ShutDown;
    }
}

/// Client half of a serialized round trip: encodes requests and decodes
/// responses against the types of the requested roots.
#[derive(Debug)]
pub(crate) struct RemoteCodec {
    mappers: MapperFactory,
    next_id: u64,
}

impl RemoteCodec {
    pub(crate) fn new() -> Self {
        Self {
            mappers: MapperFactory::new(MapperContext::transport()),
            next_id: 1,
        }
    }

    pub(crate) fn request(
        &mut self,
        nodes: &[Node],
        options: ExecuteOptions,
    ) -> Result<(Request, Vec<Type>), Error> {
        let graph = WireGraph::encode(nodes, &self.mappers)?;
        let types = nodes.iter().map(|node| node.ty().clone()).collect();
        let request = Request {
            id: self.take_id(),
            command: Command::Execute {
                graph,
                no_cache: options.no_cache,
            },
        };
        Ok((request, types))
    }

    pub(crate) fn shutdown_request(&mut self) -> Request {
        Request {
            id: self.take_id(),
            command: Command::Shutdown,
        }
    }

    pub(crate) fn results(&self, response: Response, types: &[Type]) -> Result<Vec<Boxed>, Error> {
        let encoded = response.into_results()?;
        decode_results(&encoded, types, &self.mappers)
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
