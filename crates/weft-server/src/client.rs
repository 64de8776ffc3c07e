//! Synchronous façade over a configured backend.

use weft::{Boxed, Error, Node, TransportError};

use crate::config::{Backend, ServerConfig};
use crate::embedded::EmbeddedServer;
use crate::net::NetServer;
use crate::server::{ExecuteOptions, Server};
use crate::worker::WorkerServer;

/// Forces nodes through a started [`Server`]. Identical graphs give
/// identical results whichever backend is behind it.
///
/// The server is shut down when the client is dropped.
pub struct Client {
    server: Box<dyn Server>,
    options: ExecuteOptions,
}

impl Client {
    /// Start `server` and wrap it.
    pub fn new(mut server: Box<dyn Server>) -> Result<Self, Error> {
        server.start()?;
        Ok(Self {
            server,
            options: ExecuteOptions::default(),
        })
    }

    pub fn embedded() -> Result<Self, Error> {
        Self::from_config(&ServerConfig::embedded())
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, Error> {
        let storage = config.storage.context();
        log::debug!("starting {} backend", config.backend);
        let server: Box<dyn Server> = match config.backend {
            Backend::Embedded => Box::new(EmbeddedServer::new(storage)),
            Backend::Worker => Box::new(WorkerServer::new(config.worker.clone(), storage)),
            Backend::Net => Box::new(NetServer::new(config.net.clone())),
        };
        Self::new(server)
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.options.no_cache = no_cache;
        self
    }

    pub fn use_node(&mut self, node: &Node) -> Result<Boxed, Error> {
        self.use_nodes(std::slice::from_ref(node))?
            .pop()
            .ok_or_else(|| TransportError::Malformed("no result for node".into()).into())
    }

    pub fn use_nodes(&mut self, nodes: &[Node]) -> Result<Vec<Boxed>, Error> {
        self.use_nodes_with(nodes, self.options)
    }

    pub fn use_nodes_with(
        &mut self,
        nodes: &[Node],
        options: ExecuteOptions,
    ) -> Result<Vec<Boxed>, Error> {
        self.server.execute(nodes, options)
    }

    pub fn server(&self) -> &dyn Server {
        self.server.as_ref()
    }

    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.server.shutdown()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(e) = self.server.shutdown() {
            log::warn!("server shutdown failed: {e}");
        }
    }
}
