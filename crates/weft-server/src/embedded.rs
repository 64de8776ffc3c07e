use weft::{Boxed, Engine, Error, ExecuteContext, Node, StorageContext};

use crate::server::{ExecuteOptions, Lifecycle, Server, ServerState};

/// Runs the engine inline on the caller's thread, with no serialization
/// boundary.
#[derive(Debug)]
pub struct EmbeddedServer {
    engine: Engine,
    storage: Option<StorageContext>,
    lifecycle: Lifecycle,
}

impl EmbeddedServer {
    pub fn new(storage: Option<StorageContext>) -> Self {
        Self::with_engine(Engine::new(), storage)
    }

    pub fn with_engine(engine: Engine, storage: Option<StorageContext>) -> Self {
        Self {
            engine,
            storage,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl Server for EmbeddedServer {
    fn start(&mut self) -> Result<(), Error> {
        if self.lifecycle.should_start()? {
            log::debug!("embedded server serving");
            self.lifecycle.serving();
        }
        Ok(())
    }

    fn execute(&mut self, nodes: &[Node], options: ExecuteOptions) -> Result<Vec<Boxed>, Error> {
        self.lifecycle.ensure_serving()?;
        let mut ctx = ExecuteContext::new().with_no_cache(options.no_cache);
        ctx.storage = self.storage.clone();
        self.engine.execute(nodes, &ctx)
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        self.lifecycle.shut_down();
        Ok(())
    }

    fn state(&self) -> ServerState {
        self.lifecycle.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft::{Graph, TransportError, Value};

    #[test]
    fn executes_only_while_serving() {
        let mut graph = Graph::with_builtins();
        let nine = graph.constant(9.0);
        let three = graph.constant(3.0);
        let sum = graph.call("add", &[nine, three]).unwrap();

        let mut server = EmbeddedServer::new(None);
        assert!(matches!(
            server.execute(&[sum.clone()], ExecuteOptions::default()),
            Err(Error::Transport(TransportError::NotServing))
        ));

        server.start().unwrap();
        let out = server.execute(&[sum.clone()], ExecuteOptions::default()).unwrap();
        assert_eq!(out, [Value::number(12.0)]);

        server.shutdown().unwrap();
        assert_eq!(server.state(), ServerState::ShutDown);
        assert!(server.execute(&[sum], ExecuteOptions::default()).is_err());
        assert!(server.start().is_err());
    }
}
