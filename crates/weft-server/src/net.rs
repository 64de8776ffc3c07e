//! Networked backend over WebSocket.
//!
//! [`NetService`] accepts connections and answers each request frame with a
//! response frame. Connections are served concurrently; requests on one
//! connection are answered in order. Evaluation runs on the blocking pool so
//! a slow graph never stalls the accept loop.
//!
//! [`NetServer`] is the client side: a [`Server`] that sends every execute
//! call to a service and waits for its answer with a timeout.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use weft::{Boxed, Error, ErrorBody, ErrorKind, Node, TransportError};

use crate::config::NetSettings;
use crate::handler::Handler;
use crate::protocol::{Command, Request, Response, STATUS_INTERNAL};
use crate::server::{ExecuteOptions, Lifecycle, RemoteCodec, Server, ServerState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn transport_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        tungstenite::Error::Io(e) => TransportError::Io(e),
        other => TransportError::Connect(other.to_string()),
    }
}

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<Handler>,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    log::info!("weft service listening on ws://{}", listener.local_addr()?);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("weft service shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };
                log::debug!("connection from {peer}");
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handler).await {
                        log::warn!("connection {peer} ended: {e}");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    handler: Arc<Handler>,
) -> Result<(), tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let response = match Request::parse(&text) {
            Ok(Request {
                command: Command::Shutdown,
                ..
            }) => break,
            Ok(request) => {
                let id = request.id;
                let handler = handler.clone();
                tokio::task::spawn_blocking(move || handler.handle(&request))
                    .await
                    .unwrap_or_else(|e| {
                        Response::error(
                            id,
                            STATUS_INTERNAL,
                            ErrorBody::new(ErrorKind::Internal, e.to_string()),
                        )
                    })
            }
            Err(rejected) => {
                log::warn!("malformed request {}: {text}", rejected.id);
                rejected
            }
        };

        match serde_json::to_string(&response) {
            Ok(json) => write.send(Message::Text(json)).await?,
            Err(e) => log::warn!("failed to encode response {}: {e}", response.id),
        }
    }

    Ok(())
}

/// Next text frame, waiting at most until `deadline`.
async fn receive(socket: &mut Socket, deadline: Instant) -> Result<String, TransportError> {
    loop {
        let message = tokio::time::timeout_at(deadline, socket.next())
            .await
            .map_err(|_| TransportError::Timeout)?
            .ok_or(TransportError::Closed)?
            .map_err(transport_error)?;
        match message {
            Message::Text(text) => return Ok(text),
            Message::Close(_) => return Err(TransportError::Closed),
            _ => continue,
        }
    }
}

/// Send `request` and wait for its answer. Answers to earlier requests that
/// timed out arrive first on the same connection and are skipped.
async fn exchange(
    socket: &mut Socket,
    request: &Request,
    timeout: Duration,
) -> Result<Response, TransportError> {
    let json =
        serde_json::to_string(request).map_err(|e| TransportError::Malformed(e.to_string()))?;
    socket.send(Message::Text(json)).await.map_err(transport_error)?;

    let deadline = Instant::now() + timeout;
    loop {
        let text = receive(socket, deadline).await?;
        let response: Response = serde_json::from_str(&text)
            .map_err(|e| TransportError::Malformed(format!("{e}: {text}")))?;
        if response.answers(request.id) {
            return Ok(response);
        }
        log::warn!(
            "discarding service response {} while awaiting {}",
            response.id,
            request.id
        );
    }
}

/// A running service on its own thread and runtime.
#[derive(Debug)]
pub struct NetService {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl NetService {
    /// Bind `addr` (port 0 picks a free port) and start serving.
    pub fn bind(addr: &str, handler: Arc<Handler>) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("weft-net".into())
            .spawn(move || {
                runtime.block_on(serve(listener, handler, async {
                    let _ = rx.await;
                }))
            })?;

        Ok(Self {
            local_addr,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and join the service thread.
    pub fn shutdown(&mut self) -> io::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| io::Error::other("service thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for NetService {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("weft service stopped with error: {e}");
        }
    }
}

/// Client backend talking to a [`NetService`].
#[derive(Debug)]
pub struct NetServer {
    settings: NetSettings,
    runtime: Option<Runtime>,
    socket: Option<Socket>,
    codec: RemoteCodec,
    lifecycle: Lifecycle,
}

impl NetServer {
    pub fn new(settings: NetSettings) -> Self {
        Self {
            settings,
            runtime: None,
            socket: None,
            codec: RemoteCodec::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    fn round_trip(&mut self, request: &Request) -> Result<Response, TransportError> {
        let timeout = self.settings.timeout();
        let runtime = self.runtime.as_ref().ok_or(TransportError::NotServing)?;
        let socket = self.socket.as_mut().ok_or(TransportError::NotServing)?;
        runtime.block_on(exchange(socket, request, timeout))
    }

    fn stop(&mut self) {
        if let (Some(runtime), Some(mut socket)) = (self.runtime.take(), self.socket.take()) {
            let request = self.codec.shutdown_request();
            runtime.block_on(async {
                if let Ok(json) = serde_json::to_string(&request) {
                    let _ = socket.send(Message::Text(json)).await;
                }
                if let Err(e) = socket.close(None).await {
                    log::debug!("closing connection: {e}");
                }
            });
        }
    }
}

impl Server for NetServer {
    fn start(&mut self) -> Result<(), Error> {
        if !self.lifecycle.should_start()? {
            return Ok(());
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Io)?;
        let url = format!("ws://{}", self.settings.addr);
        let timeout = self.settings.timeout();
        // The timer must be created inside the runtime it is polled on.
        let (socket, _) = runtime
            .block_on(async {
                tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await
            })
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Connect(format!("{url}: {e}")))?;
        log::info!("connected to {url}");

        self.runtime = Some(runtime);
        self.socket = Some(socket);
        self.lifecycle.serving();
        Ok(())
    }

    fn execute(&mut self, nodes: &[Node], options: ExecuteOptions) -> Result<Vec<Boxed>, Error> {
        self.lifecycle.ensure_serving()?;
        let (request, types) = self.codec.request(nodes, options)?;
        let response = self.round_trip(&request)?;
        self.codec.results(response, &types)
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        self.stop();
        self.lifecycle.shut_down();
        Ok(())
    }

    fn state(&self) -> ServerState {
        self.lifecycle.state()
    }
}

impl Drop for NetServer {
    fn drop(&mut self) {
        self.stop();
    }
}
