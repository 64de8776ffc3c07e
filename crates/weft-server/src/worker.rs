//! Detached worker backend.
//!
//! The parent spawns a long-lived `weft-worker` process and talks to it over
//! piped stdio, one JSON message per line. A reader thread forwards the
//! worker's stdout lines so each round trip can wait with a timeout. At most
//! one request is in flight per worker.

use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command as ProcessCommand, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use weft::fs::FILESYSTEM_DIR_ENV;
use weft::{Boxed, Error, Node, StorageContext, TransportError};

use crate::config::WorkerSettings;
use crate::handler::Handler;
use crate::protocol::{Command, Request, Response};
use crate::server::{ExecuteOptions, Lifecycle, RemoteCodec, Server, ServerState};

/// Environment variable naming the storage namespace of a worker.
pub const NAMESPACE_ENV: &str = "WEFT_NAMESPACE";

/// How long a worker may take to exit after being asked to.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct WorkerServer {
    settings: WorkerSettings,
    storage: Option<StorageContext>,
    process: Option<WorkerProcess>,
    codec: RemoteCodec,
    lifecycle: Lifecycle,
}

impl WorkerServer {
    pub fn new(settings: WorkerSettings, storage: Option<StorageContext>) -> Self {
        Self {
            settings,
            storage,
            process: None,
            codec: RemoteCodec::new(),
            lifecycle: Lifecycle::new(),
        }
    }

    /// OS process id of the running worker.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|process| process.child.id())
    }

    fn spawn(&self) -> Result<WorkerProcess, TransportError> {
        let mut command = ProcessCommand::new(&self.settings.command);
        command
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(storage) = &self.storage {
            command
                .env(FILESYSTEM_DIR_ENV, storage.root().root())
                .env(NAMESPACE_ENV, storage.namespace());
        }

        let mut child = command.spawn().map_err(TransportError::Spawn)?;
        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(TransportError::Closed)?;

        let (tx, lines) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("weft-worker-reader".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })?;

        Ok(WorkerProcess {
            child,
            stdin: Some(stdin),
            lines,
            reader: Some(reader),
        })
    }

    fn round_trip(&mut self, request: &Request) -> Result<Response, TransportError> {
        let timeout = self.settings.timeout();
        let process = self.process.as_mut().ok_or(TransportError::NotServing)?;
        let stdin = process.stdin.as_mut().ok_or(TransportError::Closed)?;

        let json = serde_json::to_string(request)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        writeln!(stdin, "{json}")?;
        stdin.flush()?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match process.lines.recv_timeout(remaining) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            };
            let response: Response = serde_json::from_str(&line)
                .map_err(|e| TransportError::Malformed(format!("{e}: {line}")))?;
            if response.answers(request.id) {
                return Ok(response);
            }
            // Late answer to a request that already timed out.
            log::warn!(
                "discarding worker response {} while awaiting {}",
                response.id,
                request.id
            );
        }
    }

    fn stop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        let request = self.codec.shutdown_request();
        if let Some(mut stdin) = process.stdin.take() {
            let sent = serde_json::to_string(&request)
                .map_err(io::Error::from)
                .and_then(|json| writeln!(stdin, "{json}"))
                .and_then(|_| stdin.flush());
            if let Err(e) = sent {
                log::debug!("worker did not take the shutdown message: {e}");
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    log::debug!("worker exited with {status}");
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
                Ok(None) => {
                    log::warn!("worker {} ignored shutdown, killing it", process.child.id());
                    if let Err(e) = process.child.kill() {
                        log::warn!("failed to kill worker: {e}");
                    }
                    let _ = process.child.wait();
                    break;
                }
                Err(e) => {
                    log::warn!("failed to wait for worker: {e}");
                    break;
                }
            }
        }

        if let Some(reader) = process.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Server for WorkerServer {
    fn start(&mut self) -> Result<(), Error> {
        if !self.lifecycle.should_start()? {
            return Ok(());
        }
        let process = self.spawn()?;
        log::info!(
            "started worker {} ({})",
            process.child.id(),
            self.settings.command.display()
        );
        self.process = Some(process);
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

impl Drop for WorkerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Storage context of a worker process, from its environment.
pub fn storage_from_env() -> Option<StorageContext> {
    let storage = StorageContext::from_env()?;
    match std::env::var(NAMESPACE_ENV) {
        Ok(namespace) if !namespace.is_empty() => {
            Some(StorageContext::new(storage.root().clone(), namespace))
        }
        _ => Some(storage),
    }
}

/// Worker side: answer requests read from `input` until a shutdown message
/// or end of input.
pub fn serve(input: impl BufRead, mut output: impl Write, handler: &Handler) -> io::Result<()> {
    log::info!("worker serving on stdio");

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match Request::parse(&line) {
            Ok(Request {
                command: Command::Shutdown,
                ..
            }) => {
                log::info!("worker shutting down");
                break;
            }
            Ok(request) => handler.handle(&request),
            Err(rejected) => {
                log::warn!("malformed request {}: {line}", rejected.id);
                rejected
            }
        };

        let json = serde_json::to_string(&response)?;
        writeln!(output, "{json}")?;
        output.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(input: &str) -> Vec<Response> {
        let mut output = Vec::new();
        serve(input.as_bytes(), &mut output, &Handler::new(None)).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn answers_one_line_per_request() {
        let execute = json!({
            "id": 5,
            "command": {
                "type": "execute",
                "graph": {
                    "nodes": [
                        {"nodeType": "const", "type": {"kind": "string"}, "val": "weft"},
                        {"nodeType": "output", "type": {"kind": "int"},
                         "fromOp": {"name": "string-len", "inputs": [0]}},
                    ],
                    "roots": [1],
                },
            },
        });
        let input = format!("{execute}\n\n{execute}\n");
        let responses = run(&input);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, 5);
        assert_eq!(responses[1].results, Some(vec![json!(4)]));
    }

    #[test]
    fn stops_at_shutdown() {
        let input = concat!(
            r#"{"id": 1, "command": {"type": "shutdown"}}"#,
            "\n",
            r#"{"id": 2, "command": {"type": "execute", "graph": {"nodes": [], "roots": []}}}"#,
            "\n",
        );
        assert!(run(input).is_empty());
    }

    #[test]
    fn malformed_lines_get_bad_request_answers() {
        let responses = run("not json\n");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, crate::protocol::STATUS_BAD_REQUEST);
    }

    #[test]
    fn bad_envelopes_keep_their_request_id() {
        let responses = run(concat!(r#"{"id": 9, "command": {"type": "bogus"}}"#, "\n"));
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, 9);
        assert_eq!(responses[0].status, crate::protocol::STATUS_BAD_REQUEST);
        assert!(!responses[0].answers(8));
    }

    #[test]
    fn missing_worker_binary_fails_to_start() {
        let settings = WorkerSettings {
            command: "/nonexistent/weft-worker".into(),
            ..WorkerSettings::default()
        };
        let mut server = WorkerServer::new(settings, None);
        assert!(matches!(
            server.start(),
            Err(Error::Transport(TransportError::Spawn(_)))
        ));
        assert_eq!(server.state(), ServerState::Created);
    }
}
