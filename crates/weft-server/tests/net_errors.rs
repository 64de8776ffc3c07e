//! Failures over the network keep their class.

use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;
use weft::fs::Filesystem;
use weft::{Error, ErrorKind, Graph, StorageContext, TransportError, Value};
use weft_server::{Client, Handler, NetService, ServerConfig};

fn service(storage: Option<StorageContext>) -> NetService {
    NetService::bind("127.0.0.1:0", Arc::new(Handler::new(storage))).unwrap()
}

fn client(service: &NetService) -> Client {
    Client::from_config(&ServerConfig::net(service.local_addr().to_string())).unwrap()
}

#[test]
fn operation_failures_are_error_statuses() {
    let service = service(None);
    let mut client = client(&service);

    let mut graph = Graph::with_builtins();
    let text = graph.constant("abcd");
    let parsed = graph.call("parse", &[text]).unwrap();

    let err = client.use_node(&parsed).unwrap_err();
    assert!(err.is_operation_failure());
    match err {
        Error::Transport(TransportError::ErrorStatus { status, error }) => {
            assert_eq!(status, 500);
            assert_eq!(error.kind, ErrorKind::Operation);
            assert_eq!(error.op.as_deref(), Some("json-parse"));
        }
        other => panic!("expected an error status, got {other}"),
    }

    // The connection survives a failed request.
    let fine = graph.constant(r#"[1]"#);
    let parsed = graph.call("parse", &[fine]).unwrap();
    assert_eq!(
        client.use_node(&parsed).unwrap(),
        Value::list([Value::number(1.0)])
    );
}

#[test]
fn sandbox_escapes_fail_on_the_server() {
    let dir: PathBuf = std::env::temp_dir().join(format!("weft-net-{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let storage = StorageContext::new(Filesystem::new(&dir), "default");
    let service = service(Some(storage));
    let mut client = client(&service);

    let mut graph = Graph::with_builtins();
    let escape = graph.constant("../../etc/passwd");
    let read = graph.call("file-read", &[escape]).unwrap();
    let err = client.use_node(&read).unwrap_err();
    assert!(err.is_operation_failure());
    assert!(err.to_string().contains("not allowed"));
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn unreachable_services_are_connect_errors() {
    let addr = {
        let service = service(None);
        service.local_addr()
    };
    let result = Client::from_config(&ServerConfig::net(addr.to_string()));
    assert!(matches!(
        result,
        Err(Error::Transport(TransportError::Connect(_)))
    ));
}

#[test]
fn net_servers_start_and_stop_outside_any_runtime() {
    use weft_server::{NetServer, Server, ServerState};

    let service = service(None);
    let mut server = NetServer::new(ServerConfig::net(service.local_addr().to_string()).net);
    server.start().unwrap();
    assert_eq!(server.state(), ServerState::Serving);
    server.shutdown().unwrap();
    assert_eq!(server.state(), ServerState::ShutDown);
}
