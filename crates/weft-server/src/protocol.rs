//! Request/response envelopes shared by the worker and network backends.
//!
//! Both transports carry the same JSON messages: newline-delimited on a
//! worker's stdio, one text frame each over WebSocket.

use serde::{Deserialize, Serialize};
use weft::{Error, ErrorBody, ErrorKind, TransportError, WireGraph};

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_INTERNAL: u16 = 500;

/// Commands a client can send to a server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Evaluate the roots of a serialized graph
    Execute {
        graph: WireGraph,
        #[serde(default, rename = "noCache")]
        no_cache: bool,
    },

    /// Stop serving; a worker exits, a network connection closes
    Shutdown,
}

/// Request wrapper with ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

impl Request {
    /// Decode one message. A message that is not a valid request is answered
    /// with a bad-request response carrying whatever id it names, or 0 when
    /// none can be read.
    pub fn parse(text: &str) -> Result<Request, Response> {
        serde_json::from_str(text).map_err(|e| {
            let id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|raw| raw.get("id").and_then(serde_json::Value::as_u64))
                .unwrap_or(0);
            Response::malformed(id, e.to_string())
        })
    }
}

/// Response to one request. A non-success status always carries an error
/// body and never carries results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Status a server reports for a failed request.
pub fn status_for(error: &Error) -> u16 {
    match error {
        Error::Type(_) | Error::Mapper(_) | Error::Transport(TransportError::Malformed(_)) => {
            STATUS_BAD_REQUEST
        }
        Error::AccessDenied(_) => STATUS_FORBIDDEN,
        _ => STATUS_INTERNAL,
    }
}

impl Response {
    pub fn ok(id: u64, results: Vec<serde_json::Value>) -> Self {
        Self {
            id,
            status: STATUS_OK,
            results: Some(results),
            error: None,
        }
    }

    pub fn failure(id: u64, error: &Error) -> Self {
        Self::error(id, status_for(error), ErrorBody::from(error))
    }

    pub fn error(id: u64, status: u16, error: ErrorBody) -> Self {
        Self {
            id,
            status,
            results: None,
            error: Some(error),
        }
    }

    pub fn malformed(id: u64, message: impl Into<String>) -> Self {
        Self::error(
            id,
            STATUS_BAD_REQUEST,
            ErrorBody::new(ErrorKind::Malformed, message),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether this is the answer to request `id`. Request ids start at 1, so
    /// an error with id 0 rejects an envelope whose id was unreadable and
    /// answers whichever request is outstanding.
    pub fn answers(&self, id: u64) -> bool {
        self.id == id || (self.id == 0 && !self.is_success())
    }

    /// Results of a successful response. The status is checked before the
    /// body is looked at, so a failure is never read as results.
    pub fn into_results(self) -> Result<Vec<serde_json::Value>, TransportError> {
        if !self.is_success() {
            let error = self.error.unwrap_or_else(|| {
                ErrorBody::new(ErrorKind::Internal, "error response without a body")
            });
            return Err(TransportError::ErrorStatus {
                status: self.status,
                error,
            });
        }
        self.results.ok_or_else(|| {
            TransportError::Malformed(format!("response {} has no results", self.id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft::OperationError;

    #[test]
    fn commands_are_tagged_by_type() {
        let request = Request {
            id: 7,
            command: Command::Execute {
                graph: WireGraph {
                    nodes: vec![],
                    roots: vec![],
                },
                no_cache: true,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["command"]["type"], "execute");
        assert_eq!(json["command"]["noCache"], true);

        let shutdown: Request =
            serde_json::from_value(json!({"id": 1, "command": {"type": "shutdown"}})).unwrap();
        assert!(matches!(shutdown.command, Command::Shutdown));
    }

    #[test]
    fn operation_failures_are_error_statuses() {
        let error = Error::Operation(OperationError {
            op: "json-parse".into(),
            message: "expected value".into(),
        });
        let response = Response::failure(3, &error);
        assert_eq!(response.status, STATUS_INTERNAL);

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("results").is_none());
        assert_eq!(json["error"]["kind"], "operation");
        assert_eq!(json["error"]["op"], "json-parse");

        match response.into_results() {
            Err(TransportError::ErrorStatus { status, error }) => {
                assert_eq!(status, 500);
                assert_eq!(error.kind, ErrorKind::Operation);
            }
            other => panic!("expected an error status, got {other:?}"),
        }
    }

    #[test]
    fn bad_envelopes_are_answered_under_their_own_id() {
        let bad = Request::parse(r#"{"id": 9, "command": {"type": "bogus"}}"#).unwrap_err();
        assert_eq!(bad.id, 9);
        assert_eq!(bad.status, STATUS_BAD_REQUEST);
        assert!(bad.answers(9));
        assert!(!bad.answers(8));

        let unreadable = Request::parse("not json").unwrap_err();
        assert_eq!(unreadable.id, 0);
        assert!(unreadable.answers(8));
        assert!(!Response::ok(0, vec![]).answers(8));
    }

    #[test]
    fn success_without_results_is_malformed() {
        let response: Response = serde_json::from_value(json!({"id": 4, "status": 200})).unwrap();
        assert!(matches!(
            response.into_results(),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn statuses_follow_the_failure_class() {
        let malformed = Error::Transport(TransportError::Malformed("bad index".into()));
        assert_eq!(status_for(&malformed), STATUS_BAD_REQUEST);
        let denied = Error::AccessDenied(weft::AccessDeniedError {
            path: "../x".into(),
        });
        assert_eq!(status_for(&denied), STATUS_FORBIDDEN);
    }
}
