//! Error taxonomy shared by the engine and every transport.
//!
//! Each failure class has its own type so callers can tell "the operation
//! raised" apart from "the type was malformed" or "the server returned
//! something unreadable". [`Error`] unifies them for `?` at crate seams.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::Type;

/// Malformed or incompatible type construction, assignment or dispatch.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeError {
    /// `union()` was called without members.
    EmptyUnion,
    /// A tagged value type was given a tag shape that is not a typed dict.
    NotATypedDict(Type),
    /// A const type's literal does not fit its declared value type.
    ConstMismatch { declared: Type, literal: Type },
    /// The same property name appeared twice in one record type.
    DuplicateProperty(String),
    /// No op is registered under this name.
    UnknownOp(String),
    /// Ops exist under this name but none accepts the given input types.
    NoMatchingOverload { op: String, inputs: Vec<Type> },
    /// Wrong number of inputs for an exact op.
    Arity {
        op: String,
        expected: usize,
        found: usize,
    },
    /// A serialized type could not be read back.
    Malformed(String),
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyUnion => write!(f, "union requires at least one member"),
            Self::NotATypedDict(ty) => write!(f, "tag type must be a typed dict, got {ty}"),
            Self::ConstMismatch { declared, literal } => {
                write!(f, "const literal of type {literal} does not fit {declared}")
            }
            Self::DuplicateProperty(name) => write!(f, "duplicate property: {name}"),
            Self::UnknownOp(name) => write!(f, "unknown op: {name}"),
            Self::NoMatchingOverload { op, inputs } => {
                write!(f, "no overload of {op} accepts (")?;
                for (i, ty) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                write!(f, ")")
            }
            Self::Arity {
                op,
                expected,
                found,
            } => write!(f, "op {op} takes {expected} inputs, got {found}"),
            Self::Malformed(message) => write!(f, "malformed type: {message}"),
        }
    }
}

impl std::error::Error for TypeError {}

/// A path resolved outside the sandbox root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessDeniedError {
    pub path: String,
}

impl fmt::Display for AccessDeniedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path {} is not allowed", self.path)
    }
}

impl std::error::Error for AccessDeniedError {}

/// An operation implementation raised during evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationError {
    pub op: String,
    pub message: String,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op {} failed: {}", self.op, self.message)
    }
}

impl std::error::Error for OperationError {}

/// A value did not fit its mapper, or a stored shape could not be loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapperError {
    /// Storage address of the mapper that failed.
    pub address: String,
    pub message: String,
}

impl MapperError {
    pub fn new(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for MapperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapper at {}: {}", self.address, self.message)
    }
}

impl std::error::Error for MapperError {}

/// Failure class carried in a non-success response body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Operation,
    Type,
    AccessDenied,
    Mapper,
    Malformed,
    Internal,
}

/// Structured error description returned by a server with a non-success status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            op: None,
            message: message.into(),
        }
    }
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        match error {
            Error::Operation(e) => ErrorBody {
                kind: ErrorKind::Operation,
                op: Some(e.op.clone()),
                message: e.message.clone(),
            },
            Error::Type(e) => ErrorBody::new(ErrorKind::Type, e.to_string()),
            Error::AccessDenied(e) => ErrorBody::new(ErrorKind::AccessDenied, e.to_string()),
            Error::Mapper(e) => ErrorBody::new(ErrorKind::Mapper, e.to_string()),
            Error::Transport(TransportError::Malformed(message)) => {
                ErrorBody::new(ErrorKind::Malformed, message.clone())
            }
            other => ErrorBody::new(ErrorKind::Internal, other.to_string()),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Some(op) => write!(f, "{:?} error in {op}: {}", self.kind, self.message),
            None => write!(f, "{:?} error: {}", self.kind, self.message),
        }
    }
}

/// Failure at a transport boundary, distinct from an operation failure.
#[derive(Debug)]
pub enum TransportError {
    /// Could not reach the server.
    Connect(String),
    /// No response arrived within the configured timeout.
    Timeout,
    /// The peer closed the channel mid-exchange.
    Closed,
    /// The worker process could not be started.
    Spawn(std::io::Error),
    /// An envelope or body could not be parsed.
    Malformed(String),
    /// `execute` was called on a server that is not serving.
    NotServing,
    /// The server answered with a non-success status.
    ErrorStatus { status: u16, error: ErrorBody },
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(message) => write!(f, "connection failed: {message}"),
            Self::Timeout => write!(f, "timed out awaiting response"),
            Self::Closed => write!(f, "channel closed"),
            Self::Spawn(e) => write!(f, "failed to spawn worker: {e}"),
            Self::Malformed(message) => write!(f, "malformed envelope: {message}"),
            Self::NotServing => write!(f, "server is not serving"),
            Self::ErrorStatus { status, error } => write!(f, "status {status}: {error}"),
            Self::Io(e) => write!(f, "transport io: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Any failure surfaced by this crate.
#[derive(Debug)]
pub enum Error {
    Type(TypeError),
    AccessDenied(AccessDeniedError),
    Operation(OperationError),
    Transport(TransportError),
    Mapper(MapperError),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// True when an operation implementation raised, whichever backend
    /// reported it.
    pub fn is_operation_failure(&self) -> bool {
        match self {
            Error::Operation(_) => true,
            Error::Transport(TransportError::ErrorStatus { error, .. }) => {
                error.kind == ErrorKind::Operation
            }
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Type(e) => write!(f, "type error: {e}"),
            Error::AccessDenied(e) => write!(f, "access denied: {e}"),
            Error::Operation(e) => write!(f, "{e}"),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Mapper(e) => write!(f, "{e}"),
            Error::Io { path, source } => write!(f, "io error at {}: {source}", path.display()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Type(e) => Some(e),
            Error::AccessDenied(e) => Some(e),
            Error::Operation(e) => Some(e),
            Error::Transport(e) => Some(e),
            Error::Mapper(e) => Some(e),
            Error::Io { source, .. } => Some(source),
        }
    }
}

impl From<TypeError> for Error {
    fn from(e: TypeError) -> Self {
        Error::Type(e)
    }
}

impl From<AccessDeniedError> for Error {
    fn from(e: AccessDeniedError) -> Self {
        Error::AccessDenied(e)
    }
}

impl From<OperationError> for Error {
    fn from(e: OperationError) -> Self {
        Error::Operation(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<MapperError> for Error {
    fn from(e: MapperError) -> Self {
        Error::Mapper(e)
    }
}
