//! Lazy typed computation graphs.
//!
//! Build a [`Graph`] of constants and type-checked op calls, then force it
//! with an [`Engine`]. Pure results are cached by input value; tags ride along
//! on [`Boxed`] values; [`mapper`] and [`wire`] carry typed values and graphs
//! across storage and transport boundaries.

pub mod boxed;
pub mod cache;
pub mod engine;
pub mod error;
pub mod fs;
pub mod graph;
pub mod mapper;
pub mod ops;
pub mod stats;
pub mod storage;
pub mod types;
pub mod value;
pub mod wire;

pub use boxed::{BoxToken, Boxed, TagMap, add_tags, box_value, get_tags};
pub use engine::{Engine, ExecuteContext};
pub use error::{
    AccessDeniedError, Error, ErrorBody, ErrorKind, MapperError, OperationError, TransportError,
    TypeError,
};
pub use fs::Filesystem;
pub use graph::{Graph, Node, NodeId};
pub use mapper::{Mapper, MapperContext, MapperFactory};
pub use ops::{OpContext, OpDef, OpRegistry, tag_getter};
pub use stats::ExecuteStats;
pub use storage::StorageContext;
pub use types::{Type, assignable, equals, is_optional, non_none, optional, type_of};
pub use value::Value;
pub use wire::WireGraph;
