//! Backends for executing weft graphs.
//!
//! A [`Client`] forces nodes through one of three interchangeable
//! [`Server`]s: the engine inline ([`EmbeddedServer`]), a detached worker
//! process ([`WorkerServer`]) or a WebSocket service ([`NetServer`] talking
//! to a [`NetService`]). The backend is picked by [`ServerConfig`].

pub mod client;
pub mod config;
pub mod embedded;
pub mod handler;
pub mod net;
pub mod protocol;
pub mod server;
pub mod worker;

pub use client::Client;
pub use config::{Backend, ConfigError, ServerConfig};
pub use embedded::EmbeddedServer;
pub use handler::Handler;
pub use net::{NetServer, NetService};
pub use server::{ExecuteOptions, Server, ServerState};
pub use worker::WorkerServer;
