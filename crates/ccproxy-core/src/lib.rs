//! Dispatch core: configuration, the error taxonomy, the model table, OAuth
//! token/project resolution, upstream request building, the transport, the
//! retry engine, and the client-facing axum handlers.

pub mod builder;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod models;
pub mod oauth;
pub mod upstream;

pub use config::ProxyConfig;
pub use dispatch::DispatchEngine;
pub use error::DispatchError;
pub use handler::{AppState, router};
pub use upstream::{UpstreamBody, UpstreamRequest, UpstreamResponse, UpstreamTransport, WreqTransport};
