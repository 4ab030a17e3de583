//! Wire types for the proxy's two protocol families.
//!
//! This crate intentionally does **not** depend on axum or any HTTP client.
//! It holds the Claude Messages API shapes (requests, responses, stream
//! events), the Gemini generateContent shapes, the Cloud Code `v1internal`
//! envelope, and an incremental SSE parser. IO lives in higher layers.

pub mod claude;
pub mod cloudcode;
pub mod gemini;
pub mod sse;

pub use sse::{SseEvent, SseParser};
