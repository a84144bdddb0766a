//! HTTP transport: conditional flag refresh, auxiliary SDK endpoints, and SSE streaming.

pub mod client;
pub mod sse;
