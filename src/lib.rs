//! Corsway - streaming CORS-anywhere reverse proxy.
//!
//! A browser calls `/?url=<target>` (or `/<target>`); the proxy validates the
//! target, applies the origin policy and per-client rate limit, forwards the
//! request and streams the response back with CORS headers injected so the
//! page can read it.
//!
//! # Request Path
//!
//! - **Preflight:** `OPTIONS` is answered locally and never forwarded.
//! - **Relay:** validated, authorized requests are streamed frame by frame in
//!   both directions with bounded memory.
//! - **Reject:** every failure maps to one status (400/403/429/502/504) and
//!   still carries CORS headers.

pub mod config;
pub mod error;
pub mod headers;
pub mod logging;
pub mod policy;
pub mod proxy_body;
pub mod proxy_service;
pub mod rate_limiter;
pub mod server;
pub mod target;
pub mod timeout;
pub mod upstream;
