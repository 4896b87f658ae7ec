//! Agent gateway host: supervises the gateway process and talks to it over
//! its authenticated WebSocket RPC protocol.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Exponential backoff shared by restarts and reconnects.
pub mod backoff;
/// CLI parsing and TOML configuration.
pub mod config;
/// Persistent Ed25519 device identity.
pub mod identity;
/// WebSocket RPC client for the gateway control endpoint.
pub mod rpc;
/// Gateway subprocess supervisor.
pub mod supervisor;
