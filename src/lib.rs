//! `gns3-proxy` is an authenticating, filtering reverse proxy that fronts a
//! pool of GNS3 server backends, selecting one per authenticated user.
//!
//! The binary entry point lives in `main.rs`; this library exposes the
//! pieces so integration tests can drive them directly.

pub mod access_log;
pub mod acceptor;
pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod metrics;
pub mod policy;
pub mod worker;
