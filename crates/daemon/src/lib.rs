//! The depot storage daemon.
//!
//! Architecture, stages left to right:
//!
//! ```text
//! acceptor ──▶ client queue ──▶ connection handlers ──▶ task queue ──▶ workers
//!                                  ▲                                     │
//!                                  └──────── completion signal ◀─────────┘
//! ```
//!
//! The acceptor owns the listener; a fixed pool of connection handlers
//! parses commands and ingests upload payloads; a fixed pool of workers
//! executes tasks against the filesystem and the metadata store under the
//! per-user / per-file lock hierarchy. Bounded queues decouple the pools
//! and provide back-pressure; closing them drives shutdown.

pub mod auth;
pub mod config;
mod connection;
pub mod error;
pub mod locks;
pub mod queue;
pub mod scrub;
pub mod server;
mod session;
mod storage;
mod task;
mod worker;

pub use config::{DaemonConfig, parse_args};
pub use error::DaemonError;
pub use server::{Server, ServerHandle};

/// Binds and runs a server with the given configuration, blocking until
/// shutdown.
pub fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    Server::bind(config)?.run()
}
