//! Daemon startup and runtime errors.
//!
//! Everything here is fatal to the process: bind, store open, and storage
//! root creation failures. Per-session and per-operation failures never
//! surface as [`DaemonError`]; they are mapped to wire error codes or end
//! the one session they belong to.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal server errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The storage root could not be created.
    #[error("failed to create storage root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The metadata store could not be opened or scrubbed.
    #[error("failed to open metadata store at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: metadata::StoreError,
    },
    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Thread spawning or another runtime I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
