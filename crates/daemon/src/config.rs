//! Daemon configuration and command-line parsing.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Arg, Command, value_parser};

/// Default TCP port the daemon listens on.
pub const DEFAULT_PORT: u16 = 9000;

/// Default per-user quota: 100 MiB.
pub const DEFAULT_QUOTA_BYTES: u64 = 100 * 1024 * 1024;

/// Default size of the connection-handler and worker pools.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Depth of the accepted-connection queue.
pub(crate) const CLIENT_QUEUE_DEPTH: usize = 128;

/// Depth of the task queue.
pub(crate) const TASK_QUEUE_DEPTH: usize = 1024;

/// Everything the server needs to come up.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// TCP port to listen on; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Storage root; one subdirectory per user.
    pub root: PathBuf,
    /// Path of the metadata database.
    pub db_path: PathBuf,
    /// Quota assigned to accounts created by SIGNUP.
    pub default_quota: u64,
    /// Number of connection-handler threads.
    pub client_threads: usize,
    /// Number of worker threads.
    pub workers: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let root = PathBuf::from("storage");
        let db_path = root.join("meta.db");
        Self {
            port: DEFAULT_PORT,
            root,
            db_path,
            default_quota: DEFAULT_QUOTA_BYTES,
            client_threads: DEFAULT_POOL_SIZE,
            workers: DEFAULT_POOL_SIZE,
        }
    }
}

fn command() -> Command {
    Command::new("depotd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multi-user networked file storage daemon")
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("TCP port to listen on")
                .value_parser(value_parser!(u16))
                .default_value("9000"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("DIR")
                .help("Storage root directory; created if absent")
                .value_parser(value_parser!(PathBuf))
                .default_value("storage"),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .value_name("PATH")
                .help("Metadata database path [default: <root>/meta.db]")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("quota-bytes")
                .long("quota-bytes")
                .value_name("BYTES")
                .help("Quota assigned to newly created accounts")
                .value_parser(value_parser!(u64))
                .default_value("104857600"),
        )
        .arg(
            Arg::new("client-threads")
                .long("client-threads")
                .value_name("N")
                .help("Connection handler threads")
                .value_parser(value_parser!(usize))
                .default_value("4"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_name("N")
                .help("Task worker threads")
                .value_parser(value_parser!(usize))
                .default_value("4"),
        )
}

/// Parses daemon command-line arguments.
pub fn parse_args<I, T>(args: I) -> Result<DaemonConfig, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command().try_get_matches_from(args)?;

    let port = *matches.get_one::<u16>("port").unwrap_or(&DEFAULT_PORT);
    let root = matches
        .get_one::<PathBuf>("root")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("storage"));
    let db_path = matches
        .get_one::<PathBuf>("db")
        .cloned()
        .unwrap_or_else(|| root.join("meta.db"));
    let default_quota = *matches
        .get_one::<u64>("quota-bytes")
        .unwrap_or(&DEFAULT_QUOTA_BYTES);
    let client_threads = pool_size(matches.get_one::<usize>("client-threads"));
    let workers = pool_size(matches.get_one::<usize>("workers"));

    Ok(DaemonConfig {
        port,
        root,
        db_path,
        default_quota,
        client_threads,
        workers,
    })
}

/// A zero-sized pool would deadlock the pipeline; clamp to one thread.
fn pool_size(value: Option<&usize>) -> usize {
    value.copied().unwrap_or(DEFAULT_POOL_SIZE).max(1)
}
