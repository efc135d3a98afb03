//! Server lifecycle: startup, accept loop, ordered shutdown.
//!
//! Startup order: storage root, metadata store, scrub, lock manager,
//! listener — any failure is fatal and reported with a nonzero exit.
//! Shutdown order mirrors the pipeline: stop accepting, close the client
//! queue, force-close every tracked client socket to unblock handler
//! reads, join the handlers, close the task queue, join the workers.
//! In-flight tasks run to completion; their results are posted whether or
//! not anyone is still waiting.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use metadata::Store;

use crate::config::{CLIENT_QUEUE_DEPTH, DaemonConfig, TASK_QUEUE_DEPTH};
use crate::connection::{self, ConnectionCtx};
use crate::error::DaemonError;
use crate::locks::LockManager;
use crate::queue::Queue;
use crate::scrub;
use crate::task::Task;
use crate::worker::{self, WorkerCtx};

const LISTEN_BACKLOG: i32 = 128;

/// An accepted connection travelling through the client queue.
struct ClientConn {
    id: u64,
    stream: TcpStream,
}

/// Tracked client sockets, force-closed on shutdown to unblock handler
/// reads.
#[derive(Default)]
struct Registry {
    inner: Mutex<FxHashMap<u64, TcpStream>>,
}

impl Registry {
    fn insert(&self, id: u64, stream: TcpStream) {
        self.inner.lock().insert(id, stream);
    }

    fn remove(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    fn shutdown_all(&self) {
        for stream in self.inner.lock().values() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// A bound, scrubbed, not-yet-running server.
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    config: DaemonConfig,
    store: Arc<Store>,
    locks: Arc<LockManager>,
    clients: Arc<Queue<ClientConn>>,
    tasks: Arc<Queue<Task>>,
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
}

/// Cloneable trigger for an orderly shutdown.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl ServerHandle {
    /// Requests shutdown and wakes the acceptor.
    ///
    /// Idempotent; safe to call from a signal-handling thread.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // accept() has no cancellation; a loopback connect wakes it so it
        // can observe the flag.
        let target = if self.addr.ip().is_unspecified() {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.addr.port())
        } else {
            self.addr
        };
        let _ = TcpStream::connect(target);
    }

    /// The address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Server {
    /// Prepares a server: storage root, store, scrub, listener.
    pub fn bind(config: DaemonConfig) -> Result<Self, DaemonError> {
        fs::create_dir_all(&config.root).map_err(|source| DaemonError::Root {
            path: config.root.clone(),
            source,
        })?;

        let store = Store::open(&config.db_path).map_err(|source| DaemonError::Store {
            path: config.db_path.clone(),
            source,
        })?;
        scrub::run(&store, &config.root).map_err(|source| DaemonError::Store {
            path: config.db_path.clone(),
            source,
        })?;

        let requested = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let listener = listen(requested).map_err(|source| DaemonError::Bind {
            addr: requested,
            source,
        })?;
        let addr = listener.local_addr()?;

        Ok(Self {
            listener,
            addr,
            store: Arc::new(store),
            locks: Arc::new(LockManager::new()),
            clients: Arc::new(Queue::with_capacity(CLIENT_QUEUE_DEPTH)),
            tasks: Arc::new(Queue::with_capacity(TASK_QUEUE_DEPTH)),
            registry: Arc::new(Registry::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// The address the listener is bound to; with port 0 this is where the
    /// OS actually put us.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns a shutdown handle for this server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
            addr: self.addr,
        }
    }

    /// Runs the accept loop until shutdown, then tears the pipeline down in
    /// order. Blocks the calling thread.
    pub fn run(self) -> Result<(), DaemonError> {
        let handlers = self.spawn_handlers()?;
        let workers = self.spawn_workers()?;
        self.install_signal_handlers()?;

        info!(addr = %self.addr, root = %self.config.root.display(), "listening");
        let next_id = AtomicU64::new(0);

        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if !self.shutdown.load(Ordering::SeqCst) {
                        error!(%err, "accept failed");
                    }
                    break;
                }
            };
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            info!(%peer, "client connected");
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            // An untracked connection could not be force-closed at
            // shutdown and would leave its handler blocked in a read
            // forever; refuse it instead of serving it.
            match stream.try_clone() {
                Ok(tracked) => self.registry.insert(id, tracked),
                Err(err) => {
                    warn!(%peer, %err, "dropping connection that cannot be tracked for shutdown");
                    continue;
                }
            }
            if self.clients.push(ClientConn { id, stream }).is_err() {
                self.registry.remove(id);
                break;
            }
        }

        info!("shutting down");
        self.clients.close();
        self.registry.shutdown_all();
        join_all(handlers, "connection handler");
        self.tasks.close();
        join_all(workers, "worker");
        info!("shutdown complete");
        Ok(())
    }

    fn spawn_handlers(&self) -> Result<Vec<JoinHandle<()>>, DaemonError> {
        let mut handles = Vec::with_capacity(self.config.client_threads);
        for i in 0..self.config.client_threads {
            let clients = Arc::clone(&self.clients);
            let registry = Arc::clone(&self.registry);
            let ctx = ConnectionCtx {
                store: Arc::clone(&self.store),
                tasks: Arc::clone(&self.tasks),
                root: self.config.root.clone(),
                default_quota: self.config.default_quota,
            };
            let handle = thread::Builder::new()
                .name(format!("conn-{i}"))
                .spawn(move || {
                    while let Some(conn) = clients.pop() {
                        connection::serve(&ctx, conn.stream);
                        registry.remove(conn.id);
                    }
                })?;
            handles.push(handle);
        }
        Ok(handles)
    }

    fn spawn_workers(&self) -> Result<Vec<JoinHandle<()>>, DaemonError> {
        let mut handles = Vec::with_capacity(self.config.workers);
        for i in 0..self.config.workers {
            let tasks = Arc::clone(&self.tasks);
            let ctx = WorkerCtx {
                store: Arc::clone(&self.store),
                locks: Arc::clone(&self.locks),
                root: self.config.root.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || worker::run(&ctx, &tasks))?;
            handles.push(handle);
        }
        Ok(handles)
    }

    #[cfg(unix)]
    fn install_signal_handlers(&self) -> Result<(), DaemonError> {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let handle = self.handle();
        thread::Builder::new()
            .name("signals".to_owned())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!(signal, "shutdown signal received");
                    handle.shutdown();
                }
            })?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn install_signal_handlers(&self) -> Result<(), DaemonError> {
        Ok(())
    }
}

fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn join_all(handles: Vec<JoinHandle<()>>, role: &str) {
    for handle in handles {
        if handle.join().is_err() {
            warn!(role, "thread panicked");
        }
    }
}
