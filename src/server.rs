//! Accept/dispatch server core.
//!
//! A pool of accept workers pulls sockets off the listener and feeds a
//! shared queue; a larger pool of dispatch workers drains the queue into
//! the registry, which spawns the per-connection lifecycle. A reaper task
//! sweeps dead connections out of the registry on a fixed cadence.

use crate::config::{SecurityConfig, ServerConfig};
use crate::error::{WsError, WsResult};
use crate::handler::RouteTable;
use crate::registry::ConnectionRegistry;
use crate::security::SecureTransport;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

/// Poll period for accept/dispatch workers, so they observe shutdown
/// promptly even when idle.
const WORKER_POLL: Duration = Duration::from_millis(50);
/// Cadence of the dead-connection sweep.
const REAPER_PERIOD: Duration = Duration::from_millis(500);
/// Grace period per worker when stopping before it is abandoned.
const STOP_GRACE: Duration = Duration::from_secs(2);

pub struct Server {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    pub fn new(config: ServerConfig, routes: RouteTable) -> Self {
        Self::build(config, routes, None)
    }

    /// Builds a server whose accepted transports pass through `transport`
    /// before the handshake. The policy's `enabled` flag gates the wrap: a
    /// disabled policy behaves exactly like [`new`](Self::new).
    pub fn with_security(
        config: ServerConfig,
        routes: RouteTable,
        security: SecurityConfig,
        transport: Arc<dyn SecureTransport>,
    ) -> Self {
        let wrapper = security.enabled.then_some(transport);
        Self::build(config, routes, wrapper)
    }

    fn build(
        config: ServerConfig,
        routes: RouteTable,
        security: Option<Arc<dyn SecureTransport>>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(routes), security));
        Self {
            config,
            registry,
            running: Arc::new(AtomicBool::new(false)),
            workers: StdMutex::new(Vec::new()),
            local_addr: OnceLock::new(),
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Address the listener actually bound, available once [`run`](Self::run)
    /// succeeded. With port 0 this is where the OS placed us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Binds the listener and starts the worker pools. With `block` the
    /// call parks until [`stop`](Self::stop) is invoked from another task;
    /// otherwise it returns once the workers are up.
    pub async fn run(&self, block: bool) -> WsResult<()> {
        self.config.validate()?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = Arc::new(TcpListener::bind(&addr).await.map_err(WsError::Bind)?);
        let bound = listener.local_addr().map_err(WsError::Bind)?;
        let _ = self.local_addr.set(bound);
        self.running.store(true, Ordering::SeqCst);
        info!("server {} listening on {}", self.config.id, bound);

        let (tx, rx) = mpsc::unbounded_channel::<TcpStream>();
        let queue = Arc::new(Mutex::new(rx));
        let mut workers = self.workers.lock().unwrap();

        for n in 0..self.config.listener_workers {
            workers.push(tokio::spawn(accept_worker(
                n,
                listener.clone(),
                tx.clone(),
                self.running.clone(),
                self.config.no_delay,
            )));
        }
        drop(tx);

        let dispatchers = self.config.listener_workers * self.config.client_worker_multiplier;
        for n in 0..dispatchers {
            workers.push(tokio::spawn(dispatch_worker(
                n,
                queue.clone(),
                self.registry.clone(),
                self.running.clone(),
            )));
        }

        workers.push(tokio::spawn(reaper(
            self.registry.clone(),
            self.running.clone(),
        )));
        drop(workers);

        if block {
            while self.is_running() {
                sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(())
    }

    /// Stops the server: flags shutdown, asks every connection to stop,
    /// waits a bounded grace period for each worker, and sweeps the
    /// registry once more.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("server {} stopping", self.config.id);

        self.registry.stop_all();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            if timeout(STOP_GRACE, handle).await.is_err() {
                warn!("worker did not stop within grace period, abandoning it");
            }
        }

        let reaped = self.registry.remove_dead_connections();
        info!(
            "server {} stopped, swept {} connections",
            self.config.id, reaped
        );
    }
}

async fn accept_worker(
    n: usize,
    listener: Arc<TcpListener>,
    tx: mpsc::UnboundedSender<TcpStream>,
    running: Arc<AtomicBool>,
    no_delay: bool,
) {
    debug!("accept worker {} started", n);
    while running.load(Ordering::SeqCst) {
        match timeout(WORKER_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                if no_delay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                }
                debug!("accept worker {} queued connection from {}", n, peer);
                if tx.send(stream).is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                error!("accept worker {} failed to accept: {}", n, e);
                sleep(WORKER_POLL).await;
            }
            // idle timeout, loop back to the shutdown check
            Err(_) => {}
        }
    }
    debug!("accept worker {} stopped", n);
}

async fn dispatch_worker(
    n: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<TcpStream>>>,
    registry: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
) {
    debug!("dispatch worker {} started", n);
    while running.load(Ordering::SeqCst) {
        let stream = {
            let mut rx = queue.lock().await;
            match timeout(WORKER_POLL, rx.recv()).await {
                Ok(Some(stream)) => stream,
                // all senders gone, nothing left to dispatch
                Ok(None) => break,
                Err(_) => continue,
            }
        };
        let id = registry.register(Box::new(stream));
        debug!("dispatch worker {} handed off connection {}", n, id);
    }
    debug!("dispatch worker {} stopped", n);
}

async fn reaper(registry: Arc<ConnectionRegistry>, running: Arc<AtomicBool>) {
    let mut ticker = interval(REAPER_PERIOD);
    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        registry.remove_dead_connections();
    }
}
