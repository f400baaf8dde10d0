//! Keepalive probes over the dedicated tunnel interfaces.
//!
//! On some clouds the first routed TCP connection between the second
//! interfaces of a worker and a pod VM loses the final ACK of its handshake
//! unless a non-routed connection between the two addresses was made before.
//! Each tunnel therefore registers a client that periodically issues
//! `GET /` to its peer, and the worker runs one shared HTTP server that
//! answers `200 OK` to anything.
//!
//! ```text
//!   worker (ppvrf1) ── GET / every 5 min ──▶ pod VM :15150
//!   pod VM          ── GET / every 5 min ──▶ worker :10345 (server bound to ppvrf1)
//! ```
//!
//! The server lives exactly as long as there is at least one worker-side
//! client.

use http_body_util::Empty;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use peerpod_netops::{NetopsError, Ns, io_error};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Port of the shared keepalive server.
pub const DEFAULT_LISTEN_PORT: u16 = 10345;

/// Device the worker-side server and clients bind to.
pub const DEFAULT_VRF_DEVICE: &str = "ppvrf1";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const LISTEN_BACKLOG: i32 = 128;

/// Keepalive errors.
#[derive(Debug, Error)]
pub enum KeepAliveError {
    #[error("keep alive for pod IP {0} is already configured")]
    AlreadyRegistered(String),

    #[error("keep alive for pod IP {0} is not found")]
    NotRegistered(String),

    #[error("failed to listen on {addr} for keep alive: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: NetopsError,
    },

    #[error(transparent)]
    Netops(#[from] NetopsError),

    #[error("keep alive request failed: {0}")]
    Io(#[from] io::Error),

    #[error("keep alive request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid keep alive request: {0}")]
    Request(#[from] hyper::http::Error),
}

pub type Result<T> = std::result::Result<T, KeepAliveError>;

/// Which end of a tunnel a client belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Worker,
    Pod,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker => f.write_str("worker"),
            Self::Pod => f.write_str("pod"),
        }
    }
}

fn client_key(pod_ip: Ipv4Addr, side: Side) -> String {
    format!("{side}:{pod_ip}")
}

/// Keepalive tuning. The defaults are the production values.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Address of the shared server.
    pub listen_addr: SocketAddr,
    /// Pause between two successful probes.
    pub interval: Duration,
    /// Per-probe timeout; a failed probe is retried after it expires.
    pub timeout: Duration,
    /// Device worker-side sockets bind to, `None` to skip binding.
    pub vrf_device: Option<String>,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_LISTEN_PORT)),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            vrf_device: Some(DEFAULT_VRF_DEVICE.to_string()),
        }
    }
}

struct Task {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Task {
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            warn!(error = %e, "Keep alive task panicked");
        }
    }
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, (Side, Task)>,
    server: Option<(SocketAddr, Task)>,
}

impl Registry {
    fn worker_clients(&self) -> usize {
        self.clients
            .values()
            .filter(|(side, _)| *side == Side::Worker)
            .count()
    }
}

/// Registry of keepalive clients and the shared server.
pub struct KeepAlive {
    config: KeepAliveConfig,
    registry: Mutex<Registry>,
}

impl fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAlive")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<Arc<KeepAlive>> = OnceLock::new();

impl KeepAlive {
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Process-wide registry with the default configuration.
    pub fn global() -> Arc<KeepAlive> {
        GLOBAL
            .get_or_init(|| Arc::new(KeepAlive::new(KeepAliveConfig::default())))
            .clone()
    }

    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Start probing `target` from `ns` on behalf of `pod_ip`.
    ///
    /// The first worker-side registration also starts the shared server in
    /// `ns`. Worker-side sockets are bound to the VRF device.
    pub async fn register(&self, ns: &Ns, pod_ip: Ipv4Addr, target: SocketAddr, side: Side) -> Result<()> {
        let key = client_key(pod_ip, side);
        let mut registry = self.registry.lock().await;

        if registry.clients.contains_key(&key) {
            return Err(KeepAliveError::AlreadyRegistered(pod_ip.to_string()));
        }

        let device = match side {
            Side::Worker => self.config.vrf_device.clone(),
            Side::Pod => None,
        };

        let client_ns = Arc::new(ns.try_clone()?);

        if side == Side::Worker && registry.server.is_none() {
            let (addr, task) =
                start_server(client_ns.clone(), self.config.listen_addr, device.clone()).await?;
            registry.server = Some((addr, task));
        }

        let task = start_client(client_ns, target, device, &self.config);
        registry.clients.insert(key, (side, task));

        info!(%pod_ip, %target, %side, "Keep alive registered");
        Ok(())
    }

    /// Stop the client of `pod_ip`, and the server with the last worker-side
    /// client.
    pub async fn deregister(&self, pod_ip: Ipv4Addr, side: Side) -> Result<()> {
        let key = client_key(pod_ip, side);
        let mut registry = self.registry.lock().await;

        let Some((_, task)) = registry.clients.remove(&key) else {
            return Err(KeepAliveError::NotRegistered(pod_ip.to_string()));
        };
        task.stop().await;

        if side == Side::Worker
            && registry.worker_clients() == 0
            && let Some((addr, server)) = registry.server.take()
        {
            server.stop().await;
            info!(%addr, "Keep alive server stopped");
        }

        info!(%pod_ip, %side, "Keep alive deregistered");
        Ok(())
    }

    pub async fn is_registered(&self, pod_ip: Ipv4Addr, side: Side) -> bool {
        self.registry
            .lock()
            .await
            .clients
            .contains_key(&client_key(pod_ip, side))
    }

    /// Local address of the shared server while it runs.
    pub async fn server_addr(&self) -> Option<SocketAddr> {
        self.registry.lock().await.server.as_ref().map(|(addr, _)| *addr)
    }
}

/// Create a TCP socket inside `ns`, optionally bound to `device`.
///
/// Entering the namespace blocks on a helper thread, so it runs on the
/// blocking pool.
async fn socket_in(ns: Arc<Ns>, device: Option<String>) -> peerpod_netops::Result<Socket> {
    tokio::task::spawn_blocking(move || {
        ns.run(|| {
            let socket =
                Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(io_error)?;
            if let Some(device) = &device {
                socket.bind_device(Some(device.as_bytes())).map_err(io_error)?;
            }
            socket.set_nonblocking(true).map_err(io_error)?;
            Ok(socket)
        })
    })
    .await
    .map_err(|e| io_error(io::Error::other(e)))?
}

async fn start_server(
    ns: Arc<Ns>,
    addr: SocketAddr,
    device: Option<String>,
) -> Result<(SocketAddr, Task)> {
    let listen = async {
        let socket = socket_in(ns, device).await?;
        socket.set_reuse_address(true).map_err(io_error)?;
        socket.bind(&SockAddr::from(addr)).map_err(io_error)?;
        socket.listen(LISTEN_BACKLOG).map_err(io_error)?;
        TcpListener::from_std(socket.into()).map_err(io_error)
    };
    let listener = listen
        .await
        .map_err(|source| KeepAliveError::Listen { addr, source })?;
    let local_addr = listener.local_addr().unwrap_or(addr);

    let (stop, mut stopped) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = stopped.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(async move {
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service_fn(respond))
                                .await
                            {
                                debug!(%peer, error = %e, "Keep alive connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Keep alive accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        // Connections left open by peers end with the server
        connections.shutdown().await;
    });

    info!(addr = %local_addr, "Keep alive server started");
    Ok((local_addr, Task { stop, handle }))
}

async fn respond(_req: Request<Incoming>) -> std::result::Result<Response<Empty<Bytes>>, Infallible> {
    Ok(Response::new(Empty::new()))
}

fn start_client(ns: Arc<Ns>, target: SocketAddr, device: Option<String>, config: &KeepAliveConfig) -> Task {
    let interval = config.interval;
    let timeout = config.timeout;
    let (stop, mut stopped) = watch::channel(false);

    let handle = tokio::spawn(async move {
        loop {
            debug!(%target, "Connecting to keep alive server");
            let attempt = tokio::time::timeout(timeout, probe(&ns, target, device.as_deref()));

            let pause = tokio::select! {
                _ = stopped.changed() => break,
                result = attempt => match result {
                    Ok(Ok(status)) => {
                        debug!(%target, %status, "Keep alive probe done");
                        interval
                    }
                    Ok(Err(e)) => {
                        warn!(%target, error = %e, "Failed to connect to a keep alive server");
                        timeout
                    }
                    Err(_) => {
                        warn!(%target, ?timeout, "Keep alive probe timed out");
                        Duration::ZERO
                    }
                },
            };

            tokio::select! {
                _ = stopped.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    });

    Task { stop, handle }
}

/// One `GET /` to `target` from a socket created in `ns`.
pub async fn probe(ns: &Arc<Ns>, target: SocketAddr, device: Option<&str>) -> Result<StatusCode> {
    let socket = socket_in(ns.clone(), device.map(str::to_string)).await?;
    let stream = TcpSocket::from_std_stream(socket.into())
        .connect(target)
        .await?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    let connection = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Keep alive client connection closed");
        }
    });

    let request = Request::builder()
        .uri("/")
        .header(hyper::header::HOST, target.to_string())
        .body(Empty::<Bytes>::new())?;
    let response = sender.send_request(request).await;
    connection.abort();

    Ok(response?.status())
}
