//! Agent protocol forwarder.
//!
//! Accepts TCP connections on the worker-side endpoint and splices each one
//! to the kata agent Unix socket. The agent listens inside the pod network
//! namespace, so every outbound connect happens on a thread that has entered
//! that namespace; the resulting socket keeps working from anywhere.
//!
//! ```text
//!   shim ── TCP :15150 ──► Forwarder ──► ns(pod) ── unix:/run/kata-containers/agent.sock
//! ```

use crate::error::{ForwarderError, Result};
use peerpod_netops::{Ns, io_error};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr as UnixSocketAddr, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

/// Upper bound for one connect attempt; also the pace of retries.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Address of the agent socket.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AgentSocket {
    Path(PathBuf),
    /// Linux abstract socket, written with a leading `@`.
    Abstract(Vec<u8>),
}

impl AgentSocket {
    fn parse(socket: &str) -> Self {
        match socket.strip_prefix('@') {
            // kata agent-ctl expects a trailing NUL in abstract names
            Some(name) => {
                let mut name = name.as_bytes().to_vec();
                name.push(0);
                Self::Abstract(name)
            }
            None => Self::Path(PathBuf::from(socket)),
        }
    }

    fn connect(&self) -> std::io::Result<StdUnixStream> {
        let stream = match self {
            Self::Path(path) => StdUnixStream::connect(path)?,
            Self::Abstract(name) => {
                StdUnixStream::connect_addr(&UnixSocketAddr::from_abstract_name(name)?)?
            }
        };
        stream.set_nonblocking(true)?;
        Ok(stream)
    }
}

/// Opens agent connections, entering the target namespace for the connect
/// only.
#[derive(Debug, Clone)]
pub struct AgentDialer {
    display: String,
    socket: AgentSocket,
    ns_path: Option<PathBuf>,
}

impl AgentDialer {
    /// `ns_path: None` dials from the caller's namespace.
    pub fn new(agent_socket: &str, ns_path: Option<PathBuf>) -> Self {
        Self {
            display: agent_socket.to_string(),
            socket: AgentSocket::parse(agent_socket),
            ns_path,
        }
    }

    pub async fn dial(&self) -> Result<UnixStream> {
        let stream = match &self.ns_path {
            None => self.socket.connect().map_err(io_error),
            Some(path) => self.dial_in(path).await,
        }
        .map_err(|source| self.dial_error(source))?;

        UnixStream::from_std(stream).map_err(|e| self.dial_error(io_error(e)))
    }

    async fn dial_in(&self, path: &Path) -> peerpod_netops::Result<StdUnixStream> {
        let ns = Ns::open(path)?;
        let socket = self.socket.clone();
        tokio::task::spawn_blocking(move || {
            let stream = ns.run(|| socket.connect().map_err(io_error));
            ns.close();
            stream
        })
        .await
        .map_err(|e| io_error(std::io::Error::other(e)))?
    }

    fn dial_error(&self, source: peerpod_netops::NetopsError) -> ForwarderError {
        ForwarderError::Dial {
            socket: self.display.clone(),
            source,
        }
    }
}

/// One forwarder per pod.
pub struct Forwarder {
    dialer: AgentDialer,
    started: AtomicBool,
    stop: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

impl Forwarder {
    pub fn new(agent_socket: &str, ns_path: Option<PathBuf>) -> Self {
        Self::with_dialer(AgentDialer::new(agent_socket, ns_path))
    }

    pub fn with_dialer(dialer: AgentDialer) -> Self {
        Self {
            dialer,
            started: AtomicBool::new(false),
            stop: watch::channel(false).0,
            stopped: watch::channel(false).0,
        }
    }

    /// Accept and forward connections until [`Forwarder::shutdown`] is
    /// called or accepting fails.
    ///
    /// Shutdown closes `listener` and is not reported as an error.
    pub async fn start(&self, listener: TcpListener) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ForwarderError::AlreadyStarted);
        }

        let local_addr = listener.local_addr().ok();
        info!(listen = ?local_addr, agent_socket = self.dialer.display, "Agent protocol forwarder started");

        let mut stop = self.stop.subscribe();
        let mut copies = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Connection accepted");
                        copies.spawn(forward(stream, self.dialer.clone(), self.stop.subscribe()));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept a connection");
                        break Err(ForwarderError::Accept(e));
                    }
                },
                Some(joined) = copies.join_next(), if !copies.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Forwarding task failed");
                    }
                }
            }
        };

        drop(listener);
        self.stop.send_replace(true);
        while let Some(joined) = copies.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Forwarding task failed");
            }
        }
        self.stopped.send_replace(true);

        info!(listen = ?local_addr, "Agent protocol forwarder stopped");
        result
    }

    /// Close the listener, stop all copies and wait for them. Calling it
    /// again is a no-op.
    pub async fn shutdown(&self) {
        if self.stop.send_replace(true) {
            debug!("Agent protocol forwarder is already shut down");
        }
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }
}

/// Splice one accepted connection to a fresh agent connection.
async fn forward(client: TcpStream, dialer: AgentDialer, mut stop: watch::Receiver<bool>) {
    let peer = client.peer_addr().ok();

    let agent = tokio::select! {
        _ = stop.wait_for(|stopped| *stopped) => return,
        agent = dial_with_retry(&dialer) => agent,
    };
    debug!(?peer, agent_socket = dialer.display, "Forwarding connection");

    let (client_read, client_write) = client.into_split();
    let (agent_read, agent_write) = agent.into_split();

    // Dropping the halves of both directions closes both sockets
    tokio::select! {
        _ = stop.wait_for(|stopped| *stopped) => {}
        result = copy(client_read, agent_write) => log_copy("client to agent", result),
        result = copy(agent_read, client_write) => log_copy("agent to client", result),
    }
    debug!(?peer, "Connection closed");
}

/// Retry until connected, one attempt per [`DIAL_TIMEOUT`].
async fn dial_with_retry(dialer: &AgentDialer) -> UnixStream {
    loop {
        let deadline = Instant::now() + DIAL_TIMEOUT;
        let err = match timeout(DIAL_TIMEOUT, dialer.dial()).await {
            Ok(Ok(stream)) => return stream,
            Ok(Err(e)) => e,
            Err(_) => ForwarderError::Timeout {
                socket: dialer.display.clone(),
                timeout: DIAL_TIMEOUT,
            },
        };
        warn!(error = %err, "Failed to connect to agent, retrying");
        sleep_until(deadline).await;
    }
}

async fn copy<R, W>(mut reader: R, mut writer: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

fn log_copy(direction: &str, result: std::io::Result<u64>) {
    match result {
        Ok(bytes) => debug!(direction, bytes, "Copy finished"),
        Err(e) => debug!(direction, error = %e, "Copy failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_abstract_socket() {
        assert_eq!(
            AgentSocket::parse("@/run/kata-containers/agent.sock"),
            AgentSocket::Abstract(b"/run/kata-containers/agent.sock\0".to_vec())
        );
    }

    #[test]
    fn test_parse_path_socket() {
        assert_eq!(
            AgentSocket::parse("/run/kata-containers/agent.sock"),
            AgentSocket::Path(PathBuf::from("/run/kata-containers/agent.sock"))
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let forwarder = Forwarder::new("/nonexistent/agent.sock", None);
        forwarder.shutdown().await;
        forwarder.shutdown().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        forwarder.start(listener).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice() {
        let forwarder = Forwarder::new("/nonexistent/agent.sock", None);
        forwarder.shutdown().await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        forwarder.start(listener).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(
            forwarder.start(listener).await,
            Err(ForwarderError::AlreadyStarted)
        ));
    }
}
