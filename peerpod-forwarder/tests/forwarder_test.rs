//! Forwarder tests against a Unix echo server in the current namespace.

use peerpod_forwarder::{AgentDialer, Forwarder};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Echo every connection back until the peer closes it.
fn echo_server(path: &Path) -> JoinHandle<()> {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    })
}

async fn start_forwarder(
    agent_socket: &Path,
) -> (Arc<Forwarder>, SocketAddr, JoinHandle<peerpod_forwarder::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let forwarder = Arc::new(Forwarder::new(agent_socket.to_str().unwrap(), None));
    let handle = tokio::spawn({
        let forwarder = Arc::clone(&forwarder);
        async move { forwarder.start(listener).await }
    });
    (forwarder, addr, handle)
}

/// Bytes written to the TCP side come back from the echo server unchanged.
#[tokio::test]
async fn test_forwarder_echo() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agent.sock");
    let _echo = echo_server(&socket);

    let (forwarder, addr, handle) = start_forwarder(&socket).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"Hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"Hello");

    forwarder.shutdown().await;
    forwarder.shutdown().await;
    handle.await.unwrap().unwrap();
}

/// Shutdown while accept is blocked ends `start` without an error and
/// closes the listener.
#[tokio::test]
async fn test_shutdown_while_accepting() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agent.sock");

    let (forwarder, addr, handle) = start_forwarder(&socket).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    forwarder.shutdown().await;
    handle.await.unwrap().unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

/// When the agent closes its side, the client connection is closed too.
#[tokio::test]
async fn test_agent_close_closes_client() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agent.sock");
    let agent = UnixListener::bind(&socket).unwrap();

    let (forwarder, addr, handle) = start_forwarder(&socket).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (agent_conn, _) = timeout(Duration::from_secs(5), agent.accept())
        .await
        .unwrap()
        .unwrap();
    drop(agent_conn);

    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(read.is_err() || buf.is_empty());

    forwarder.shutdown().await;
    handle.await.unwrap().unwrap();
}

/// Shutdown stops a connection that is still waiting for the agent.
#[tokio::test]
async fn test_shutdown_during_dial_retry() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("missing.sock");

    let (forwarder, addr, handle) = start_forwarder(&socket).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    timeout(Duration::from_secs(5), forwarder.shutdown())
        .await
        .unwrap();
    handle.await.unwrap().unwrap();

    let mut buf = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
        .await
        .unwrap();
    assert!(buf.is_empty());
}

/// A missing socket is a dial error naming the socket.
#[tokio::test]
async fn test_dial_missing_socket() {
    let dialer = AgentDialer::new("/nonexistent/agent.sock", None);
    let err = dialer.dial().await.unwrap_err();
    assert!(err.to_string().contains("/nonexistent/agent.sock"), "{err}");
}
