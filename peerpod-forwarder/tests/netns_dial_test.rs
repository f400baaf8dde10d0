//! Dialing an abstract agent socket that only exists inside a namespace.
//!
//! Requires root - run with:
//!   sudo -E cargo test --package peerpod-forwarder --test netns_dial_test --features test-util

use peerpod_forwarder::{AgentDialer, Forwarder};
use peerpod_netops::test_util::{TestNamespace, is_root};
use peerpod_netops::io_error;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr as UnixSocketAddr, UnixListener as StdUnixListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::time::timeout;

/// Bind `@<name>` inside `ns`; abstract sockets are scoped to the network
/// namespace.
fn abstract_listener(ns: &TestNamespace, name: &str) -> UnixListener {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    let listener = ns
        .run(|| {
            let addr = UnixSocketAddr::from_abstract_name(&bytes).map_err(io_error)?;
            let listener = StdUnixListener::bind_addr(&addr).map_err(io_error)?;
            listener.set_nonblocking(true).map_err(io_error)?;
            Ok(listener)
        })
        .unwrap();
    UnixListener::from_std(listener).unwrap()
}

/// The socket is reachable through the namespace and not from outside it.
#[tokio::test]
async fn test_dial_in_namespace() {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let ns = TestNamespace::create("ppfwd-dial").unwrap();
    let agent = abstract_listener(&ns, "peerpod-dial-test");

    let outside = AgentDialer::new("@peerpod-dial-test", None);
    assert!(outside.dial().await.is_err());

    let inside = AgentDialer::new("@peerpod-dial-test", Some(ns.path().to_path_buf()));
    let _stream = inside.dial().await.unwrap();
    timeout(Duration::from_secs(5), agent.accept())
        .await
        .unwrap()
        .unwrap();
}

/// End-to-end echo through a forwarder dialing into the namespace.
#[tokio::test]
async fn test_forward_into_namespace() {
    if !is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let ns = TestNamespace::create("ppfwd-echo").unwrap();
    let agent = abstract_listener(&ns, "peerpod-echo-test");
    tokio::spawn(async move {
        let (mut stream, _) = agent.accept().await.unwrap();
        let (mut read, mut write) = stream.split();
        let _ = tokio::io::copy(&mut read, &mut write).await;
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let forwarder = Arc::new(Forwarder::new(
        "@peerpod-echo-test",
        Some(ns.path().to_path_buf()),
    ));
    let handle = tokio::spawn({
        let forwarder = Arc::clone(&forwarder);
        async move { forwarder.start(listener).await }
    });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"Hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"Hello");

    forwarder.shutdown().await;
    handle.await.unwrap().unwrap();
}
