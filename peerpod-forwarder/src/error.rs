//! Forwarder and daemon error types.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("failed to accept a connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("failed to connect to agent socket {socket}: {source}")]
    Dial {
        socket: String,
        #[source]
        source: peerpod_netops::NetopsError,
    },

    #[error("connecting to agent socket {socket} timed out after {timeout:?}")]
    Timeout { socket: String, timeout: Duration },

    #[error("forwarder is already started")]
    AlreadyStarted,

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read daemon config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode daemon config {path}: {source}")]
    ConfigDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Tunnel(#[from] peerpod_tunnel::TunnelError),
}

/// Result type for forwarder operations.
pub type Result<T> = std::result::Result<T, ForwarderError>;
