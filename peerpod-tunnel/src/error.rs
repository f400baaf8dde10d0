//! Tunnel error types.

use crate::iptables::IptablesError;
use crate::keepalive::KeepAliveError;
use peerpod_netops::{ErrorKind, NetopsError};
use thiserror::Error;

/// Errors returned by tunnelers and pod network orchestration.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Netops(#[from] NetopsError),

    #[error(transparent)]
    Iptables(#[from] IptablesError),

    #[error(transparent)]
    KeepAlive(#[from] KeepAliveError),

    /// The tunnel configuration or peer addresses cannot be used.
    #[error("invalid config: {0}")]
    Config(String),

    #[error("unknown tunnel type: {0:?}")]
    UnknownTunnelType(String),

    /// A step that gave up waiting for the host to settle.
    #[error("timed out: {0}")]
    Timeout(String),

    /// An error wrapped with the step that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<TunnelError>,
    },
}

/// Result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Kernel error kind at the root of the chain, if any.
    pub fn netops_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Netops(e) => Some(e.kind()),
            Self::Context { source, .. } => source.netops_kind(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.netops_kind() == Some(ErrorKind::NotFound)
    }
}

/// Extension trait to attach a step description to results.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<TunnelError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}
