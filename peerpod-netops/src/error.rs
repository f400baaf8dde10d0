//! Error types for namespace operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of a [`NetopsError`], independent of its context chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Busy,
    Permission,
    Invalid,
    Io,
    Kernel(i32),
    Timeout,
    Cancelled,
}

/// Errors that can occur while manipulating a network namespace.
#[derive(Debug, Error)]
pub enum NetopsError {
    /// Object (link, route, rule, namespace) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Device or resource busy.
    #[error("resource busy: {0}")]
    Busy(String),

    /// Missing privileges (usually CAP_NET_ADMIN or CAP_SYS_ADMIN).
    #[error("permission denied: {0}")]
    Permission(String),

    /// Invalid argument or precondition.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Namespace path outside of /run/netns.
    #[error("unsupported namespace path: {}", .0.display())]
    UnsupportedPath(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Any other errno reported by the kernel.
    #[error("kernel error {code}: {message}")]
    Kernel { code: i32, message: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An error wrapped with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<NetopsError>,
    },
}

/// Result type for namespace operations.
pub type Result<T> = std::result::Result<T, NetopsError>;

impl NetopsError {
    /// Map a positive errno value to the matching error kind.
    pub fn from_errno(errno: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match errno {
            libc::EEXIST => Self::AlreadyExists(message),
            libc::ENOENT | libc::ESRCH | libc::ENODEV | libc::EADDRNOTAVAIL => {
                Self::NotFound(message)
            }
            libc::EBUSY => Self::Busy(message),
            libc::EPERM | libc::EACCES => Self::Permission(message),
            libc::EINVAL | libc::ERANGE => Self::Invalid(message),
            libc::ETIMEDOUT => Self::Timeout(message),
            code => Self::Kernel { code, message },
        }
    }

    /// Wrap this error with a description of the failed operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Invalid(_) | Self::UnsupportedPath(_) => ErrorKind::Invalid,
            Self::Io(_) => ErrorKind::Io,
            Self::Kernel { code, .. } => ErrorKind::Kernel(*code),
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Context { source, .. } => source.kind(),
        }
    }

    pub fn is_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True when the kernel answered with ENETUNREACH.
    pub fn is_unreachable(&self) -> bool {
        self.kind() == ErrorKind::Kernel(libc::ENETUNREACH)
    }
}

impl From<rtnetlink::Error> for NetopsError {
    fn from(err: rtnetlink::Error) -> Self {
        match err {
            rtnetlink::Error::NetlinkError(ref e) => {
                Self::from_errno(-e.raw_code(), err.to_string())
            }
            other => Self::Kernel {
                code: 0,
                message: other.to_string(),
            },
        }
    }
}

impl From<nix::Error> for NetopsError {
    fn from(errno: nix::Error) -> Self {
        Self::from_errno(errno as i32, errno.desc())
    }
}

/// Extension trait to attach context to results.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<NetopsError>,
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

/// Convert an I/O error, keeping the errno classification when there is one.
pub fn io_error(err: io::Error) -> NetopsError {
    match err.raw_os_error() {
        Some(errno) => NetopsError::from_errno(errno, err.to_string()),
        None => NetopsError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(
            NetopsError::from_errno(libc::EEXIST, "x").kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            NetopsError::from_errno(libc::ENODEV, "x").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            NetopsError::from_errno(libc::EBUSY, "x").kind(),
            ErrorKind::Busy
        );
        assert_eq!(
            NetopsError::from_errno(libc::EPERM, "x").kind(),
            ErrorKind::Permission
        );
        assert_eq!(
            NetopsError::from_errno(libc::ENETUNREACH, "x").kind(),
            ErrorKind::Kernel(libc::ENETUNREACH)
        );
    }

    #[test]
    fn test_context_chain_keeps_kind() {
        let err = NetopsError::from_errno(libc::EEXIST, "File exists")
            .context("failed to add link ppveth0")
            .context("failed to set up routing tunnel on /run/netns/pod");

        assert!(err.is_exists());
        let message = err.to_string();
        assert!(message.starts_with("failed to set up routing tunnel on /run/netns/pod"));
        assert!(message.contains("failed to add link ppveth0"));
        assert!(message.contains("File exists"));
    }

    #[test]
    fn test_io_error_classification() {
        let err = io_error(io::Error::from_raw_os_error(libc::ENOENT));
        assert!(err.is_not_found());

        let err = io_error(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
