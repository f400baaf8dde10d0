//! Agent protocol forwarder for peer pods.
//!
//! Runs in the pod VM next to the kata agent. [`Forwarder`] splices TCP
//! connections from the worker to the agent's Unix socket inside the pod
//! network namespace; [`Daemon`] sets up the pod network first and tears it
//! down on exit.

pub mod daemon;
pub mod error;
pub mod forwarder;

pub use daemon::{Daemon, DaemonConfig};
pub use error::{ForwarderError, Result};
pub use forwarder::{AgentDialer, Forwarder};
