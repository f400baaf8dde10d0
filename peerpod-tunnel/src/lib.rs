//! Peer-pod tunnels.
//!
//! A peer pod keeps its network namespace on the Kubernetes worker while its
//! containers run in a remote VM. This crate connects the two:
//!
//! - [`tunneler`]: the VXLAN and routing tunnel strategies, each with a
//!   worker and a pod VM half
//! - [`podnetwork`]: inspection of a pod network namespace into a tunnel
//!   [`Config`] and the worker/pod VM entry points
//! - [`iptables`]: conntrack bypass rules for the routing tunnel
//! - [`keepalive`]: HTTP probes that keep the routing tunnel paths warm

pub mod error;
pub mod iptables;
pub mod keepalive;
pub mod podnetwork;
pub mod tunneler;

pub use error::{Context, Result, TunnelError};
pub use keepalive::{KeepAlive, KeepAliveConfig, KeepAliveError, Side};
pub use podnetwork::{PodNode, WorkerNode, WorkerNodeConfig};
pub use tunneler::{
    Config, Route, TunnelType, Tunneler, pod_node_tunneler, worker_node_tunneler,
};
