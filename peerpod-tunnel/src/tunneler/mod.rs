//! Tunnelers reshape a pod network namespace so that traffic for the pod IP
//! is carried to and from a remote pod VM.
//!
//! Every tunnel type has two halves: the worker node side, which runs next to
//! the pod network namespace on the Kubernetes worker, and the pod node side,
//! which runs inside the remote VM.

pub mod routing;
pub mod vxlan;

use crate::error::{Context, Result, TunnelError};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use peerpod_netops::{MacAddr, Ns, RouteProtocol, RouteScope};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default VXLAN UDP port.
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// Default first VXLAN network identifier handed out to pods.
pub const DEFAULT_VXLAN_MIN_ID: u32 = 555000;

/// Sets up and tears down the tunnel of one pod.
#[async_trait]
pub trait Tunneler: Send + Sync {
    /// Reshape the pod network namespace at `ns_path`.
    ///
    /// `peer_ips` are the addresses of the pod VM: the primary one first,
    /// then the address on the dedicated subnet when there is one.
    async fn setup(&self, ns_path: &Path, peer_ips: &[Ipv4Addr], config: &Config) -> Result<()>;

    /// Undo [`Tunneler::setup`]. `host_interface` is the worker interface
    /// that carries tunnel traffic.
    async fn teardown(&self, ns_path: &Path, host_interface: &str, config: &Config) -> Result<()>;
}

/// Supported tunnel types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    #[default]
    Vxlan,
    Routing,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vxlan => "vxlan",
            Self::Routing => "routing",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelType {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vxlan" => Ok(Self::Vxlan),
            "routing" => Ok(Self::Routing),
            other => Err(TunnelError::UnknownTunnelType(other.to_string())),
        }
    }
}

/// Worker node half of `tunnel_type`.
pub fn worker_node_tunneler(tunnel_type: TunnelType) -> Box<dyn Tunneler> {
    match tunnel_type {
        TunnelType::Vxlan => Box::new(vxlan::WorkerNodeTunneler::new()),
        TunnelType::Routing => Box::new(routing::WorkerNodeTunneler::new()),
    }
}

/// Pod node half of `tunnel_type`.
pub fn pod_node_tunneler(tunnel_type: TunnelType) -> Box<dyn Tunneler> {
    match tunnel_type {
        TunnelType::Vxlan => Box::new(vxlan::PodNodeTunneler::new()),
        TunnelType::Routing => Box::new(routing::PodNodeTunneler::new()),
    }
}

/// Per-pod tunnel configuration, exchanged as JSON between the worker and
/// the pod VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Pod IP with the prefix length of the pod network.
    #[serde(rename = "podip")]
    pub pod_ip: Ipv4Net,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_hw_addr: Option<MacAddr>,

    /// Pod interface in the pod network namespace (usually `eth0`).
    #[serde(rename = "interface")]
    pub interface_name: String,

    /// Worker address on the tunnel-carrying interface.
    pub worker_node_ip: Ipv4Net,

    pub tunnel_type: TunnelType,

    #[serde(default)]
    pub routes: Vec<Route>,

    pub mtu: u32,

    /// Per-process pod counter assigned at inspection time.
    #[serde(default)]
    pub index: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxlan_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxlan_id: Option<u32>,

    /// Tunnel over the pod VM's second address on a dedicated subnet.
    #[serde(default)]
    pub dedicated: bool,
}

impl Config {
    /// Gateway of the first default route, if any.
    pub fn default_gateway(&self) -> Option<Ipv4Addr> {
        self.routes
            .iter()
            .find(|route| route.is_default())
            .and_then(|route| route.gw)
    }
}

/// A pod route as carried in [`Config`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// `None` is the default route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<Ipv4Net>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dev: String,

    #[serde(default)]
    pub protocol: RouteProtocol,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<RouteScope>,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.dst.is_none_or(|dst| dst.prefix_len() == 0)
    }

    /// Kernel route through `device` in the main table.
    pub fn to_netops(&self, device: &str) -> peerpod_netops::Route {
        peerpod_netops::Route {
            destination: self.dst.filter(|dst| dst.prefix_len() > 0),
            gateway: self.gw,
            device: Some(device.to_string()),
            protocol: self.protocol,
            scope: self.scope,
            ..Default::default()
        }
    }
}

impl From<&peerpod_netops::Route> for Route {
    fn from(route: &peerpod_netops::Route) -> Self {
        Self {
            dst: route.destination,
            gw: route.gateway,
            dev: route.device.clone().unwrap_or_default(),
            protocol: route.protocol,
            scope: route.scope,
        }
    }
}

/// Routes without a gateway first, so that gateways are reachable by the
/// time the routes using them are added.
pub fn ordered_routes(routes: &[Route]) -> Vec<&Route> {
    let (direct, via): (Vec<&Route>, Vec<&Route>) =
        routes.iter().partition(|route| route.gw.is_none());
    direct.into_iter().chain(via).collect()
}

/// Replay `routes` on `device` inside `ns`.
pub(crate) async fn add_routes(ns: &Ns, routes: &[Route], device: &str) -> Result<()> {
    for route in ordered_routes(routes) {
        let route = route.to_netops(device);
        ns.route_add(&route)
            .await
            .with_context(|| format!("failed to add a route on pod network namespace {}", ns.path().display()))?;
    }
    Ok(())
}

/// Pod VM address that terminates the tunnel.
pub fn select_endpoint(peer_ips: &[Ipv4Addr], dedicated: bool) -> Result<Ipv4Addr> {
    match (peer_ips, dedicated) {
        ([], _) => Err(TunnelError::Config("pod node has no IPs".to_string())),
        ([_], true) => Err(TunnelError::Config(
            "dedicated tunnel missing destination address".to_string(),
        )),
        ([_, second, ..], true) => Ok(*second),
        ([first, ..], false) => Ok(*first),
    }
}

/// Namespace the tunneler treats as the host: `path` when given, otherwise
/// the namespace of the calling thread.
pub(crate) fn open_host(path: Option<&Path>) -> Result<Ns> {
    let ns = match path {
        Some(path) => Ns::open(path),
        None => Ns::open_current(),
    };
    ns.context("failed to open the host network namespace")
}

pub(crate) fn open_pod(ns_path: &Path) -> Result<Ns> {
    Ns::open(ns_path)
        .with_context(|| format!("failed to open pod network namespace {}", ns_path.display()))
}

/// Worker-side host network namespace selection shared by tunnelers.
#[derive(Debug, Clone, Default)]
pub(crate) struct HostNamespace(Option<PathBuf>);

impl HostNamespace {
    pub(crate) fn at(path: impl Into<PathBuf>) -> Self {
        Self(Some(path.into()))
    }

    pub(crate) fn open(&self) -> Result<Ns> {
        open_host(self.0.as_deref())
    }
}
