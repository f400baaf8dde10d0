//! Pod network orchestration on top of the tunnelers.
//!
//! [`WorkerNode`] runs on the Kubernetes worker: it inspects a pod network
//! namespace into a tunnel [`Config`], then sets up or tears down the worker
//! half of the tunnel. [`PodNode`] runs in the pod VM with the config it
//! received from the worker.

use crate::error::{Context, Result, TunnelError};
use crate::tunneler::{
    self, Config, DEFAULT_VXLAN_MIN_ID, DEFAULT_VXLAN_PORT, Route, TunnelType, Tunneler,
    open_host, open_pod, routing, vxlan,
};
use ipnet::Ipv4Net;
use peerpod_netops::Ns;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DETECT_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const DETECT_INTERVAL: Duration = Duration::from_secs(1);

static POD_INDEX: AtomicU32 = AtomicU32::new(0);

/// Per-process pod counter, used to derive VXLAN ids.
fn next_pod_index() -> u32 {
    POD_INDEX.fetch_add(1, Ordering::Relaxed)
}

/// Worker node settings.
#[derive(Debug, Clone)]
pub struct WorkerNodeConfig {
    pub tunnel_type: TunnelType,
    /// Interface carrying tunnel traffic; the primary interface when unset.
    pub host_interface: Option<String>,
    pub vxlan_port: u16,
    pub vxlan_min_id: u32,
    /// Extra pod subnets routed through the pod gateway.
    pub pod_subnet_cidrs: Vec<Ipv4Net>,
}

impl Default for WorkerNodeConfig {
    fn default() -> Self {
        Self {
            tunnel_type: TunnelType::default(),
            host_interface: None,
            vxlan_port: DEFAULT_VXLAN_PORT,
            vxlan_min_id: DEFAULT_VXLAN_MIN_ID,
            pod_subnet_cidrs: Vec::new(),
        }
    }
}

/// Worker side of the pod network.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    config: WorkerNodeConfig,
    host_ns: Option<PathBuf>,
}

impl WorkerNode {
    pub fn new(config: WorkerNodeConfig) -> Self {
        Self {
            config,
            host_ns: None,
        }
    }

    /// Treat the namespace at `path` as the worker host namespace.
    pub fn with_host_namespace(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_ns = Some(path.into());
        self
    }

    fn tunneler(&self) -> Box<dyn Tunneler> {
        match (&self.host_ns, self.config.tunnel_type) {
            (None, tunnel_type) => tunneler::worker_node_tunneler(tunnel_type),
            (Some(path), TunnelType::Vxlan) => {
                Box::new(vxlan::WorkerNodeTunneler::with_host_namespace(path))
            }
            (Some(path), TunnelType::Routing) => {
                Box::new(routing::WorkerNodeTunneler::with_host_namespace(path))
            }
        }
    }

    /// Build the tunnel config of the pod whose network namespace is at
    /// `ns_path`.
    pub async fn inspect(&self, ns_path: &Path) -> Result<Config> {
        let index = next_pod_index();
        let host_ns = open_host(self.host_ns.as_deref())?;

        let primary = host_ns
            .primary_interface()
            .await
            .context("failed to identify the host primary interface")?;
        let (host_interface, dedicated) = match &self.config.host_interface {
            Some(interface) => (interface.clone(), *interface != primary),
            None => (primary, false),
        };

        let addrs = host_ns
            .link_find(&host_interface)
            .await?
            .addresses()
            .await
            .with_context(|| {
                format!(
                    "failed to get IP address on {host_interface} (netns: {})",
                    host_ns.path().display()
                )
            })?;
        let Some(worker_node_ip) = addrs.first().copied() else {
            return Err(TunnelError::Config(format!(
                "no IP address assigned on {host_interface} (netns: {})",
                host_ns.path().display()
            )));
        };
        if addrs.len() > 1 {
            warn!(host_interface, ?addrs, %worker_node_ip, "More than one IP address assigned, using the first");
        }

        let pod_ns = open_pod(ns_path)?;
        let (pod_ip, pod_interface) = pod_ns.detect_pod_net().await.with_context(|| {
            format!(
                "failed to identify destination interface of default gateway on network namespace {}",
                ns_path.display()
            )
        })?;

        let pod_link = pod_ns.link_find(&pod_interface).await?;
        let pod_hw_addr = pod_link.hw_addr().ok_or_else(|| {
            TunnelError::Config(format!(
                "failed to get Mac address for Pod interface {pod_interface}"
            ))
        })?;

        let routes: Vec<Route> = pod_ns
            .get_routes()
            .await
            .with_context(|| format!("failed to get routes on {}", ns_path.display()))?
            .iter()
            .map(Route::from)
            .collect();

        let mut config = Config {
            pod_ip,
            pod_hw_addr: Some(pod_hw_addr),
            interface_name: pod_interface.clone(),
            worker_node_ip,
            tunnel_type: self.config.tunnel_type,
            routes,
            mtu: pod_link.mtu(),
            index,
            dedicated,
            ..Default::default()
        };

        if let Some(gateway) = config.default_gateway() {
            for cidr in &self.config.pod_subnet_cidrs {
                if config.routes.iter().any(|route| route.dst == Some(*cidr)) {
                    continue;
                }
                config.routes.push(Route {
                    dst: Some(*cidr),
                    gw: Some(gateway),
                    dev: pod_interface.clone(),
                    ..Default::default()
                });
            }
        } else if !self.config.pod_subnet_cidrs.is_empty() {
            warn!(ns = %ns_path.display(), "No pod gateway, pod subnet routes skipped");
        }

        if self.config.tunnel_type == TunnelType::Vxlan {
            config.vxlan_port = Some(self.config.vxlan_port);
            config.vxlan_id = Some(self.config.vxlan_min_id + index);
        }

        info!(
            ns = %ns_path.display(),
            pod_ip = %config.pod_ip,
            interface = config.interface_name,
            worker_node_ip = %config.worker_node_ip,
            tunnel_type = %config.tunnel_type,
            dedicated,
            index,
            "Pod network inspected"
        );
        Ok(config)
    }

    pub async fn setup(&self, ns_path: &Path, peer_ips: &[Ipv4Addr], config: &Config) -> Result<()> {
        self.tunneler()
            .setup(ns_path, peer_ips, config)
            .await
            .with_context(|| format!("failed to set up tunnel {:?}", config.tunnel_type.as_str()))
    }

    pub async fn teardown(&self, ns_path: &Path, config: &Config) -> Result<()> {
        let host_interface = match &self.config.host_interface {
            Some(interface) => interface.clone(),
            None => {
                let host_ns = open_host(self.host_ns.as_deref())?;
                host_ns
                    .primary_interface()
                    .await
                    .context("failed to identify the host primary interface")?
            }
        };

        self.tunneler()
            .teardown(ns_path, &host_interface, config)
            .await
            .with_context(|| format!("failed to tear down tunnel {:?}", config.tunnel_type.as_str()))
    }
}

/// Pod VM side of the pod network.
#[derive(Debug, Clone)]
pub struct PodNode {
    ns_path: PathBuf,
    host_interface: Option<String>,
    config: Config,
    host_ns: Option<PathBuf>,
    detect_timeout: Duration,
}

impl PodNode {
    pub fn new(ns_path: impl Into<PathBuf>, host_interface: Option<String>, config: Config) -> Self {
        Self {
            ns_path: ns_path.into(),
            host_interface,
            config,
            host_ns: None,
            detect_timeout: DETECT_TIMEOUT,
        }
    }

    /// Treat the namespace at `path` as the pod VM host namespace.
    pub fn with_host_namespace(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_ns = Some(path.into());
        self
    }

    /// How long to wait for the host interfaces to get their addresses.
    pub fn with_detect_timeout(mut self, timeout: Duration) -> Self {
        self.detect_timeout = timeout;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn tunneler(&self) -> Box<dyn Tunneler> {
        match (&self.host_ns, self.config.tunnel_type) {
            (None, tunnel_type) => tunneler::pod_node_tunneler(tunnel_type),
            (Some(path), TunnelType::Vxlan) => {
                Box::new(vxlan::PodNodeTunneler::with_host_namespace(path))
            }
            (Some(path), TunnelType::Routing) => {
                Box::new(routing::PodNodeTunneler::with_host_namespace(path))
            }
        }
    }

    pub async fn setup(&self) -> Result<()> {
        let host_ns = open_host(self.host_ns.as_deref())?;

        let primary = detect_primary_interface(&host_ns, self.detect_timeout).await?;
        let mut peer_ips = vec![detect_ip(&host_ns, &primary, self.detect_timeout).await?];

        let host_interface = self.host_interface.clone().unwrap_or_else(|| primary.clone());
        if self.config.dedicated {
            if host_interface == primary {
                return Err(TunnelError::Config(format!(
                    "{host_interface} is not a dedicated interface"
                )));
            }
            peer_ips.push(detect_ip(&host_ns, &host_interface, self.detect_timeout).await?);
        }

        info!(ns = %self.ns_path.display(), ?peer_ips, tunnel_type = %self.config.tunnel_type, "Setting up pod network");

        self.tunneler()
            .setup(&self.ns_path, &peer_ips, &self.config)
            .await
            .with_context(|| format!("failed to set up tunnel {:?}", self.config.tunnel_type.as_str()))
    }

    pub async fn teardown(&self) -> Result<()> {
        let host_interface = match &self.host_interface {
            Some(interface) => interface.clone(),
            None => {
                let host_ns = open_host(self.host_ns.as_deref())?;
                host_ns
                    .primary_interface()
                    .await
                    .context("failed to identify the host primary interface")?
            }
        };

        self.tunneler()
            .teardown(&self.ns_path, &host_interface, &self.config)
            .await
            .with_context(|| format!("failed to tear down tunnel {:?}", self.config.tunnel_type.as_str()))
    }
}

/// Wait until the host has a default route.
async fn detect_primary_interface(ns: &Ns, timeout: Duration) -> Result<String> {
    let deadline = Instant::now() + timeout;
    loop {
        match ns.primary_interface().await {
            Ok(interface) => return Ok(interface),
            Err(e) if Instant::now() < deadline => {
                debug!(error = %e, "Failed to identify the host primary interface, retrying");
            }
            Err(_) => {
                return Err(TunnelError::Timeout(format!(
                    "failed to identify primary interface on netns {}",
                    ns.path().display()
                )));
            }
        }
        tokio::time::sleep(DETECT_INTERVAL).await;
    }
}

/// Wait until `interface` has exactly one IPv4 address.
async fn detect_ip(ns: &Ns, interface: &str, timeout: Duration) -> Result<Ipv4Addr> {
    let deadline = Instant::now() + timeout;
    loop {
        let addrs = ns
            .link_find(interface)
            .await?
            .addresses()
            .await
            .with_context(|| {
                format!(
                    "failed to get addresses assigned {interface} on netns {}",
                    ns.path().display()
                )
            })?;

        match addrs.as_slice() {
            [addr] => return Ok(addr.addr()),
            [] if Instant::now() < deadline => {
                debug!(interface, "No IP address assigned yet, retrying");
            }
            [] => {
                return Err(TunnelError::Timeout(format!(
                    "failed to identify IP address assigned to host interface {interface} on netns {}",
                    ns.path().display()
                )));
            }
            _ => {
                return Err(TunnelError::Config(format!(
                    "more than one IP address assigned on {interface} (netns: {})",
                    ns.path().display()
                )));
            }
        }
        tokio::time::sleep(DETECT_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_index_increments() {
        let first = next_pod_index();
        let second = next_pod_index();
        assert!(second > first);
    }

    #[test]
    fn test_worker_node_defaults() {
        let config = WorkerNodeConfig::default();
        assert_eq!(config.tunnel_type, TunnelType::Vxlan);
        assert_eq!(config.vxlan_port, 4789);
        assert_eq!(config.vxlan_min_id, 555000);
        assert!(config.host_interface.is_none());
    }
}
