//! VXLAN tunneler.
//!
//! On the worker a VXLAN device is created in the host namespace (so its
//! UDP socket lives there), moved into the pod network namespace as
//! `vxlan1`, and spliced to the pod interface with tc redirects in both
//! directions. On the pod VM the matching `vxlan0` device takes over the pod
//! IP and MAC.

use super::{
    Config, DEFAULT_VXLAN_PORT, HostNamespace, Tunneler, add_routes, open_pod, select_endpoint,
};
use crate::error::{Context, Result, TunnelError};
use async_trait::async_trait;
use peerpod_netops::LinkKind;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const HOST_VXLAN_PREFIX: &str = "ppvxlan";

/// Highest `ppvxlanN` index tried on the worker host.
const MAX_HOST_VXLAN_INDEX: u32 = 5;

/// VXLAN device name inside the worker's pod network namespace.
const WORKER_POD_INTERFACE: &str = "vxlan1";

/// VXLAN device name created on the pod VM.
const POD_VXLAN_INTERFACE: &str = "vxlan0";

const MAX_MTU: u32 = 1450;

#[derive(Debug, Default)]
pub struct WorkerNodeTunneler {
    host: HostNamespace,
}

impl WorkerNodeTunneler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the namespace at `path` as the worker host namespace.
    pub fn with_host_namespace(path: impl Into<PathBuf>) -> Self {
        Self {
            host: HostNamespace::at(path),
        }
    }
}

#[async_trait]
impl Tunneler for WorkerNodeTunneler {
    async fn setup(&self, ns_path: &Path, peer_ips: &[Ipv4Addr], config: &Config) -> Result<()> {
        let remote = select_endpoint(peer_ips, config.dedicated)?;
        let vni = config
            .vxlan_id
            .ok_or_else(|| TunnelError::Config("vxlan-id is not set".to_string()))?;
        let port = config.vxlan_port.unwrap_or(DEFAULT_VXLAN_PORT);

        let host_ns = self.host.open()?;
        let pod_ns = open_pod(ns_path)?;

        let taken: HashSet<String> = host_ns
            .link_list()
            .await
            .context("failed to get interfaces on host")?
            .into_iter()
            .map(|link| link.name().to_string())
            .collect();

        let mut created = None;
        for index in 1..=MAX_HOST_VXLAN_INDEX {
            let name = format!("{HOST_VXLAN_PREFIX}{index}");
            if taken.contains(&name) {
                continue;
            }

            let kind = LinkKind::Vxlan {
                group: remote,
                vni,
                port,
            };
            match host_ns.link_add(&name, kind).await {
                Ok(link) => {
                    info!(name, %remote, port, vni, host = %host_ns.path().display(), "VXLAN interface created");
                    created = Some(link);
                    break;
                }
                Err(e) if e.is_exists() => {
                    debug!(name, "VXLAN interface name taken, trying next");
                }
                Err(e) => {
                    return Err(TunnelError::from(e)
                        .context(format!("failed to add vxlan interface {name}")));
                }
            }
        }
        let Some(host_link) = created else {
            return Err(TunnelError::Config(format!(
                "failed to create vxlan interface: {HOST_VXLAN_PREFIX}1..{HOST_VXLAN_PREFIX}{MAX_HOST_VXLAN_INDEX} are all in use"
            )));
        };
        let host_name = host_link.name().to_string();

        let mut pod_link = host_link.set_namespace(&pod_ns).await.with_context(|| {
            format!(
                "failed to move vxlan interface {host_name} to netns {}",
                ns_path.display()
            )
        })?;
        pod_link
            .set_name(WORKER_POD_INTERFACE)
            .await
            .with_context(|| {
                format!(
                    "failed to change vxlan interface name {host_name} on netns {} to {WORKER_POD_INTERFACE}",
                    ns_path.display()
                )
            })?;
        pod_link.set_up().await?;

        let pod_interface = config.interface_name.as_str();
        info!(
            pod_interface,
            vxlan = WORKER_POD_INTERFACE,
            ns = %ns_path.display(),
            "Adding tc redirect filters"
        );

        pod_ns
            .redirect_add(pod_interface, WORKER_POD_INTERFACE)
            .await
            .with_context(|| {
                format!("failed to add a tc redirect filter from {pod_interface} to {WORKER_POD_INTERFACE}")
            })?;
        pod_ns
            .redirect_add(WORKER_POD_INTERFACE, pod_interface)
            .await
            .with_context(|| {
                format!("failed to add a tc redirect filter from {WORKER_POD_INTERFACE} to {pod_interface}")
            })?;

        Ok(())
    }

    async fn teardown(&self, ns_path: &Path, _host_interface: &str, config: &Config) -> Result<()> {
        let pod_ns = open_pod(ns_path)?;
        let pod_interface = config.interface_name.as_str();

        info!(pod_interface, ns = %ns_path.display(), "Deleting tc redirect filters");

        for (src, dst) in [
            (pod_interface, WORKER_POD_INTERFACE),
            (WORKER_POD_INTERFACE, pod_interface),
        ] {
            match pod_ns.redirect_del(src).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!(src, "Link already gone"),
                Err(e) => {
                    return Err(TunnelError::from(e)
                        .context(format!("failed to delete a tc redirect filter from {src} to {dst}")));
                }
            }
        }

        match pod_ns.link_find(WORKER_POD_INTERFACE).await {
            Ok(link) => link.delete().await.with_context(|| {
                format!(
                    "failed to delete vxlan interface {WORKER_POD_INTERFACE} at {}",
                    ns_path.display()
                )
            })?,
            Err(e) if e.is_not_found() => {
                debug!(name = WORKER_POD_INTERFACE, "VXLAN interface already deleted");
            }
            Err(e) => return Err(e.into()),
        }

        info!(ns = %ns_path.display(), "VXLAN tunnel torn down");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PodNodeTunneler {
    host: HostNamespace,
}

impl PodNodeTunneler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the namespace at `path` as the pod VM host namespace.
    pub fn with_host_namespace(path: impl Into<PathBuf>) -> Self {
        Self {
            host: HostNamespace::at(path),
        }
    }
}

#[async_trait]
impl Tunneler for PodNodeTunneler {
    async fn setup(&self, ns_path: &Path, _peer_ips: &[Ipv4Addr], config: &Config) -> Result<()> {
        let vni = config
            .vxlan_id
            .ok_or_else(|| TunnelError::Config("vxlan-id is not set".to_string()))?;
        let port = config.vxlan_port.unwrap_or(DEFAULT_VXLAN_PORT);
        let node_ip = config.worker_node_ip.addr();

        let host_ns = self.host.open()?;
        let pod_ns = open_pod(ns_path)?;

        let kind = LinkKind::Vxlan {
            group: node_ip,
            vni,
            port,
        };
        let host_link = host_ns
            .link_add(POD_VXLAN_INTERFACE, kind)
            .await
            .with_context(|| format!("failed to add vxlan interface {POD_VXLAN_INTERFACE}"))?;

        let mut link = host_link.set_namespace(&pod_ns).await.with_context(|| {
            format!(
                "failed to move vxlan interface {POD_VXLAN_INTERFACE} to netns {}",
                ns_path.display()
            )
        })?;

        if !config.interface_name.is_empty() && config.interface_name != POD_VXLAN_INTERFACE {
            link.set_name(&config.interface_name).await?;
        }

        if let Some(mac) = config.pod_hw_addr {
            link.set_hw_addr(mac)
                .await
                .with_context(|| format!("failed to set pod MAC {mac} on {}", link.name()))?;
        }

        let mtu = config.mtu.min(MAX_MTU);
        link.set_mtu(mtu).await?;

        link.add_address(config.pod_ip).await.with_context(|| {
            format!(
                "failed to add pod IP {} to {} on {}",
                config.pod_ip,
                link.name(),
                ns_path.display()
            )
        })?;
        link.set_up().await?;

        add_routes(&pod_ns, &config.routes, link.name()).await?;

        info!(
            interface = link.name(),
            node = %node_ip,
            vni,
            mtu,
            ns = %ns_path.display(),
            "Pod VXLAN tunnel set up"
        );
        Ok(())
    }

    async fn teardown(&self, _ns_path: &Path, _host_interface: &str, _config: &Config) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_setup_rejects_missing_peer() {
        let tunneler = WorkerNodeTunneler::new();
        let config = Config {
            dedicated: true,
            vxlan_id: Some(555000),
            ..Default::default()
        };

        let err = tunneler
            .setup(Path::new("/run/netns/unused"), &[Ipv4Addr::new(192, 168, 0, 2)], &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dedicated tunnel missing destination address"));
    }

    #[tokio::test]
    async fn test_worker_setup_requires_vni() {
        let tunneler = WorkerNodeTunneler::new();
        let err = tunneler
            .setup(
                Path::new("/run/netns/unused"),
                &[Ipv4Addr::new(192, 168, 0, 2)],
                &Config::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }
}
