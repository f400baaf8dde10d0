use super::{
    SOURCE_ROUTE_TABLE_PRIORITY, dedicated_peer, find_link_by_addr, host32,
    reprioritise_local_table, set_sysctls,
};
use crate::error::{Context, Result, TunnelError};
use crate::keepalive::{KeepAlive, Side};
use crate::tunneler::{Config, HostNamespace, Tunneler, open_pod, ordered_routes};
use async_trait::async_trait;
use peerpod_netops::{LinkKind, Ns, Route, Rule};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const POD_VETH_NAME: &str = "eth0";
const HOST_VETH_NAME: &str = "veth0";

/// Table routing the pod IP into the pod network namespace.
const POD_TABLE_ID: u32 = 45001;
const POD_TABLE_PRIORITY: u32 = 0;

/// Table routing pod traffic back to the worker.
const SOURCE_TABLE_ID: u32 = 45002;

/// Pod VM half of the routing tunnel.
#[derive(Debug, Clone)]
pub struct PodNodeTunneler {
    host: HostNamespace,
    keepalive: Arc<KeepAlive>,
}

impl Default for PodNodeTunneler {
    fn default() -> Self {
        Self {
            host: HostNamespace::default(),
            keepalive: KeepAlive::global(),
        }
    }
}

impl PodNodeTunneler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the namespace at `path` as the pod VM host namespace.
    pub fn with_host_namespace(path: impl Into<PathBuf>) -> Self {
        Self {
            host: HostNamespace::at(path),
            ..Self::default()
        }
    }

    pub fn with_keepalive(mut self, keepalive: Arc<KeepAlive>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

async fn add_rule_once(ns: &Ns, rule: &Rule) -> Result<()> {
    match ns.rule_add(rule).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_exists() => {
            debug!(rule = %rule, "Rule already present");
            Ok(())
        }
        Err(e) => Err(TunnelError::from(e).context(format!(
            "failed to add route table {} at priority {}",
            rule.table,
            rule.priority.unwrap_or_default()
        ))),
    }
}

#[async_trait]
impl Tunneler for PodNodeTunneler {
    async fn setup(&self, ns_path: &Path, peer_ips: &[Ipv4Addr], config: &Config) -> Result<()> {
        let pod_node_ip = dedicated_peer(peer_ips, config.dedicated)?;
        let pod_ip = config.pod_ip.addr();
        let node_ip = config.worker_node_ip.addr();

        let host_ns = self.host.open()?;
        let host_interface = find_link_by_addr(&host_ns, pod_node_ip)
            .await
            .with_context(|| {
                format!(
                    "failed to identify host interface that has {pod_node_ip} on netns {}",
                    host_ns.path().display()
                )
            })?;
        let pod_ns = open_pod(ns_path)?;

        reprioritise_local_table(&host_ns).await?;

        let host_veth = host_ns
            .link_add(
                HOST_VETH_NAME,
                LinkKind::Veth {
                    peer_name: POD_VETH_NAME.to_string(),
                    peer_ns: Some(&pod_ns),
                },
            )
            .await
            .with_context(|| {
                format!(
                    "failed to create a veth pair: {HOST_VETH_NAME} and {POD_VETH_NAME} on {}",
                    ns_path.display()
                )
            })?;

        let mut pod_veth = pod_ns.link_find(POD_VETH_NAME).await?;
        if config.mtu > 0 {
            pod_veth.set_mtu(config.mtu).await.with_context(|| {
                format!(
                    "failed to set MTU of {POD_VETH_NAME} to {} on {}",
                    config.mtu,
                    ns_path.display()
                )
            })?;
        }
        pod_veth.add_address(config.pod_ip).await.with_context(|| {
            format!(
                "failed to add pod IP {} to {POD_VETH_NAME} on {}",
                config.pod_ip,
                ns_path.display()
            )
        })?;
        pod_veth.set_up().await?;
        host_veth.set_up().await?;

        let mut default_gateway = None;
        for route in ordered_routes(&config.routes) {
            pod_ns
                .route_add(&route.to_netops(POD_VETH_NAME))
                .await
                .with_context(|| {
                    format!(
                        "failed to add a route to {:?} via {:?} on pod network namespace {}",
                        route.dst,
                        route.gw,
                        ns_path.display()
                    )
                })?;
            if route.is_default() {
                default_gateway = route.gw;
            }
        }
        let Some(gateway) = default_gateway else {
            return Err(TunnelError::Config(
                "no default route gateway is specified".to_string(),
            ));
        };

        host_veth
            .add_address(host32(gateway))
            .await
            .with_context(|| format!("failed to add GW IP {gateway} to {HOST_VETH_NAME} on host network namespace"))?;

        host_ns
            .route_add(&Route {
                destination: Some(host32(pod_ip)),
                device: Some(HOST_VETH_NAME.to_string()),
                table: POD_TABLE_ID,
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to add route table {POD_TABLE_ID} to pod {pod_ip} IP on host network namespace"))?;

        host_ns
            .route_add(&Route {
                gateway: Some(node_ip),
                device: Some(host_interface.clone()),
                table: SOURCE_TABLE_ID,
                ..Default::default()
            })
            .await
            .with_context(|| format!("failed to add route table {SOURCE_TABLE_ID} to pod {pod_ip} IP on host network namespace"))?;

        add_rule_once(
            &host_ns,
            &Rule {
                priority: Some(POD_TABLE_PRIORITY),
                table: POD_TABLE_ID,
                ..Default::default()
            },
        )
        .await?;
        add_rule_once(
            &host_ns,
            &Rule {
                src: Some(host32(pod_ip)),
                iif: Some(HOST_VETH_NAME.to_string()),
                priority: Some(SOURCE_ROUTE_TABLE_PRIORITY),
                table: SOURCE_TABLE_ID,
            },
        )
        .await?;

        set_sysctls(
            &host_ns,
            &[
                ("net/ipv4/ip_forward".to_string(), "1"),
                (format!("net/ipv4/conf/{HOST_VETH_NAME}/proxy_arp"), "1"),
                (format!("net/ipv4/neigh/{HOST_VETH_NAME}/proxy_delay"), "0"),
            ],
        )?;

        info!(%pod_ip, %gateway, host_interface, ns = %ns_path.display(), "Routing tunnel set up on pod VM");

        let port = self.keepalive.config().listen_addr.port();
        self.keepalive
            .register(&host_ns, pod_ip, SocketAddr::from((node_ip, port)), Side::Pod)
            .await?;

        Ok(())
    }

    async fn teardown(&self, _ns_path: &Path, _host_interface: &str, config: &Config) -> Result<()> {
        let pod_ip = config.pod_ip.addr();
        if let Err(e) = self.keepalive.deregister(pod_ip, Side::Pod).await {
            warn!(%pod_ip, error = %e, "Failed to stop keep alive");
        }
        Ok(())
    }
}
