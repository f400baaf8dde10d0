use super::{
    DAEMON_LISTEN_PORT, MAX_TABLE_ID, MIN_TABLE_ID, SECOND_POD_INTERFACE,
    SOURCE_ROUTE_TABLE_PRIORITY, VETH_PREFIX, VRF1_NAME, VRF1_TABLE_ID, VRF2_NAME, VRF2_TABLE_ID,
    dedicated_peer, find_link_by_addr, host32, reprioritise_local_table, set_sysctls,
};
use crate::error::{Context, Result, TunnelError};
use crate::iptables;
use crate::keepalive::{KeepAlive, Side};
use crate::tunneler::{Config, HostNamespace, Tunneler, open_pod};
use async_trait::async_trait;
use peerpod_netops::{LinkKind, Ns, Route, RouteFilter, Rule};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ROUTE_ADD_ATTEMPTS: u32 = 10;
const ROUTE_ADD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Worker half of the routing tunnel.
#[derive(Debug, Clone)]
pub struct WorkerNodeTunneler {
    host: HostNamespace,
    keepalive: Arc<KeepAlive>,
}

impl Default for WorkerNodeTunneler {
    fn default() -> Self {
        Self {
            host: HostNamespace::default(),
            keepalive: KeepAlive::global(),
        }
    }
}

impl WorkerNodeTunneler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the namespace at `path` as the worker host namespace.
    pub fn with_host_namespace(path: impl Into<PathBuf>) -> Self {
        Self {
            host: HostNamespace::at(path),
            ..Self::default()
        }
    }

    /// Register keepalive clients with `keepalive` instead of the
    /// process-wide registry.
    pub fn with_keepalive(mut self, keepalive: Arc<KeepAlive>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// Gateway of the return route: that of the first pod route, or of the
/// default route when the first route is direct.
fn return_gateway(config: &Config) -> Result<Ipv4Addr> {
    config
        .routes
        .first()
        .and_then(|route| route.gw)
        .or_else(|| config.default_gateway())
        .ok_or_else(|| TunnelError::Config("no pod route gateway is specified".to_string()))
}

async fn ensure_vrf(ns: &Ns, name: &str, table_id: u32) -> Result<()> {
    match ns.link_add(name, LinkKind::Vrf { table_id }).await {
        Ok(_) => info!(name, table_id, "VRF created"),
        Err(e) if e.is_exists() => debug!(name, "VRF already present"),
        Err(e) => return Err(TunnelError::from(e).context(format!("failed to add vrf {name}"))),
    }

    ns.link_find(name)
        .await?
        .set_up()
        .await
        .with_context(|| format!("failed to set vrf {name} up"))
}

/// Route to the pod VM through the host interface.
///
/// Right after the host interface is enslaved to the VRF the kernel may
/// answer `ENETUNREACH` for a short while.
async fn add_route_to_pod_vm(ns: &Ns, route: &Route) -> Result<()> {
    let mut attempt = 1;
    loop {
        match ns.route_add(route).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_unreachable() && attempt < ROUTE_ADD_ATTEMPTS => {
                debug!(route = %route, attempt, "Network unreachable, retrying");
                attempt += 1;
                tokio::time::sleep(ROUTE_ADD_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(TunnelError::from(e).context("failed to add a route to pod VM"));
            }
        }
    }
}

/// Add the on-link default route back to the pod in the lowest table that
/// no `iif ppvrf1` source rule uses yet.
async fn add_return_route(ns: &Ns, gateway: Ipv4Addr, veth: &str) -> Result<u32> {
    let mut table_id = MIN_TABLE_ID;
    loop {
        table_id = ns
            .available_table_id(VRF1_NAME, SOURCE_ROUTE_TABLE_PRIORITY, table_id, MAX_TABLE_ID)
            .await?;

        match ns.route_add_onlink(table_id, None, gateway, veth).await {
            Ok(()) => return Ok(table_id),
            Err(e) if e.is_exists() => {
                debug!(table_id, "Routing table already in use, trying next");
                table_id += 1;
            }
            Err(e) => {
                return Err(TunnelError::from(e)
                    .context("failed to add a route from a pod VM to a pod proxy"));
            }
        }
    }
}

#[async_trait]
impl Tunneler for WorkerNodeTunneler {
    async fn setup(&self, ns_path: &Path, peer_ips: &[Ipv4Addr], config: &Config) -> Result<()> {
        let pod_node_ip = dedicated_peer(peer_ips, config.dedicated)?;
        let pod_ip = config.pod_ip.addr();
        let worker_node_ip = config.worker_node_ip.addr();
        let gateway = return_gateway(config)?;

        let host_ns = self.host.open()?;
        let host_interface = find_link_by_addr(&host_ns, worker_node_ip)
            .await
            .with_context(|| {
                format!(
                    "failed to identify host interface that has {worker_node_ip} on netns {}",
                    host_ns.path().display()
                )
            })?;

        info!(host_interface, "Ensure routing table entries and VRF devices on host");

        reprioritise_local_table(&host_ns).await?;

        ensure_vrf(&host_ns, VRF1_NAME, VRF1_TABLE_ID).await?;
        let vrf1 = host_ns.link_find(VRF1_NAME).await?;
        host_ns
            .link_find(&host_interface)
            .await?
            .set_master(&vrf1)
            .await
            .with_context(|| format!("failed to set master of {host_interface} to vrf {VRF1_NAME}"))?;

        ensure_vrf(&host_ns, VRF2_NAME, VRF2_TABLE_ID).await?;

        let pod_ns = open_pod(ns_path)?;

        let mut veth = host_ns
            .veth_add_auto(VETH_PREFIX, SECOND_POD_INTERFACE, &pod_ns)
            .await?;
        let veth_name = veth.name().to_string();
        pod_ns.link_find(SECOND_POD_INTERFACE).await?.set_up().await?;

        info!(
            host = veth_name,
            pod = SECOND_POD_INTERFACE,
            ns = %ns_path.display(),
            "Created a veth pair between host and pod network namespace"
        );

        let pod_interface = config.interface_name.as_str();
        info!(
            pod_interface,
            second = SECOND_POD_INTERFACE,
            ns = %ns_path.display(),
            "Adding tc redirect filters"
        );
        pod_ns
            .redirect_add(pod_interface, SECOND_POD_INTERFACE)
            .await
            .with_context(|| {
                format!("failed to add a tc redirect filter from {pod_interface} to {SECOND_POD_INTERFACE}")
            })?;
        pod_ns
            .redirect_add(SECOND_POD_INTERFACE, pod_interface)
            .await
            .with_context(|| {
                format!("failed to add a tc redirect filter from {SECOND_POD_INTERFACE} to {pod_interface}")
            })?;

        let vrf2 = host_ns.link_find(VRF2_NAME).await?;
        veth.set_master(&vrf2).await?;

        let hw_addr = pod_ns
            .link_find(pod_interface)
            .await?
            .hw_addr()
            .ok_or_else(|| {
                TunnelError::Config(format!(
                    "pod interface {pod_interface} (netns {}) has no hardware address",
                    ns_path.display()
                ))
            })?;
        veth.set_hw_addr(hw_addr).await.with_context(|| {
            format!(
                "failed to set hardware address {hw_addr} to veth interface {veth_name} (netns {})",
                host_ns.path().display()
            )
        })?;
        veth.set_up().await?;

        info!(%pod_ip, %pod_node_ip, "Adding a route to the pod VM");
        add_route_to_pod_vm(
            &host_ns,
            &Route {
                destination: Some(host32(pod_ip)),
                gateway: Some(pod_node_ip),
                device: Some(host_interface.clone()),
                table: VRF2_TABLE_ID,
                ..Default::default()
            },
        )
        .await?;

        info!(%pod_ip, veth = veth_name, "Adding pod IP to veth and deleting its local route");
        veth.add_address(host32(pod_ip)).await?;
        // The kernel puts local routes of VRF slaves in the VRF table
        let deleted = host_ns
            .route_del(&RouteFilter {
                destination: Some(host32(pod_ip)),
                table: Some(VRF2_TABLE_ID),
                device: Some(veth_name.clone()),
                ..Default::default()
            })
            .await?;
        if deleted == 0 {
            warn!(%pod_ip, veth = veth_name, "No local route to delete");
        }

        let table_id = add_return_route(&host_ns, gateway, &veth_name).await?;
        info!(%pod_node_ip, table_id, ns = %ns_path.display(), "Routing traffic from the pod VM back to the pod network namespace");
        host_ns
            .rule_add(&Rule {
                src: Some(host32(pod_ip)),
                iif: Some(VRF1_NAME.to_string()),
                priority: Some(SOURCE_ROUTE_TABLE_PRIORITY),
                table: table_id,
            })
            .await?;

        info!(veth = veth_name, "Enabling proxy ARP");
        set_sysctls(
            &host_ns,
            &[
                ("net/ipv4/ip_forward".to_string(), "1"),
                (format!("net/ipv4/conf/{veth_name}/accept_local"), "1"),
                (format!("net/ipv4/conf/{veth_name}/proxy_arp"), "1"),
                (format!("net/ipv4/neigh/{veth_name}/proxy_delay"), "0"),
            ],
        )?;

        iptables::apply_rules(
            &host_ns,
            &iptables::peerpod_rules(&[VRF1_NAME, VRF2_NAME, &host_interface]),
        )?;

        self.keepalive
            .register(
                &host_ns,
                pod_ip,
                SocketAddr::from((pod_node_ip, DAEMON_LISTEN_PORT)),
                Side::Worker,
            )
            .await?;

        Ok(())
    }

    async fn teardown(&self, ns_path: &Path, host_interface: &str, config: &Config) -> Result<()> {
        let host_ns = self.host.open()?;
        let pod_ns = open_pod(ns_path)?;
        let pod_ip = config.pod_ip.addr();

        info!(%pod_ip, host_interface, "Deleting routing table entries");

        let deleted = host_ns
            .route_del(&RouteFilter {
                destination: Some(host32(pod_ip)),
                table: Some(VRF2_TABLE_ID),
                ..Default::default()
            })
            .await?;
        if deleted == 0 {
            warn!(%pod_ip, table = VRF2_TABLE_ID, "No route to the pod VM to delete");
        }

        let filter = Rule {
            src: Some(host32(pod_ip)),
            iif: Some(VRF1_NAME.to_string()),
            priority: Some(SOURCE_ROUTE_TABLE_PRIORITY),
            ..Default::default()
        };
        let rules = host_ns.rule_list(&filter).await?;
        if rules.is_empty() {
            warn!(rule = %filter, "No source rule to delete");
        }
        for rule in rules {
            host_ns.rule_del(&rule).await.with_context(|| {
                format!(
                    "failed to delete a rule {pod_ip} vrf {VRF1_NAME} pref {SOURCE_ROUTE_TABLE_PRIORITY} table {}",
                    rule.table
                )
            })?;
        }

        let pod_interface = config.interface_name.as_str();
        info!(pod_interface, second = SECOND_POD_INTERFACE, ns = %ns_path.display(), "Deleting tc redirect filters");

        for (src, dst) in [
            (pod_interface, SECOND_POD_INTERFACE),
            (SECOND_POD_INTERFACE, pod_interface),
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

        info!(name = SECOND_POD_INTERFACE, ns = %ns_path.display(), "Deleting veth");
        match pod_ns.link_find(SECOND_POD_INTERFACE).await {
            Ok(link) => link.delete().await.with_context(|| {
                format!(
                    "failed to delete a veth interface {SECOND_POD_INTERFACE} at {}",
                    ns_path.display()
                )
            })?,
            Err(e) if e.is_not_found() => debug!(name = SECOND_POD_INTERFACE, "Veth already deleted"),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.keepalive.deregister(pod_ip, Side::Worker).await {
            warn!(%pod_ip, error = %e, "Failed to stop keep alive");
        }

        Ok(())
    }
}
