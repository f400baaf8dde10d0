//! Routing tunneler.
//!
//! Instead of encapsulating pod traffic, the routing tunneler forwards it
//! over a dedicated subnet shared by the worker and the pod VM. On the worker
//! two VRFs keep tunnel traffic away from the host's own routing:
//!
//! ```text
//!   pod netns                 worker host
//!   eth0 ◀──tc──▶ eth1 ════ ppvethN   master ppvrf2 (table 49002)
//!                           host NIC  master ppvrf1 (table 49001)
//!
//!   to the pod VM:   table 49002   podIP/32 via <VM> dev <host NIC>
//!   from the pod VM: from podIP iif ppvrf1 lookup 5xxxx
//!                    table 5xxxx   default via <pod gw> dev ppvethN onlink
//! ```
//!
//! On the pod VM a veth pair `veth0`/`eth0` links the pod namespace to the
//! host, which proxy-ARPs for the pod gateway and routes by source.
//!
//! Only dedicated mode is supported: the pod VM must have a second address
//! on the dedicated subnet.

mod pod;
mod worker;

pub use pod::PodNodeTunneler;
pub use worker::WorkerNodeTunneler;

use crate::error::{Context, Result, TunnelError};
use ipnet::Ipv4Net;
use peerpod_netops::{Ns, RT_TABLE_LOCAL, Rule};
use std::net::Ipv4Addr;
use tracing::debug;

/// Egress VRF on the worker, enslaving the dedicated host interface.
pub const VRF1_NAME: &str = "ppvrf1";
pub const VRF1_TABLE_ID: u32 = 49001;

/// Ingress VRF on the worker, enslaving the per-pod veths.
pub const VRF2_NAME: &str = "ppvrf2";
pub const VRF2_TABLE_ID: u32 = 49002;

pub const VETH_PREFIX: &str = "ppveth";

/// Pod-side end of the worker veth.
pub const SECOND_POD_INTERFACE: &str = "eth1";

pub const SOURCE_ROUTE_TABLE_PRIORITY: u32 = 505;
pub const MIN_TABLE_ID: u32 = 50000;
pub const MAX_TABLE_ID: u32 = 59999;

/// Port of the agent protocol forwarder on the pod VM.
pub const DAEMON_LISTEN_PORT: u16 = 15150;

const LOCAL_TABLE_ORIGINAL_PRIORITY: u32 = 0;
const LOCAL_TABLE_NEW_PRIORITY: u32 = 32765;

fn host32(ip: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(ip)
}

/// Routing requires dedicated mode with the pod VM's dedicated address as
/// the second peer IP.
fn dedicated_peer(peer_ips: &[Ipv4Addr], dedicated: bool) -> Result<Ipv4Addr> {
    if !dedicated {
        return Err(TunnelError::Config("shared subnet is not supported".to_string()));
    }
    match peer_ips {
        [_, second] => Ok(*second),
        _ => Err(TunnelError::Config(
            "secondary pod node IP is not available".to_string(),
        )),
    }
}

/// Name of the only link in `ns` holding `ip`.
async fn find_link_by_addr(ns: &Ns, ip: Ipv4Addr) -> Result<String> {
    let links = ns
        .link_list()
        .await
        .with_context(|| format!("failed to list interfaces on netns {}", ns.path().display()))?;

    let mut found = Vec::new();
    for link in &links {
        let addrs = link.addresses().await.with_context(|| {
            format!(
                "failed to get IP addresses assigned to {:?} on netns {}",
                link.name(),
                ns.path().display()
            )
        })?;
        if addrs.iter().any(|addr| addr.addr() == ip) {
            found.push(link.name().to_string());
        }
    }

    match found.as_slice() {
        [name] => Ok(name.clone()),
        [] => Err(TunnelError::Config(format!(
            "failed to find interface that has {ip} on netns {}",
            ns.path().display()
        ))),
        names => Err(TunnelError::Config(format!(
            "multiple interfaces have {ip} on netns {}: {}",
            ns.path().display(),
            names.join(", ")
        ))),
    }
}

/// Move the local table lookup from priority 0 to 32765 so that the
/// tunnel rules at lower priorities are consulted first.
async fn reprioritise_local_table(ns: &Ns) -> Result<()> {
    let rule = Rule {
        priority: Some(LOCAL_TABLE_NEW_PRIORITY),
        table: RT_TABLE_LOCAL,
        ..Default::default()
    };
    match ns.rule_add(&rule).await {
        Ok(()) => {}
        Err(e) if e.is_exists() => debug!(rule = %rule, "Local table already moved"),
        Err(e) => {
            return Err(TunnelError::from(e).context(format!(
                "failed to add local table at priority {LOCAL_TABLE_NEW_PRIORITY}"
            )));
        }
    }

    let rule = Rule {
        priority: Some(LOCAL_TABLE_ORIGINAL_PRIORITY),
        table: RT_TABLE_LOCAL,
        ..Default::default()
    };
    match ns.rule_del(&rule).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(TunnelError::from(e).context(format!(
            "failed to delete local table at priority {LOCAL_TABLE_ORIGINAL_PRIORITY}"
        ))),
    }
}

fn set_sysctls(ns: &Ns, values: &[(String, &str)]) -> Result<()> {
    for (key, value) in values {
        ns.sysctl_set(key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedicated_peer() {
        let primary = Ipv4Addr::new(192, 168, 0, 2);
        let dedicated = Ipv4Addr::new(192, 168, 10, 2);

        assert_eq!(dedicated_peer(&[primary, dedicated], true).unwrap(), dedicated);

        let err = dedicated_peer(&[primary, dedicated], false).unwrap_err();
        assert_eq!(err.to_string(), "invalid config: shared subnet is not supported");

        let err = dedicated_peer(&[primary], true).unwrap_err();
        assert!(err.to_string().contains("secondary pod node IP is not available"));
        assert!(dedicated_peer(&[primary, dedicated, primary], true).is_err());
    }

    #[test]
    fn test_host32() {
        assert_eq!(
            host32(Ipv4Addr::new(10, 128, 0, 2)),
            "10.128.0.2/32".parse::<Ipv4Net>().unwrap()
        );
    }
}
