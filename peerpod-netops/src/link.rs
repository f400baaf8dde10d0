//! Link (network interface) management.

use crate::error::{Context, NetopsError, Result};
use crate::mac::MacAddr;
use crate::ns::Ns;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::link::{
    InfoData, InfoKind, InfoVeth, InfoVrf, LinkAttribute, LinkInfo, LinkMessage,
};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info};

/// Maximum interface name length (IFNAMSIZ without the trailing NUL).
const MAX_NAME_LEN: usize = 15;

/// Upper bound on probes when picking an auto-prefixed veth name.
const VETH_ADD_ATTEMPTS: usize = 32;

/// Kind of link to create.
pub enum LinkKind<'a> {
    /// Veth pair. The peer is created in `peer_ns`, or next to the link when `None`.
    Veth {
        peer_name: String,
        peer_ns: Option<&'a Ns>,
    },
    Vrf {
        table_id: u32,
    },
    Vxlan {
        group: Ipv4Addr,
        vni: u32,
        port: u16,
    },
    Bridge,
}

impl fmt::Debug for LinkKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Veth { peer_name, peer_ns } => f
                .debug_struct("Veth")
                .field("peer_name", peer_name)
                .field("peer_ns", &peer_ns.map(|ns| ns.path().to_path_buf()))
                .finish(),
            Self::Vrf { table_id } => f.debug_struct("Vrf").field("table_id", table_id).finish(),
            Self::Vxlan { group, vni, port } => f
                .debug_struct("Vxlan")
                .field("group", group)
                .field("vni", vni)
                .field("port", port)
                .finish(),
            Self::Bridge => f.write_str("Bridge"),
        }
    }
}

/// An interface inside a namespace.
///
/// The link borrows the [`Ns`] it lives in, so every operation on it goes
/// through that namespace's netlink socket.
#[derive(Clone)]
pub struct Link<'a> {
    ns: &'a Ns,
    name: String,
    index: u32,
    kind: Option<String>,
    mac: Option<MacAddr>,
    mtu: u32,
    master: Option<u32>,
}

impl fmt::Debug for Link<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("ns", &self.ns.path())
            .field("name", &self.name)
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("mac", &self.mac)
            .field("mtu", &self.mtu)
            .field("master", &self.master)
            .finish()
    }
}

impl<'a> Link<'a> {
    fn from_message(ns: &'a Ns, message: &LinkMessage) -> Self {
        let mut link = Self {
            ns,
            name: String::new(),
            index: message.header.index,
            kind: None,
            mac: None,
            mtu: 0,
            master: None,
        };

        for attr in &message.attributes {
            match attr {
                LinkAttribute::IfName(name) => link.name = name.clone(),
                LinkAttribute::Address(addr) => link.mac = MacAddr::try_from(addr.as_slice()).ok(),
                LinkAttribute::Mtu(mtu) => link.mtu = *mtu,
                LinkAttribute::Controller(index) => link.master = Some(*index),
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let LinkInfo::Kind(kind) = info {
                            link.kind = Some(kind_name(kind));
                        }
                    }
                }
                _ => {}
            }
        }

        link
    }

    pub fn ns(&self) -> &'a Ns {
        self.ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Link kind as reported by the kernel (`veth`, `vrf`, `vxlan`, ...).
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn hw_addr(&self) -> Option<MacAddr> {
        self.mac
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Index of the bridge or VRF this link is enslaved to.
    pub fn master(&self) -> Option<u32> {
        self.master
    }

    fn describe(&self) -> String {
        format!("{} on {}", self.name, self.ns.path().display())
    }

    pub async fn set_up(&self) -> Result<()> {
        self.ns
            .handle()
            .link()
            .set(self.index)
            .up()
            .execute()
            .await
            .with_context(|| format!("failed to set {} up", self.describe()))
    }

    /// Attach this link to a bridge or VRF.
    pub async fn set_master(&mut self, master: &Link<'_>) -> Result<()> {
        self.ns
            .handle()
            .link()
            .set(self.index)
            .controller(master.index)
            .execute()
            .await
            .with_context(|| {
                format!("failed to set master of {} to {}", self.describe(), master.name)
            })?;
        self.master = Some(master.index);
        Ok(())
    }

    /// Move this link into `dst` and return it as seen from there.
    pub async fn set_namespace<'b>(self, dst: &'b Ns) -> Result<Link<'b>> {
        self.ns
            .handle()
            .link()
            .set(self.index)
            .setns_by_fd(dst.raw_fd())
            .execute()
            .await
            .with_context(|| {
                format!(
                    "failed to move {} to {}",
                    self.describe(),
                    dst.path().display()
                )
            })?;

        debug!(name = %self.name, dst = %dst.path().display(), "Link moved");
        dst.link_find(&self.name).await
    }

    pub async fn set_name(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.ns
            .handle()
            .link()
            .set(self.index)
            .name(name.to_string())
            .execute()
            .await
            .with_context(|| format!("failed to rename {} to {name}", self.describe()))?;
        self.name = name.to_string();
        Ok(())
    }

    pub async fn set_hw_addr(&mut self, mac: MacAddr) -> Result<()> {
        self.ns
            .handle()
            .link()
            .set(self.index)
            .address(mac.octets().to_vec())
            .execute()
            .await
            .with_context(|| format!("failed to set MAC of {} to {mac}", self.describe()))?;
        self.mac = Some(mac);
        Ok(())
    }

    pub async fn set_mtu(&mut self, mtu: u32) -> Result<()> {
        self.ns
            .handle()
            .link()
            .set(self.index)
            .mtu(mtu)
            .execute()
            .await
            .with_context(|| format!("failed to set MTU of {} to {mtu}", self.describe()))?;
        self.mtu = mtu;
        Ok(())
    }

    pub async fn delete(self) -> Result<()> {
        self.ns
            .handle()
            .link()
            .del(self.index)
            .execute()
            .await
            .with_context(|| format!("failed to delete {}", self.describe()))?;

        info!(name = %self.name, ns = %self.ns.path().display(), "Link deleted");
        Ok(())
    }

    /// IPv4 addresses of this link, in kernel order.
    pub async fn addresses(&self) -> Result<Vec<Ipv4Net>> {
        let mut messages = self
            .ns
            .handle()
            .address()
            .get()
            .set_link_index_filter(self.index)
            .execute();

        let mut addrs = Vec::new();
        while let Some(message) = messages
            .try_next()
            .await
            .with_context(|| format!("failed to list addresses of {}", self.describe()))?
        {
            if let Some(addr) = crate::addr::ipv4_of(&message) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    /// Assign an IPv4 address. Assigning an address that is already present succeeds.
    pub async fn add_address(&self, addr: Ipv4Net) -> Result<()> {
        match self
            .ns
            .handle()
            .address()
            .add(self.index, IpAddr::V4(addr.addr()), addr.prefix_len())
            .execute()
            .await
        {
            Ok(()) => {
                debug!(link = %self.name, %addr, "Address added");
                Ok(())
            }
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                debug!(link = %self.name, %addr, "Address already present");
                Ok(())
            }
            Err(e) => Err(NetopsError::from(e)
                .context(format!("failed to add address {addr} to {}", self.describe()))),
        }
    }
}

impl Ns {
    pub async fn link_find(&self, name: &str) -> Result<Link<'_>> {
        let mut links = self
            .handle()
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(Some(message)) => Ok(Link::from_message(self, &message)),
            Ok(None) => Err(NetopsError::NotFound(format!(
                "link {name} on {}",
                self.path().display()
            ))),
            Err(e) => Err(NetopsError::from(e)
                .context(format!("failed to find link {name} on {}", self.path().display()))),
        }
    }

    pub async fn link_by_index(&self, index: u32) -> Result<Link<'_>> {
        let mut links = self.handle().link().get().match_index(index).execute();

        match links.try_next().await {
            Ok(Some(message)) => Ok(Link::from_message(self, &message)),
            Ok(None) => Err(NetopsError::NotFound(format!(
                "link #{index} on {}",
                self.path().display()
            ))),
            Err(e) => Err(NetopsError::from(e).context(format!(
                "failed to find link #{index} on {}",
                self.path().display()
            ))),
        }
    }

    pub async fn link_list(&self) -> Result<Vec<Link<'_>>> {
        let mut messages = self.handle().link().get().execute();

        let mut links = Vec::new();
        while let Some(message) = messages
            .try_next()
            .await
            .with_context(|| format!("failed to list links on {}", self.path().display()))?
        {
            links.push(Link::from_message(self, &message));
        }
        Ok(links)
    }

    /// Create a link and return it.
    pub async fn link_add(&self, name: &str, kind: LinkKind<'_>) -> Result<Link<'_>> {
        validate_name(name)?;
        let describe = format!("{name} ({kind:?}) on {}", self.path().display());

        let created = match &kind {
            LinkKind::Veth { peer_name, peer_ns } => {
                validate_name(peer_name)?;
                let mut peer = LinkMessage::default();
                peer.attributes
                    .push(LinkAttribute::IfName(peer_name.clone()));
                if let Some(peer_ns) = peer_ns {
                    peer.attributes.push(LinkAttribute::NetNsFd(peer_ns.raw_fd()));
                }
                self.nl_new(new_link(
                    name,
                    InfoKind::Veth,
                    InfoData::Veth(InfoVeth::Peer(peer)),
                ))
                .await
            }
            LinkKind::Vrf { table_id } => {
                self.nl_new(new_link(
                    name,
                    InfoKind::Vrf,
                    InfoData::Vrf(vec![InfoVrf::TableId(*table_id)]),
                ))
                .await
            }
            LinkKind::Vxlan { group, vni, port } => self
                .handle()
                .link()
                .add()
                .vxlan(name.to_string(), *vni)
                .group(*group)
                .port(*port)
                .execute()
                .await
                .map_err(NetopsError::from),
            LinkKind::Bridge => self
                .handle()
                .link()
                .add()
                .bridge(name.to_string())
                .execute()
                .await
                .map_err(NetopsError::from),
        };
        created.with_context(|| format!("failed to add link {describe}"))?;

        info!(name, kind = ?kind, ns = %self.path().display(), "Link created");
        self.link_find(name).await
    }

    /// Create a veth pair named `<prefix>N` with the lowest free `N`.
    ///
    /// The peer end is created directly in `peer_ns` as `peer_name`. A name
    /// that gets taken between probing and creating is retried with the next
    /// free index.
    pub async fn veth_add_auto(
        &self,
        prefix: &str,
        peer_name: &str,
        peer_ns: &Ns,
    ) -> Result<Link<'_>> {
        let mut last_err = None;

        for _ in 0..VETH_ADD_ATTEMPTS {
            let taken: HashSet<String> = self
                .link_list()
                .await?
                .into_iter()
                .map(|link| link.name)
                .collect();
            let name = lowest_free_name(prefix, &taken);

            let kind = LinkKind::Veth {
                peer_name: peer_name.to_string(),
                peer_ns: Some(peer_ns),
            };
            match self.link_add(&name, kind).await {
                Ok(link) => return Ok(link),
                Err(e) if e.is_exists() => {
                    if peer_ns.link_find(peer_name).await.is_ok() {
                        return Err(NetopsError::AlreadyExists(format!(
                            "veth peer {peer_name} already exists on {}",
                            peer_ns.path().display()
                        )));
                    }
                    debug!(name, error = %e, "Veth name taken, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| NetopsError::AlreadyExists(format!("{prefix}*")))
            .context(format!(
                "no free {prefix}N name on {} after {VETH_ADD_ATTEMPTS} attempts",
                self.path().display()
            )))
    }
}

fn new_link(name: &str, kind: InfoKind, data: InfoData) -> RouteNetlinkMessage {
    let mut message = LinkMessage::default();
    message.attributes.push(LinkAttribute::IfName(name.to_string()));
    message.attributes.push(LinkAttribute::LinkInfo(vec![
        LinkInfo::Kind(kind),
        LinkInfo::Data(data),
    ]));
    RouteNetlinkMessage::NewLink(message)
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Veth => "veth".to_string(),
        InfoKind::Vrf => "vrf".to_string(),
        InfoKind::Vxlan => "vxlan".to_string(),
        InfoKind::Bridge => "bridge".to_string(),
        InfoKind::Dummy => "dummy".to_string(),
        InfoKind::Other(name) => name.clone(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// `<prefix>N` for the lowest `N` not present in `taken`.
pub(crate) fn lowest_free_name(prefix: &str, taken: &HashSet<String>) -> String {
    let mut index = 0usize;
    loop {
        let name = format!("{prefix}{index}");
        if !taken.contains(&name) {
            return name;
        }
        index += 1;
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(['/', ' ', ':']) {
        return Err(NetopsError::Invalid(format!("invalid interface name {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_name() {
        let taken: HashSet<String> = ["ppveth0", "ppveth1", "ppveth3", "eth0"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(lowest_free_name("ppveth", &taken), "ppveth2");
        assert_eq!(lowest_free_name("vxlan", &taken), "vxlan0");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("ppvrf1").is_ok());
        assert!(validate_name("a-fifteen-chars").is_ok());
        assert!(validate_name("sixteen-chars-xx").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("eth/0").is_err());
    }

    #[test]
    fn test_kind_name() {
        assert_eq!(kind_name(&InfoKind::Vrf), "vrf");
        assert_eq!(kind_name(&InfoKind::Other("wireguard".into())), "wireguard");
    }
}
