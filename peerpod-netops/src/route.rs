//! Routes and routing tables.

use crate::error::{Context, NetopsError, Result};
use crate::ns::Ns;
use ipnet::Ipv4Net;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteFlag, RouteMessage,
    RouteProtocol as NlRouteProtocol, RouteScope as NlRouteScope, RouteType as NlRouteType,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Kernel table used for lookups when no other table is given.
pub const RT_TABLE_MAIN: u32 = 254;

/// Kernel table holding local and broadcast routes.
pub const RT_TABLE_LOCAL: u32 = 255;

/// Origin of a route (`RTPROT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum RouteProtocol {
    #[default]
    Unspec,
    Redirect,
    Kernel,
    Boot,
    Static,
    Dhcp,
    Other(u8),
}

impl From<u8> for RouteProtocol {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Unspec,
            1 => Self::Redirect,
            2 => Self::Kernel,
            3 => Self::Boot,
            4 => Self::Static,
            16 => Self::Dhcp,
            other => Self::Other(other),
        }
    }
}

impl From<RouteProtocol> for u8 {
    fn from(value: RouteProtocol) -> Self {
        match value {
            RouteProtocol::Unspec => 0,
            RouteProtocol::Redirect => 1,
            RouteProtocol::Kernel => 2,
            RouteProtocol::Boot => 3,
            RouteProtocol::Static => 4,
            RouteProtocol::Dhcp => 16,
            RouteProtocol::Other(other) => other,
        }
    }
}

/// Distance to the destination (`RT_SCOPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum RouteScope {
    #[default]
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
    Other(u8),
}

impl From<u8> for RouteScope {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Universe,
            200 => Self::Site,
            253 => Self::Link,
            254 => Self::Host,
            255 => Self::Nowhere,
            other => Self::Other(other),
        }
    }
}

impl From<RouteScope> for u8 {
    fn from(value: RouteScope) -> Self {
        match value {
            RouteScope::Universe => 0,
            RouteScope::Site => 200,
            RouteScope::Link => 253,
            RouteScope::Host => 254,
            RouteScope::Nowhere => 255,
            RouteScope::Other(other) => other,
        }
    }
}

/// Route type (`RTN_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteType {
    Unspec,
    #[default]
    Unicast,
    Local,
    Broadcast,
    Other(u8),
}

impl From<u8> for RouteType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Unspec,
            1 => Self::Unicast,
            2 => Self::Local,
            3 => Self::Broadcast,
            other => Self::Other(other),
        }
    }
}

impl From<RouteType> for u8 {
    fn from(value: RouteType) -> Self {
        match value {
            RouteType::Unspec => 0,
            RouteType::Unicast => 1,
            RouteType::Local => 2,
            RouteType::Broadcast => 3,
            RouteType::Other(other) => other,
        }
    }
}

/// An IPv4 route.
///
/// `destination: None` is the default route. `table: 0` is the main table.
/// `scope` is what the kernel reported; routes are always added with the
/// scope derived from the gateway (universe with one, link without).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub destination: Option<Ipv4Net>,
    pub source: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub device: Option<String>,
    pub priority: u32,
    pub table: u32,
    pub kind: RouteType,
    pub protocol: RouteProtocol,
    pub scope: Option<RouteScope>,
    pub onlink: bool,
    /// Raw `RTM_F_*`/`RTNH_F_*` flags as reported by the kernel.
    pub flags: u32,
}

impl Route {
    pub fn is_default(&self) -> bool {
        self.destination.is_none_or(|dst| dst.prefix_len() == 0)
    }

    pub fn effective_scope(&self) -> RouteScope {
        if self.gateway.is_some() {
            RouteScope::Universe
        } else {
            RouteScope::Link
        }
    }

    pub fn effective_table(&self) -> u32 {
        if self.table == 0 {
            RT_TABLE_MAIN
        } else {
            self.table
        }
    }

    fn destination_or_default(&self) -> Ipv4Net {
        self.destination.unwrap_or_default()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.destination {
            Some(dst) if dst.prefix_len() > 0 => write!(f, "{dst}")?,
            _ => f.write_str("default")?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        if let Some(dev) = &self.device {
            write!(f, " dev {dev}")?;
        }
        write!(f, " table {}", self.effective_table())
    }
}

/// Selects routes for listing and deletion. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct RouteFilter {
    pub destination: Option<Ipv4Net>,
    /// `Some(0)` selects the main table.
    pub table: Option<u32>,
    pub gateway: Option<Ipv4Addr>,
    pub device: Option<String>,
}

impl RouteFilter {
    pub fn matches(&self, route: &Route) -> bool {
        if let Some(dst) = self.destination
            && route.destination_or_default() != dst
        {
            return false;
        }
        if let Some(table) = self.table {
            let table = if table == 0 { RT_TABLE_MAIN } else { table };
            if route.effective_table() != table {
                return false;
            }
        }
        if self.gateway.is_some() && route.gateway != self.gateway {
            return false;
        }
        if self.device.is_some() && route.device != self.device {
            return false;
        }
        true
    }
}

/// Whether a listed route should be carried over when a pod's routes are
/// replayed elsewhere.
pub fn is_reconfigurable(route: &Route) -> bool {
    route.kind == RouteType::Unicast
        && route.effective_table() == RT_TABLE_MAIN
        && route.flags == 0
        && matches!(route.protocol, RouteProtocol::Static | RouteProtocol::Boot)
        && matches!(
            route.scope.unwrap_or_else(|| route.effective_scope()),
            RouteScope::Universe | RouteScope::Link | RouteScope::Host
        )
}

impl Ns {
    /// Add a route. Fails with `AlreadyExists` if an identical route exists.
    pub async fn route_add(&self, route: &Route) -> Result<()> {
        let message = self.route_message(route).await?;
        self.nl_new(RouteNetlinkMessage::NewRoute(message))
            .await
            .with_context(|| format!("failed to add route {route} on {}", self.path().display()))?;

        debug!(route = %route, ns = %self.path().display(), "Route added");
        Ok(())
    }

    /// Add a route whose gateway is accepted even if it is not reachable yet.
    pub async fn route_add_onlink(
        &self,
        table: u32,
        destination: Option<Ipv4Net>,
        gateway: Ipv4Addr,
        device: &str,
    ) -> Result<()> {
        self.route_add(&Route {
            destination,
            gateway: Some(gateway),
            device: Some(device.to_string()),
            table,
            onlink: true,
            ..Default::default()
        })
        .await
    }

    /// Delete every route matching `filter` and return how many were removed.
    pub async fn route_del(&self, filter: &RouteFilter) -> Result<usize> {
        let mut deleted = 0;

        for (route, message) in self.route_dump().await? {
            if !filter.matches(&route) {
                continue;
            }
            self.nl_ack(RouteNetlinkMessage::DelRoute(message))
                .await
                .with_context(|| {
                    format!("failed to delete route {route} on {}", self.path().display())
                })?;
            debug!(route = %route, ns = %self.path().display(), "Route deleted");
            deleted += 1;
        }

        Ok(deleted)
    }

    /// List IPv4 routes of all tables matching `filter`, in kernel order.
    pub async fn route_list(&self, filter: &RouteFilter) -> Result<Vec<Route>> {
        Ok(self
            .route_dump()
            .await?
            .into_iter()
            .map(|(route, _)| route)
            .filter(|route| filter.matches(route))
            .collect())
    }

    /// Routes of the main table that can be replayed on another host.
    ///
    /// Kernel-generated, non-unicast and flagged routes are skipped.
    pub async fn get_routes(&self) -> Result<Vec<Route>> {
        let routes = self
            .route_list(&RouteFilter {
                table: Some(RT_TABLE_MAIN),
                ..Default::default()
            })
            .await?;

        Ok(routes
            .into_iter()
            .filter(|route| {
                let keep = is_reconfigurable(route);
                if !keep {
                    debug!(route = %route, protocol = ?route.protocol, scope = ?route.scope, "Skipping route");
                }
                keep
            })
            .collect())
    }

    /// Default routes of the main table.
    pub async fn default_routes(&self) -> Result<Vec<Route>> {
        let routes = self
            .route_list(&RouteFilter {
                table: Some(RT_TABLE_MAIN),
                ..Default::default()
            })
            .await?;

        Ok(routes
            .into_iter()
            .filter(|route| {
                route.is_default()
                    && route.kind == RouteType::Unicast
                    && matches!(
                        route.protocol,
                        RouteProtocol::Static
                            | RouteProtocol::Boot
                            | RouteProtocol::Dhcp
                            | RouteProtocol::Kernel
                    )
            })
            .collect())
    }

    /// Device of the lowest-priority default route of the main table.
    pub async fn primary_interface(&self) -> Result<String> {
        let mut defaults: Vec<Route> = self
            .route_list(&RouteFilter {
                table: Some(RT_TABLE_MAIN),
                ..Default::default()
            })
            .await?
            .into_iter()
            .filter(|route| route.is_default() && route.device.is_some())
            .collect();
        defaults.sort_by_key(|route| route.priority);

        defaults
            .into_iter()
            .next()
            .and_then(|route| route.device)
            .ok_or_else(|| {
                NetopsError::NotFound(format!("no default route on {}", self.path().display()))
            })
    }

    /// Address and device of the interface holding the default route.
    pub async fn detect_pod_ip(&self) -> Result<(Ipv4Addr, String)> {
        let (addr, device) = self.detect_pod_net().await?;
        Ok((addr.addr(), device))
    }

    /// Like [`Ns::detect_pod_ip`], keeping the prefix length.
    pub async fn detect_pod_net(&self) -> Result<(Ipv4Net, String)> {
        let device = self.primary_interface().await?;

        let addrs = self.link_find(&device).await?.addresses().await?;
        match addrs.as_slice() {
            [] => Err(NetopsError::NotFound(format!(
                "no IPv4 addresses on {device} of {}",
                self.path().display()
            ))),
            [addr] => {
                info!(ip = %addr, device, ns = %self.path().display(), "Pod IP detected");
                Ok((*addr, device))
            }
            _ => Err(NetopsError::Invalid(format!(
                "multiple IPv4 addresses on {device} of {}: {addrs:?}",
                self.path().display()
            ))),
        }
    }

    async fn route_dump(&self) -> Result<Vec<(Route, RouteMessage)>> {
        let mut request = RouteMessage::default();
        request.header.address_family = AddressFamily::Inet;

        let replies = self
            .nl_dump(RouteNetlinkMessage::GetRoute(request))
            .await
            .with_context(|| format!("failed to list routes on {}", self.path().display()))?;

        let names: HashMap<u32, String> = self
            .link_list()
            .await?
            .into_iter()
            .map(|link| (link.index(), link.name().to_string()))
            .collect();

        Ok(replies
            .into_iter()
            .filter_map(|reply| match reply {
                RouteNetlinkMessage::NewRoute(message) => {
                    parse_route(&message, &names).map(|route| (route, message))
                }
                _ => None,
            })
            .collect())
    }

    async fn route_message(&self, route: &Route) -> Result<RouteMessage> {
        let mut message = RouteMessage::default();
        let header = &mut message.header;
        header.address_family = AddressFamily::Inet;
        header.protocol = NlRouteProtocol::from(u8::from(match route.protocol {
            RouteProtocol::Unspec => RouteProtocol::Static,
            other => other,
        }));
        header.scope = NlRouteScope::from(u8::from(route.effective_scope()));
        header.kind = NlRouteType::from(u8::from(match route.kind {
            RouteType::Unspec => RouteType::Unicast,
            other => other,
        }));

        let table = route.effective_table();
        header.table = u8::try_from(table).unwrap_or(0);
        if route.onlink {
            header.flags = vec![RouteFlag::Onlink];
        }

        let destination = route.destination_or_default();
        header.destination_prefix_length = destination.prefix_len();
        if destination.prefix_len() > 0 {
            message
                .attributes
                .push(RouteAttribute::Destination(RouteAddress::Inet(destination.network())));
        }

        message.attributes.push(RouteAttribute::Table(table));

        if let Some(gateway) = route.gateway {
            message
                .attributes
                .push(RouteAttribute::Gateway(RouteAddress::Inet(gateway)));
        }
        if let Some(source) = route.source {
            message
                .attributes
                .push(RouteAttribute::PrefSource(RouteAddress::Inet(source)));
        }
        if let Some(device) = &route.device {
            let link = self.link_find(device).await?;
            message.attributes.push(RouteAttribute::Oif(link.index()));
        }
        if route.priority > 0 {
            message
                .attributes
                .push(RouteAttribute::Priority(route.priority));
        }

        Ok(message)
    }
}

fn parse_route(message: &RouteMessage, names: &HashMap<u32, String>) -> Option<Route> {
    if message.header.address_family != AddressFamily::Inet {
        return None;
    }

    let flags = message.header.flags.iter().fold(0u32, |acc, f| acc | u32::from(*f));
    let mut route = Route {
        table: u32::from(message.header.table),
        kind: RouteType::from(u8::from(message.header.kind)),
        protocol: RouteProtocol::from(u8::from(message.header.protocol)),
        scope: Some(RouteScope::from(u8::from(message.header.scope))),
        onlink: message.header.flags.contains(&RouteFlag::Onlink),
        flags,
        ..Default::default()
    };

    let mut destination = Ipv4Addr::UNSPECIFIED;
    for attr in &message.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => destination = *ip,
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => route.gateway = Some(*ip),
            RouteAttribute::PrefSource(RouteAddress::Inet(ip)) => route.source = Some(*ip),
            RouteAttribute::Oif(index) => route.device = names.get(index).cloned(),
            RouteAttribute::Priority(priority) => route.priority = *priority,
            RouteAttribute::Table(table) => route.table = *table,
            _ => {}
        }
    }

    let prefix_len = message.header.destination_prefix_length;
    if prefix_len > 0 {
        route.destination = Ipv4Net::new(destination, prefix_len).ok();
    }

    Some(route)
}
