//! Address helpers.

use ipnet::Ipv4Net;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use std::net::IpAddr;

/// IPv4 prefix carried by an address message.
///
/// `IFA_LOCAL` wins over `IFA_ADDRESS`, which holds the peer on
/// point-to-point links.
pub(crate) fn ipv4_of(message: &AddressMessage) -> Option<Ipv4Net> {
    let mut local = None;
    let mut address = None;

    for attr in &message.attributes {
        match attr {
            AddressAttribute::Local(IpAddr::V4(ip)) => local = Some(*ip),
            AddressAttribute::Address(IpAddr::V4(ip)) => address = Some(*ip),
            _ => {}
        }
    }

    let ip = local.or(address)?;
    Ipv4Net::new(ip, message.header.prefix_len).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_ipv4_of_prefers_local() {
        let mut message = AddressMessage::default();
        message.header.prefix_len = 24;
        message
            .attributes
            .push(AddressAttribute::Address(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        message
            .attributes
            .push(AddressAttribute::Local(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));

        assert_eq!(ipv4_of(&message), Some("10.0.0.5/24".parse().unwrap()));
    }

    #[test]
    fn test_ipv4_of_ignores_ipv6() {
        let mut message = AddressMessage::default();
        message.header.prefix_len = 64;
        message
            .attributes
            .push(AddressAttribute::Address("fe80::1".parse().unwrap()));

        assert_eq!(ipv4_of(&message), None);
    }
}
