//! Destination policy for outbound connections

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Whether `ip` is a globally routable unicast address
///
/// Loopback, private, shared (CGNAT), link-local, multicast, broadcast,
/// documentation, reserved and unspecified ranges are all rejected, as are
/// IPv6 unique-local addresses and IPv4-mapped forms of rejected addresses.
pub fn is_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_unicast_v4(ip),
        IpAddr::V6(ip) => is_unicast_v6(ip),
    }
}

fn is_unicast_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    let shared = a == 100 && (b & 0xC0) == 64;
    let reserved = a >= 240;
    let protocol_assignments = a == 192 && b == 0 && c == 0;
    let benchmarking = a == 198 && (b & 0xFE) == 18;
    let this_network = a == 0;

    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        || shared
        || reserved
        || protocol_assignments
        || benchmarking
        || this_network)
}

fn is_unicast_v6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_unicast_v4(mapped);
    }

    let first = ip.segments()[0];
    let unique_local = (first & 0xFE00) == 0xFC00;
    let link_local = (first & 0xFFC0) == 0xFE80;
    let documentation = first == 0x2001 && ip.segments()[1] == 0x0DB8;

    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || unique_local
        || link_local
        || documentation)
}
