use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::Url;

/// Note recorded on every record the SSRF policy rejects.
pub const SSRF_BLOCKED_NOTE: &str = "private/local target blocked by SSRF policy";

/// Returns true when a normalized URL targets a private, loopback,
/// link-local, or metadata destination.
///
/// Classification is purely syntactic (literal IPs, localhost names,
/// metadata hostnames) so online replay and dry-run stay deterministic;
/// DNS-based checks belong to a live fetch adapter.
pub fn is_private_or_local_target(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return true;
    }
    if is_localhost_hostname(&host) || is_metadata_hostname(&host) {
        return true;
    }
    let ip_candidate = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip_addr) = ip_candidate.parse::<IpAddr>() {
        return is_private_network_ip(ip_addr);
    }
    false
}

fn is_localhost_hostname(host: &str) -> bool {
    host == "localhost" || host.ends_with(".localhost")
}

fn is_metadata_hostname(host: &str) -> bool {
    matches!(
        host,
        "metadata"
            | "metadata.google.internal"
            | "instance-data"
            | "instance-data.ec2.internal"
            | "metadata.azure.internal"
    )
}

fn is_private_network_ip(ip_addr: IpAddr) -> bool {
    match ip_addr {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || is_metadata_ipv4(ipv4)
                || is_ipv4_carrier_grade_nat(ipv4)
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || ipv6.is_unique_local()
                || is_ipv6_link_local(ipv6)
        }
    }
}

fn is_metadata_ipv4(ipv4: Ipv4Addr) -> bool {
    ipv4 == Ipv4Addr::new(169, 254, 169, 254)
}

fn is_ipv4_carrier_grade_nat(ipv4: Ipv4Addr) -> bool {
    let octets = ipv4.octets();
    octets[0] == 100 && (64..=127).contains(&octets[1])
}

fn is_ipv6_link_local(ipv6: Ipv6Addr) -> bool {
    (ipv6.segments()[0] & 0xffc0) == 0xfe80
}
