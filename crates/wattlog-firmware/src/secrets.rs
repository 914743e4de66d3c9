//! Build-time credentials and collector endpoint, injected by `build.rs`

use wattlog_core::config::{COLLECTOR_PORT, ServerAddress};

pub const WIFI_SSID: &str = env!("WIFI_SSID");
pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");
pub const COLLECTOR_HOST: &str = env!("COLLECTOR_HOST");
pub const COLLECTOR_PORT_STR: &str = env!("COLLECTOR_PORT");

/// Parses a dotted IPv4 address.
pub fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = s.trim().split('.');
    for octet in octets.iter_mut() {
        *octet = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

/// Collector configured at build time, if the host is a valid address.
pub fn configured_collector() -> Option<ServerAddress> {
    let ip = parse_ipv4(COLLECTOR_HOST)?;
    let port = COLLECTOR_PORT_STR.parse().unwrap_or(COLLECTOR_PORT);
    Some(ServerAddress::new(ip, port))
}
