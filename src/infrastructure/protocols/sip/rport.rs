//! RPORT support for NAT traversal (RFC 3581)
//!
//! The server stamps the observed source address onto the Via of responses it
//! generates, so endpoints behind NAT learn their public address.

use std::net::SocketAddr;
use tracing::debug;

/// Value of a `;name=value` Via parameter
pub fn via_param<'a>(via_header: &'a str, name: &str) -> Option<&'a str> {
    via_header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim())
    })
}

/// Set `rport` and `received` from the actual source address.
///
/// An existing `rport` (with or without value) is replaced in place; other
/// parameters keep their order.
pub fn add_rport_and_received(via_header: &str, source: SocketAddr) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut has_rport = false;

    for (i, part) in via_header.split(';').enumerate() {
        let key = part.trim().split('=').next().unwrap_or("").trim();
        if i > 0 && key == "rport" {
            parts.push(format!("rport={}", source.port()));
            has_rport = true;
        } else if i > 0 && key == "received" {
            continue;
        } else {
            parts.push(part.to_string());
        }
    }

    if !has_rport {
        parts.push(format!("rport={}", source.port()));
    }
    parts.push(format!("received={}", source.ip()));

    debug!(
        "Stamped Via with rport={} received={}",
        source.port(),
        source.ip()
    );
    parts.join(";")
}

/// Public address learned from a stamped Via
pub fn public_address(via_header: &str) -> Option<SocketAddr> {
    let port = via_param(via_header, "rport")?.parse().ok()?;
    let ip = via_param(via_header, "received")?.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}
