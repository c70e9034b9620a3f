//! Utility functions shared across the workspace.

use std::sync::LazyLock;

use if_addrs::IfAddr;

/// Characters allowed in service and cluster names.
static NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[0-9a-zA-Z@.:_-]+$").expect("invalid name pattern"));

/// Validate a service or cluster name.
///
/// Names must be non-empty and consist of alphanumerics plus `@ . : _ -`.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Resolve the local IPv4 address, falling back to loopback.
pub fn local_ip() -> String {
    let Ok(addrs) = if_addrs::get_if_addrs() else {
        return "127.0.0.1".to_string();
    };
    addrs
        .into_iter()
        .find_map(|iface| match iface.addr {
            IfAddr::V4(v4) if !iface.is_loopback() => Some(v4.ip.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
