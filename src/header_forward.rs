//! Header-forwarding policy: classifies every header name into
//! a group, then applies that group's forwarding mode to decide what
//! crosses the translate-directed proxy boundary in each direction.

use crate::headers::StringMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderGroup {
    Identity,
    Capabilities,
    Cookie,
    Other,
    Forward,
    Cors,
    Secure,
    Ssl,
    Transformation,
    Auth,
    Link,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Drop the header entirely.
    No,
    /// Forward verbatim.
    Yes,
    /// Forward, but also append/mangle a derived value (e.g. Via).
    Both,
    /// Replace with a value this proxy derives itself.
    Mangle,
}

/// Headers that never cross a hop boundary regardless of group, per
/// RFC 2616 13.5.1.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn classify(name: &str) -> HeaderGroup {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "via" | "x-forwarded-for" => HeaderGroup::Identity,
        "user-agent" | "server" => HeaderGroup::Capabilities,
        "host" => HeaderGroup::Forward,
        "referer" | "location" | "content-location" => HeaderGroup::Link,
        "authorization" | "www-authenticate" | "authentication-info" => HeaderGroup::Auth,
        _ if lower.starts_with("cookie") || lower.starts_with("set-cookie") => HeaderGroup::Cookie,
        _ if lower.starts_with("x-cm4all-beng-") => HeaderGroup::Secure,
        _ if lower.starts_with("access-control-") || lower == "origin" => HeaderGroup::Cors,
        _ if lower.starts_with("ssl-") || lower.starts_with("x-ssl-") => HeaderGroup::Ssl,
        _ if lower.starts_with("x-cm4all-transformation") => HeaderGroup::Transformation,
        _ => HeaderGroup::Other,
    }
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// Whether `Upgrade`/`Sec-WebSocket-*` must pass through verbatim, bypassing
/// the hop-by-hop drop above (an upgraded connection is no longer plain
/// HTTP once the switch happens).
pub fn is_upgrade_passthrough(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "upgrade" || lower.starts_with("sec-websocket-")
}

/// Per-group forwarding mode for one direction (request or response); the
/// same group can behave differently request-side vs. response-side (e.g.
/// `Auth` is mangled on the way out but forwarded on the way back).
pub struct Policy {
    pub request_modes: [ForwardMode; 11],
    pub response_modes: [ForwardMode; 11],
}

impl Default for Policy {
    fn default() -> Self {
        use ForwardMode::*;
        use HeaderGroup::*;
        let mut request_modes = [Yes; 11];
        let mut response_modes = [Yes; 11];
        request_modes[Identity as usize] = Mangle;
        request_modes[Forward as usize] = Mangle;
        request_modes[Cookie as usize] = Mangle;
        request_modes[Secure as usize] = No;
        response_modes[Secure as usize] = No;
        response_modes[Identity as usize] = Both;
        Policy { request_modes, response_modes }
    }
}

impl HeaderGroup {
    fn index(self) -> usize {
        self as usize
    }
}

/// Applies the forwarding policy to a request's headers, producing the
/// headers sent upstream. `is_cache_lookup` governs the `If-*` special
/// rule: conditional headers are only forwarded when the caller *is* the
/// cache performing its own revalidation, never a plain passthrough
/// request (the cache itself decides whether to add them).
pub fn forward_request_headers(
    source: &StringMap,
    policy: &Policy,
    local_identity: &str,
    is_cache_lookup: bool,
    upgrade_requested: bool,
) -> StringMap {
    let mut out = StringMap::new();
    for (name, value) in source.iter() {
        if is_hop_by_hop(name) && !(upgrade_requested && is_upgrade_passthrough(name)) {
            continue;
        }
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("if-") && !is_cache_lookup {
            continue;
        }

        let group = classify(name);
        match policy.request_modes[group.index()] {
            ForwardMode::No => {}
            ForwardMode::Yes => out.add(name, value),
            ForwardMode::Both => {
                out.add(name, value);
                if group == HeaderGroup::Identity && lower == "via" {
                    out.set("via", format!("{value}, {local_identity}"));
                }
            }
            ForwardMode::Mangle => match group {
                HeaderGroup::Identity if lower == "x-forwarded-for" => {
                    out.set("x-forwarded-for", value);
                }
                HeaderGroup::Forward => {
                    out.set("host", value);
                }
                _ => out.add(name, value),
            },
        }
    }
    out
}

/// Applies the forwarding policy to a response's headers before they reach
/// the downstream client.
pub fn forward_response_headers(source: &StringMap, policy: &Policy, local_identity: &str) -> StringMap {
    let mut out = StringMap::new();
    for (name, value) in source.iter() {
        if is_hop_by_hop(name) && !is_upgrade_passthrough(name) {
            continue;
        }
        let group = classify(name);
        match policy.response_modes[group.index()] {
            ForwardMode::No => {}
            ForwardMode::Yes => out.add(name, value),
            ForwardMode::Both => {
                out.add(name, value);
                if name.eq_ignore_ascii_case("via") {
                    out.set("via", format!("{value}, {local_identity}"));
                }
            }
            ForwardMode::Mangle => out.add(name, value),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_classified() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn secure_headers_are_dropped_both_directions() {
        let mut source = StringMap::new();
        source.add("X-CM4all-Beng-User", "alice");
        source.add("X-Custom", "ok");
        let policy = Policy::default();

        let out = forward_request_headers(&source, &policy, "proxy-1", false, false);
        assert!(out.get("x-cm4all-beng-user").is_none());
        assert!(out.get("x-custom").is_some());
    }

    #[test]
    fn if_headers_only_forwarded_for_cache_lookups() {
        let mut source = StringMap::new();
        source.add("If-None-Match", "\"abc\"");
        let policy = Policy::default();

        let plain = forward_request_headers(&source, &policy, "proxy-1", false, false);
        assert!(plain.get("if-none-match").is_none());

        let cache_path = forward_request_headers(&source, &policy, "proxy-1", true, false);
        assert!(cache_path.get("if-none-match").is_some());
    }

    #[test]
    fn upgrade_headers_bypass_hop_by_hop_drop_when_requested() {
        let mut source = StringMap::new();
        source.add("Upgrade", "websocket");
        source.add("Connection", "Upgrade");
        let policy = Policy::default();

        let out = forward_request_headers(&source, &policy, "proxy-1", false, true);
        assert!(out.get("upgrade").is_some());
    }
}
