//! Hostname normalization
//!
//! Every place that compares hostnames (registry keys, LAN route keys, the
//! inbound Host header, the TLS SNI name and aliases derived from a proxy's
//! public URL) goes through [`normalize_hostname`]. Two spellings of the same
//! host must always produce the same key or routing silently misses.

/// Normalize a hostname for use as a lookup key.
///
/// Lowercases, trims whitespace, strips IPv6 brackets, strips an explicit
/// port and strips trailing dots. Returns an empty string when nothing is
/// left. The function is idempotent.
pub fn normalize_hostname(host: &str) -> String {
    let host = host.trim().to_lowercase();
    if host.is_empty() {
        return String::new();
    }

    let mut host = host.as_str();

    if host.starts_with('[') && host.ends_with(']') {
        host = &host[1..host.len() - 1];
    }

    if let Some(h) = split_host_port(host) {
        host = h;
    }

    host.trim_matches(|c| c == '[' || c == ']')
        .trim_end_matches('.')
        .to_string()
}

/// Split `host:port` or `[v6]:port`, returning the host part.
///
/// Returns `None` when there is no port to strip, including bare IPv6
/// literals such as `::1` whose colons are not a port separator.
fn split_host_port(s: &str) -> Option<&str> {
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']')?;
        return rest[end + 1..].starts_with(':').then(|| &rest[..end]);
    }

    let (host, _port) = s.rsplit_once(':')?;
    if host.contains(':') {
        return None;
    }
    Some(host)
}
