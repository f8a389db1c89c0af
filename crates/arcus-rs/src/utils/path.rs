/// Joins a backend origin with an already-rewritten path and optional query.
pub fn format_target(origin: &str, path: &str, query: &str) -> String {
    let origin = origin.trim_end_matches('/');
    if query.is_empty() {
        format!("{}{}", origin, path)
    } else {
        format!("{}{}?{}", origin, path, query)
    }
}

/// Canonicalizes a query string by sorting its pairs, so cache keys are
/// stable under parameter reordering.
pub fn sort_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

/// Extracts the host (and port, when present) from an origin URL.
pub fn host_of(origin: &str) -> &str {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    rest.split('/').next().unwrap_or(rest)
}

/// Host with a default port appended when the origin does not carry one,
/// shaped for `tokio::net::lookup_host`.
pub fn host_port_of(origin: &str) -> String {
    let https = origin.starts_with("https://");
    let host = host_of(origin);
    if host.contains(':') {
        host.to_string()
    } else if https {
        format!("{}:443", host)
    } else {
        format!("{}:80", host)
    }
}
