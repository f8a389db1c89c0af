use ahash::HashMap as AHashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RouteMatchError {
    #[error("Invalid route pattern: {pattern}")]
    InvalidPattern { pattern: String },
    #[error("No matching route found for path: {path}")]
    NoMatch { path: String },
}

/// Returns true when `pattern` (exact or trailing-`*` wildcard) matches `path`.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

/// Length of the literal (non-wildcard) prefix of a pattern. Longer literal
/// prefixes are more specific and win ties.
pub fn literal_prefix_len(pattern: &str) -> usize {
    match pattern.strip_suffix('*') {
        Some(prefix) => prefix.len(),
        None => pattern.len(),
    }
}

/// Pattern table with deterministic most-specific-first matching.
///
/// Exact patterns live in a hash map for O(1) lookup; wildcard patterns are
/// kept sorted by descending literal-prefix length so the first hit is the
/// most specific one regardless of insertion order.
#[derive(Debug, Clone)]
pub struct RouteMatcher<V> {
    static_routes: AHashMap<String, V>,
    wildcard_routes: Vec<(String, V)>,
}

impl<V> RouteMatcher<V> {
    pub fn new<I>(routes: I) -> Result<Self, RouteMatchError>
    where
        I: IntoIterator<Item = (String, V)>,
    {
        let mut static_routes = AHashMap::default();
        let mut wildcard_routes = Vec::new();

        for (pattern, value) in routes {
            if pattern.is_empty() {
                return Err(RouteMatchError::InvalidPattern { pattern });
            }
            // A `*` anywhere but the end is not supported.
            if let Some(pos) = pattern.find('*') {
                if pos != pattern.len() - 1 {
                    return Err(RouteMatchError::InvalidPattern { pattern });
                }
                wildcard_routes.push((pattern, value));
            } else {
                static_routes.insert(pattern, value);
            }
        }

        wildcard_routes.sort_by(|(a, _), (b, _)| {
            literal_prefix_len(b)
                .cmp(&literal_prefix_len(a))
                .then_with(|| a.cmp(b))
        });

        Ok(Self {
            static_routes,
            wildcard_routes,
        })
    }

    /// Finds the most specific matching pattern: exact beats wildcard,
    /// longer literal prefix beats shorter.
    pub fn find_match(&self, path: &str) -> Option<(&str, &V)> {
        if let Some((pattern, value)) = self.static_routes.get_key_value(path) {
            return Some((pattern.as_str(), value));
        }
        self.wildcard_routes
            .iter()
            .find(|(pattern, _)| pattern_matches(pattern, path))
            .map(|(pattern, value)| (pattern.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.static_routes.is_empty() && self.wildcard_routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.static_routes.len() + self.wildcard_routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> RouteMatcher<String> {
        RouteMatcher::new(
            patterns
                .iter()
                .map(|p| (p.to_string(), p.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn exact_beats_wildcard() {
        let m = matcher(&["/api/users/*", "/api/users/me"]);
        let (pattern, _) = m.find_match("/api/users/me").unwrap();
        assert_eq!(pattern, "/api/users/me");
    }

    #[test]
    fn longer_literal_prefix_wins() {
        let m = matcher(&["/api/*", "/api/users/*"]);
        let (pattern, _) = m.find_match("/api/users/42").unwrap();
        assert_eq!(pattern, "/api/users/*");
        let (pattern, _) = m.find_match("/api/orders").unwrap();
        assert_eq!(pattern, "/api/*");
    }

    #[test]
    fn catch_all_matches_everything() {
        let m = matcher(&["/*"]);
        assert!(m.find_match("/anything/at/all").is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let m = matcher(&["/api/users"]);
        assert!(m.find_match("/api/orders").is_none());
    }

    #[test]
    fn interior_wildcard_is_rejected() {
        let err = RouteMatcher::new([("/api/*/users".to_string(), ())]).unwrap_err();
        assert!(matches!(err, RouteMatchError::InvalidPattern { .. }));
    }

    #[test]
    fn specificity_is_insertion_order_independent() {
        let a = matcher(&["/api/*", "/api/users/*", "/api/users/admin/*"]);
        let b = matcher(&["/api/users/admin/*", "/api/*", "/api/users/*"]);
        for m in [&a, &b] {
            let (pattern, _) = m.find_match("/api/users/admin/1").unwrap();
            assert_eq!(pattern, "/api/users/admin/*");
        }
    }
}
