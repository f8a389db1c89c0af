//! TTL response cache for GET requests.
//!
//! Keys are `METHOD|tenant|path|sortedQuery`, so tenant-scoped responses
//! never collide. Only 2xx GET responses are stored. Expired entries are
//! treated as misses and purged lazily; a background sweeper can be started
//! for busy deployments.

use crate::utils::path::sort_query;
use actix_web::http::header::HeaderMap;
use actix_web::web::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// One cached response.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// In-memory GET response cache with a single global TTL.
#[derive(Debug)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, 10_000)
    }

    pub fn with_capacity(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Builds the canonical cache key for a request.
    pub fn key(method: &str, tenant_id: Option<&str>, path: &str, query: &str) -> String {
        format!(
            "{}|{}|{}|{}",
            method,
            tenant_id.unwrap_or(""),
            path,
            sort_query(query)
        )
    }

    /// Returns the cached entry for the key when present and fresh.
    /// Expired entries are removed on the way out.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        {
            let entries = self.entries.read().unwrap();
            match entries.get(key) {
                Some(entry) if entry.is_fresh() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Stale hit: drop the expired entry.
        self.entries.write().unwrap().remove(key);
        None
    }

    /// Stores a response when it is cacheable (2xx only; callers must have
    /// already checked the GET-only rule).
    pub fn store(&self, key: String, status: u16, headers: &HeaderMap, body: Bytes) {
        if !(200..300).contains(&status) {
            return;
        }

        let header_pairs: Vec<(String, String)> = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let entry = CacheEntry {
            status,
            headers: header_pairs,
            body,
            expires_at: Instant::now() + self.ttl,
        };

        let mut entries = self.entries.write().unwrap();
        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // At capacity: make room by dropping expired entries first.
            entries.retain(|_, e| e.is_fresh());
            if entries.len() >= self.max_entries {
                return;
            }
        }
        entries.insert(key, entry);
    }

    /// Removes every expired entry. Called by the background sweeper.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.is_fresh());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
