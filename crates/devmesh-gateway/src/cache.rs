//! Short-TTL response cache for idempotent queries.
//!
//! The fingerprint covers the canonicalized operation text, the
//! canonical variable JSON, and the caller's opt-in scope token, so
//! formatting differences hit the same entry while different variables
//! or scopes never collide. Mutations invalidate every entry whose
//! originating-subgraph set intersects the mutation's targets.
//! Subscriptions are never cached.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use devmesh_graphql::request::GraphQLResponse;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

/// A cached response and its provenance.
#[derive(Debug, Clone)]
struct CacheEntry {
    response:   GraphQLResponse,
    created_at: Instant,
    ttl:        Duration,
    subgraphs:  HashSet<String>,
}

/// The cache.
pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl ResponseCache {
    /// Create a cache bounded to `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compute a fingerprint.
    ///
    /// `canonical_query` must already be normalized
    /// ([`devmesh_graphql::ops::canonical_text`]); `canonical_variables`
    /// must be key-sorted JSON. The scope token is an opaque value from
    /// the `x-cache-scope` header, or `None`.
    #[must_use]
    pub fn fingerprint(
        canonical_query: &str,
        canonical_variables: &str,
        scope: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_query.as_bytes());
        hasher.update([0]);
        hasher.update(canonical_variables.as_bytes());
        hasher.update([0]);
        hasher.update(scope.unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a fresh entry.
    #[must_use]
    pub fn get(&self, fingerprint: &str) -> Option<GraphQLResponse> {
        let mut entries = self.entries.lock();
        let entry = entries.get(fingerprint)?;
        if entry.created_at.elapsed() > entry.ttl {
            entries.pop(fingerprint);
            return None;
        }
        debug!(fingerprint, "response cache hit");
        Some(entry.response.clone())
    }

    /// Store a response with its originating subgraphs.
    pub fn store(
        &self,
        fingerprint: String,
        response: &GraphQLResponse,
        ttl: Duration,
        subgraphs: HashSet<String>,
    ) {
        // Responses with errors are never cached: a transient subgraph
        // failure must not be replayed for the TTL window.
        if !response.is_ok() {
            return;
        }
        self.entries.lock().put(
            fingerprint,
            CacheEntry {
                response: response.clone(),
                created_at: Instant::now(),
                ttl,
                subgraphs,
            },
        );
    }

    /// Invalidate every entry whose origin set intersects `touched`.
    /// Returns the number of entries removed.
    pub fn invalidate_subgraphs(&self, touched: &HashSet<String>) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.subgraphs.is_disjoint(touched))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        if !doomed.is_empty() {
            debug!(removed = doomed.len(), "cache invalidated by mutation");
        }
        doomed.len()
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn origins(names: &[&str]) -> HashSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_fingerprint_separates_variables_and_scope() {
        let base = ResponseCache::fingerprint("{ a }", "null", None);
        assert_ne!(base, ResponseCache::fingerprint("{ a }", "{\"x\":1}", None));
        assert_ne!(base, ResponseCache::fingerprint("{ a }", "null", Some("user-1")));
        assert_eq!(base, ResponseCache::fingerprint("{ a }", "null", None));
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ResponseCache::new(16);
        let response = GraphQLResponse::data(json!({"x": 1}));
        cache.store(
            "fp".to_string(),
            &response,
            Duration::from_secs(60),
            origins(&["git"]),
        );

        let hit = cache.get("fp").unwrap();
        assert_eq!(hit.data, response.data);
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = ResponseCache::new(16);
        cache.store(
            "fp".to_string(),
            &GraphQLResponse::data(json!({})),
            Duration::ZERO,
            origins(&["git"]),
        );
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("fp").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_error_responses_not_cached() {
        let cache = ResponseCache::new(16);
        let response = GraphQLResponse::error(
            devmesh_graphql::request::WireError::with_code("x", "SUBGRAPH_TIMEOUT"),
        );
        cache.store(
            "fp".to_string(),
            &response,
            Duration::from_secs(60),
            origins(&["git"]),
        );
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn test_invalidation_by_subgraph_overlap() {
        let cache = ResponseCache::new(16);
        let response = GraphQLResponse::data(json!({}));
        cache.store(
            "git-only".to_string(),
            &response,
            Duration::from_secs(60),
            origins(&["git"]),
        );
        cache.store(
            "agent-only".to_string(),
            &response,
            Duration::from_secs(60),
            origins(&["claude-agent"]),
        );
        cache.store(
            "both".to_string(),
            &response,
            Duration::from_secs(60),
            origins(&["git", "claude-agent"]),
        );

        let removed = cache.invalidate_subgraphs(&origins(&["git"]));
        assert_eq!(removed, 2);
        assert!(cache.get("git-only").is_none());
        assert!(cache.get("both").is_none());
        assert!(cache.get("agent-only").is_some());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResponseCache::new(2);
        let response = GraphQLResponse::data(json!({}));
        for key in ["a", "b", "c"] {
            cache.store(
                key.to_string(),
                &response,
                Duration::from_secs(60),
                origins(&["git"]),
            );
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
    }
}
