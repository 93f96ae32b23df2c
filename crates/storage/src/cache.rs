//! Read-through cache for artifact list queries.
//!
//! Keys are a canonical fingerprint of the query descriptor. Entries carry
//! the filter scope they were computed under so a write can invalidate every
//! page it might affect; over-invalidation is fine, stale hits are not.

use pagevault_core::types::{ArtifactQuery, CapturedArtifact, ListResult};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Canonical fingerprint of a query descriptor. Absent optional fields
/// encode as `-`, datetimes round down to whole seconds.
pub fn fingerprint(query: &ArtifactQuery) -> String {
    fn opt(v: Option<&str>) -> String {
        match v {
            Some(s) => s.to_string(),
            None => "-".to_string(),
        }
    }

    let canonical = format!(
        "v1|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{:?}|{:?}",
        opt(query.instance_id.as_deref()),
        opt(query.session_id.as_deref()),
        opt(query.tenant_id.as_deref()),
        opt(query.user_id.as_deref()),
        opt(query.tag.as_deref()),
        opt(query.format.map(|f| f.as_str())),
        query
            .created_after
            .map(|t| t.timestamp().to_string())
            .unwrap_or_else(|| "-".to_string()),
        query
            .created_before
            .map(|t| t.timestamp().to_string())
            .unwrap_or_else(|| "-".to_string()),
        query
            .max_age_secs
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string()),
        query.limit,
        query.offset,
        query.order_by,
        query.order,
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The tenant/session/instance filter scope an entry was computed under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheScope {
    pub tenant_id: Option<String>,
    pub session_id: Option<String>,
    pub instance_id: Option<String>,
}

impl CacheScope {
    pub fn of_query(query: &ArtifactQuery) -> Self {
        Self {
            tenant_id: query.tenant_id.clone(),
            session_id: query.session_id.clone(),
            instance_id: query.instance_id.clone(),
        }
    }

    pub fn of_record(artifact: &CapturedArtifact) -> Self {
        Self {
            tenant_id: Some(artifact.tenant_id.clone()),
            session_id: Some(artifact.session_id.clone()),
            instance_id: Some(artifact.instance_id.clone()),
        }
    }

    /// Whether two scopes can match the same records. `None` on either side
    /// of a dimension is a wildcard, so this errs toward intersecting.
    pub fn intersects(&self, other: &CacheScope) -> bool {
        fn dim(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(x), Some(y)) => x == y,
                _ => true,
            }
        }
        dim(&self.tenant_id, &other.tenant_id)
            && dim(&self.session_id, &other.session_id)
            && dim(&self.instance_id, &other.instance_id)
    }
}

struct CacheEntry {
    result: ListResult,
    scope: CacheScope,
    expires_at: Instant,
    last_used: AtomicU64,
}

/// Bounded TTL cache with LRU eviction. Reads share the read lock and stamp
/// recency atomically, so concurrent gets never block each other.
pub struct ReadCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ReadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, query: &ArtifactQuery) -> Option<ListResult> {
        let key = fingerprint(query);
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get(&key) {
            if Instant::now() < entry.expires_at {
                let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
                entry.last_used.store(stamp, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.result.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, query: &ArtifactQuery, result: ListResult, ttl: Duration) {
        let key = fingerprint(query);
        let scope = CacheScope::of_query(query);
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = CacheEntry {
            result,
            scope,
            expires_at: Instant::now() + ttl,
            last_used: AtomicU64::new(stamp),
        };

        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !map.contains_key(&key) && map.len() >= self.capacity {
            let now = Instant::now();
            map.retain(|_, e| e.expires_at > now);
        }
        if !map.contains_key(&key) && map.len() >= self.capacity {
            let lru = map
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru {
                map.remove(&lru_key);
            }
        }
        map.insert(key, entry);
    }

    /// Drop every entry whose filter scope intersects `scope`.
    pub fn invalidate(&self, scope: &CacheScope) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| !entry.scope.intersects(scope));
        let dropped = before - map.len();
        if dropped > 0 {
            debug!(dropped, "Cache entries invalidated by write");
        }
    }

    /// Drop only the entries whose cached pages contain `id`. Used by
    /// access-time touches so unrelated entries survive.
    pub fn invalidate_record(&self, id: &str) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, entry| !entry.result.items.iter().any(|a| a.id == id));
    }

    pub fn clear(&self) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pagevault_core::types::ArtifactFormat;

    fn query_for(tenant: &str) -> ArtifactQuery {
        ArtifactQuery {
            tenant_id: Some(tenant.to_string()),
            ..Default::default()
        }
    }

    fn empty_page() -> ListResult {
        ListResult::page(Vec::new(), 0, 0)
    }

    #[test]
    fn test_fingerprint_is_canonical() {
        let a = ArtifactQuery::default();
        let b = ArtifactQuery::default();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = ArtifactQuery {
            tenant_id: Some("acme".to_string()),
            ..Default::default()
        };
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_fingerprint_rounds_dates_to_seconds() {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let a = ArtifactQuery {
            created_after: Some(base),
            ..Default::default()
        };
        let b = ArtifactQuery {
            created_after: Some(base + chrono::Duration::milliseconds(400)),
            ..Default::default()
        };
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_hit_then_expiry() {
        let cache = ReadCache::new(8);
        let q = query_for("acme");
        cache.put(&q, empty_page(), Duration::from_millis(40));
        assert!(cache.get(&q).is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&q).is_none());
    }

    #[test]
    fn test_scope_invalidation_is_conservative() {
        let cache = ReadCache::new(8);
        let scoped = query_for("acme");
        let unscoped = ArtifactQuery::default();
        let other = query_for("globex");
        cache.put(&scoped, empty_page(), Duration::from_secs(60));
        cache.put(&unscoped, empty_page(), Duration::from_secs(60));
        cache.put(&other, empty_page(), Duration::from_secs(60));

        cache.invalidate(&CacheScope {
            tenant_id: Some("acme".to_string()),
            session_id: Some("s1".to_string()),
            instance_id: Some("i1".to_string()),
        });

        // The matching tenant and the wildcard entry go; the other tenant stays.
        assert!(cache.get(&scoped).is_none());
        assert!(cache.get(&unscoped).is_none());
        assert!(cache.get(&other).is_some());
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = ReadCache::new(2);
        let q1 = query_for("t1");
        let q2 = query_for("t2");
        let q3 = query_for("t3");
        cache.put(&q1, empty_page(), Duration::from_secs(60));
        cache.put(&q2, empty_page(), Duration::from_secs(60));

        // Refresh q1 so q2 is the LRU victim.
        assert!(cache.get(&q1).is_some());
        cache.put(&q3, empty_page(), Duration::from_secs(60));

        assert!(cache.get(&q1).is_some());
        assert!(cache.get(&q2).is_none());
        assert!(cache.get(&q3).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_invalidate_record_targets_containing_pages() {
        let cache = ReadCache::new(8);
        let artifact = CapturedArtifact {
            id: "a1".to_string(),
            instance_id: "i1".to_string(),
            session_id: "s1".to_string(),
            tenant_id: "acme".to_string(),
            user_id: None,
            hash: "h".to_string(),
            storage_path: "/tmp/a1.png".to_string(),
            format: ArtifactFormat::Png,
            byte_size: 1,
            width: None,
            height: None,
            full_page: false,
            quality: None,
            tags: Vec::new(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            accessed_at: None,
        };
        let with_record = query_for("acme");
        let without_record = query_for("globex");
        cache.put(
            &with_record,
            ListResult::page(vec![artifact], 1, 0),
            Duration::from_secs(60),
        );
        cache.put(&without_record, empty_page(), Duration::from_secs(60));

        cache.invalidate_record("a1");
        assert!(cache.get(&with_record).is_none());
        assert!(cache.get(&without_record).is_some());
    }
}
