//! # Service Info Cache
//!
//! In-memory registration table shared by service agent and directory agent
//! handlers. One `RwLock` guards the whole map: register, deregister and sweep
//! take the write lock so each returns a consistent previous/current pair,
//! snapshots take the read lock and hand out clones.

use crate::error::{Result, SlpError};
use crate::model::{ServiceInfo, ServiceKey};
use log::debug;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Entry state before and after a cache mutation, used to compute forwarding deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult {
    pub previous: Option<ServiceInfo>,
    pub current: Option<ServiceInfo>,
}

#[derive(Default)]
pub struct ServiceInfoCache {
    services: RwLock<HashMap<ServiceKey, ServiceInfo>>,
}

impl ServiceInfoCache {
    pub fn new() -> Self {
        ServiceInfoCache::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ServiceKey, ServiceInfo>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ServiceKey, ServiceInfo>> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, entry: ServiceInfo, is_update: bool) -> Result<CacheResult> {
        self.register_at(entry, is_update, Instant::now())
    }

    /// Fresh registrations replace the entry; updates merge scopes and attributes
    /// into it and refresh its lifetime. Either way the new scopes must overlap
    /// those of a live entry.
    pub fn register_at(
        &self,
        mut entry: ServiceInfo,
        is_update: bool,
        now: Instant,
    ) -> Result<CacheResult> {
        let key = entry.key();
        let mut services = self.write();
        let previous = services.get(&key).filter(|e| !e.is_expired(now)).cloned();
        if let Some(existing) = &previous {
            check_scopes(existing, &entry)?;
        }

        let current = match (&previous, is_update) {
            (Some(existing), true) => {
                let mut merged = existing.clone();
                merged.url = entry.url.clone();
                merged.scopes = existing.scopes.union(&entry.scopes);
                merged.attributes = existing.attributes.merge(&entry.attributes);
                merged.fresh = false;
                merged.refresh_expiry(now);
                merged
            }
            _ => {
                entry.fresh = !is_update;
                entry.refresh_expiry(now);
                entry
            }
        };

        debug!("Cached {} (update={}), expires {:?}", current.url, is_update, current.expires_at);
        services.insert(key, current.clone());
        Ok(CacheResult { previous, current: Some(current) })
    }

    /// Removes the entry, or with `is_update` only the attribute tags named by `entry`.
    /// Deregistrations carry no service type, so the entry is looked up by URL text.
    pub fn deregister(&self, entry: &ServiceInfo, is_update: bool) -> Result<CacheResult> {
        let mut services = self.write();
        let (key, existing) = services
            .iter()
            .find(|(k, _)| k.url == entry.url.as_str())
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or_else(|| SlpError::NotFound(entry.url.to_string()))?;
        check_scopes(&existing, entry)?;

        if is_update {
            let tags: Vec<String> = entry.attributes.tags().map(str::to_string).collect();
            let mut reduced = existing.clone();
            reduced.attributes = existing.attributes.remove_tags(&tags);
            reduced.fresh = false;
            services.insert(key, reduced.clone());
            debug!("Removed attributes {:?} from {}", tags, reduced.url);
            Ok(CacheResult { previous: Some(existing), current: Some(reduced) })
        } else {
            services.remove(&key);
            debug!("Uncached {}", existing.url);
            Ok(CacheResult { previous: Some(existing), current: None })
        }
    }

    /// Removes and returns every entry whose expiry is at or before `now`.
    pub fn sweep(&self, now: Instant) -> Vec<ServiceInfo> {
        let mut services = self.write();
        let expired: Vec<ServiceKey> = services
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        expired.iter().filter_map(|k| services.remove(k)).collect()
    }

    pub fn snapshot<F>(&self, predicate: F) -> Vec<ServiceInfo>
    where
        F: Fn(&ServiceInfo) -> bool,
    {
        self.read().values().filter(|e| predicate(e)).cloned().collect()
    }

    pub fn get(&self, key: &ServiceKey) -> Option<ServiceInfo> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) -> Vec<ServiceInfo> {
        self.write().drain().map(|(_, v)| v).collect()
    }
}

fn check_scopes(existing: &ServiceInfo, requested: &ServiceInfo) -> Result<()> {
    if existing.scopes.is_empty()
        || requested.scopes.is_empty()
        || existing.scopes.overlaps(&requested.scopes)
    {
        return Ok(());
    }
    Err(SlpError::ScopeMismatch {
        url: existing.url.to_string(),
        registered: existing.scopes.to_wire(),
        requested: requested.scopes.to_wire(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attributes, Scopes, ServiceUrl};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn service(url: &str, lifetime: u16, scopes: &[&str], attrs: &str) -> ServiceInfo {
        ServiceInfo::new(
            ServiceUrl::new(url, lifetime),
            Scopes::new(scopes),
            Attributes::from_wire(attrs).unwrap(),
            "en",
        )
    }

    #[test]
    fn test_first_registration() {
        let cache = ServiceInfoCache::new();
        let first = service("service:foo://h", 60, &["a"], "(x=1)");
        let result = cache.register(first, false).unwrap();
        assert!(result.previous.is_none());
        let current = result.current.unwrap();
        assert!(current.fresh);
        assert!(current.expires_at.is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_fresh_registration_replaces() {
        let cache = ServiceInfoCache::new();
        let first = service("service:foo://h", 60, &["a", "b"], "(x=1),(y=2)");
        cache.register(first, false).unwrap();
        let second = service("service:foo://h", 30, &["b", "c"], "(z=3)");
        let result = cache.register(second, false).unwrap();

        let previous = result.previous.unwrap();
        assert_eq!(previous.attributes.to_wire(), "(x=1),(y=2)");
        let current = result.current.unwrap();
        assert_eq!(current.scopes, Scopes::new(["b", "c"]));
        assert_eq!(current.attributes.to_wire(), "(z=3)");
        assert_eq!(current.url.lifetime(), 30);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_update_registration_merges_without_duplicates() {
        let cache = ServiceInfoCache::new();
        cache.register(service("service:foo://h", 60, &["a"], "(x=1,2)"), true).unwrap();
        let update = service("service:foo://h", 90, &["a"], "(x=2,3),(y=4)");
        let result = cache.register(update, true).unwrap();

        let current = result.current.unwrap();
        assert_eq!(current.attributes.to_wire(), "(x=1,2,3),(y=4)");
        assert_eq!(current.url.lifetime(), 90);
        assert!(!current.fresh);
    }

    #[test]
    fn test_update_refreshes_expiry() {
        let cache = ServiceInfoCache::new();
        let t0 = Instant::now();
        cache.register_at(service("service:foo://h", 10, &["a"], ""), false, t0).unwrap();
        let t1 = t0 + Duration::from_secs(8);
        cache.register_at(service("service:foo://h", 10, &["a"], ""), true, t1).unwrap();
        assert!(cache.sweep(t0 + Duration::from_secs(12)).is_empty());
        assert_eq!(cache.sweep(t1 + Duration::from_secs(10)).len(), 1);
    }

    #[test]
    fn test_disjoint_scopes_fail() {
        let cache = ServiceInfoCache::new();
        cache.register(service("service:foo://h", 60, &["a"], "(x=1)"), false).unwrap();
        for is_update in [true, false] {
            let moved = service("service:foo://h", 60, &["b"], "");
            let err = cache.register(moved, is_update).unwrap_err();
            assert!(matches!(err, SlpError::ScopeMismatch { .. }));
            assert_eq!(err.error_code(), 4);
        }
        let kept = cache.snapshot(|_| true).remove(0);
        assert_eq!(kept.scopes, Scopes::new(["a"]));
        assert_eq!(kept.attributes.to_wire(), "(x=1)");

        // Overlapping scopes may move the service.
        let result = cache.register(service("service:foo://h", 60, &["a", "b"], ""), false);
        assert!(result.is_ok());
        assert!(cache.register(service("service:foo://h", 60, &["b"], ""), false).is_ok());
    }

    #[test]
    fn test_expired_entry_does_not_constrain_scopes() {
        let cache = ServiceInfoCache::new();
        let t0 = Instant::now();
        cache.register_at(service("service:foo://h", 10, &["a"], ""), false, t0).unwrap();
        let later = t0 + Duration::from_secs(11);
        let result = cache.register_at(service("service:foo://h", 10, &["b"], ""), false, later);
        assert!(result.unwrap().previous.is_none());
    }

    #[test]
    fn test_deregister_unknown_fails() {
        let cache = ServiceInfoCache::new();
        let missing = service("service:foo://h", 60, &["a"], "");
        let err = cache.deregister(&missing, false).unwrap_err();
        assert!(matches!(err, SlpError::NotFound(_)));
    }

    #[test]
    fn test_deregister_removes() {
        let cache = ServiceInfoCache::new();
        cache.register(service("service:foo://h", 60, &["a"], ""), false).unwrap();
        let dereg = service("service:foo://h", 0, &["a"], "");
        let result = cache.deregister(&dereg, false).unwrap();
        assert!(result.previous.is_some());
        assert!(result.current.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_update_deregister_removes_tags_only() {
        let cache = ServiceInfoCache::new();
        cache.register(service("service:foo://h", 60, &["a"], "(x=1),(y=2)"), false).unwrap();
        let dereg = service("service:foo://h", 0, &["a"], "x");
        let result = cache.deregister(&dereg, true).unwrap();
        assert_eq!(result.current.unwrap().attributes.to_wire(), "(y=2)");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_removes_expired() {
        let cache = ServiceInfoCache::new();
        let now = Instant::now();
        cache.register_at(service("service:short://h", 13, &["a"], ""), false, now).unwrap();
        cache.register_at(service("service:long://h", 600, &["a"], ""), false, now).unwrap();
        let forever = service("service:forever://h", ServiceUrl::LIFETIME_PERMANENT, &["a"], "");
        cache.register_at(forever, false, now).unwrap();

        assert!(cache.sweep(now + Duration::from_secs(12)).is_empty());
        let removed = cache.sweep(now + Duration::from_secs(13));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].url.as_str(), "service:short://h");

        let left = cache.snapshot(|_| true);
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|e| e.url.as_str() != "service:short://h"));
    }

    #[test]
    fn test_snapshot_filters() {
        let cache = ServiceInfoCache::new();
        cache.register(service("service:foo://a", 60, &["x"], ""), false).unwrap();
        cache.register(service("service:bar://b", 60, &["y"], ""), false).unwrap();
        let xs = cache.snapshot(|e| e.scopes.contains("x"));
        assert_eq!(xs.len(), 1);
        assert_eq!(xs[0].url.as_str(), "service:foo://a");
    }

    #[test]
    fn test_concurrent_registrations() {
        let cache = Arc::new(ServiceInfoCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for j in 0..50 {
                        let url = format!("service:foo://h{}", j % 10);
                        let attrs = format!("(w{}={})", i, j);
                        cache.register(service(&url, 60, &["a"], &attrs), true).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 10);
        let entry = cache.snapshot(|e| e.url.as_str() == "service:foo://h0").remove(0);
        // Every writer's tag survives the merges.
        assert_eq!(entry.attributes.len(), 8);
    }
}
