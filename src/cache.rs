//! TTL-memoised lookup in front of the credential store (spec.md §3
//! `RegistrationCacheEntry`, §4.I, §5).
//!
//! A single mutex guards the whole table; every operation is short (a map
//! lookup plus, on miss, one store round-trip), so a coarse lock is the
//! right call here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::credentials::{ConsoleRegistration, CredentialStore};
use crate::error::Error;

#[derive(Clone)]
struct CacheEntry {
    record: Option<ConsoleRegistration>,
    cached_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) >= ttl
    }
}

/// Point-in-time counters for cache effectiveness (spec.md §4.I).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub expired_cleaned: u64,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
}

/// TTL-memoised view of a [`CredentialStore`].
///
/// **Invariant (spec.md §8):** every write through this API invalidates the
/// matching entry before the call returns, so a concurrent reader can never
/// observe a cached boolean that predates the write.
pub struct RegistrationCache<S: CredentialStore> {
    store: Arc<S>,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl<S: CredentialStore> RegistrationCache<S> {
    pub fn new(store: Arc<S>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock();
        CacheStats {
            entries: guard.entries.len(),
            ..guard.stats
        }
    }

    /// TTL-memoised `is_registered(ip)` (spec.md §4.I).
    pub async fn is_registered(&self, ip: &str) -> Result<bool, Error> {
        Ok(self.get_registration(ip).await?.is_some())
    }

    /// TTL-memoised registration lookup; only populated when the backing
    /// record is registered.
    pub async fn get_registration(&self, ip: &str) -> Result<Option<ConsoleRegistration>, Error> {
        let now = Instant::now();
        {
            let mut guard = self.inner.lock();
            guard.stats.total_requests += 1;
            if let Some(entry) = guard.entries.get(ip) {
                if !entry.is_expired(self.ttl, now) {
                    guard.stats.hits += 1;
                    return Ok(entry.record.clone());
                }
            }
            guard.stats.misses += 1;
        }

        let record = self.store.find_by_ip(ip).await?;
        let is_registered = record.as_ref().is_some_and(ConsoleRegistration::usable);
        let record = if is_registered { record } else { None };

        self.admit(ip, record.clone(), now);
        Ok(record)
    }

    /// Writes `record` to the store, then unconditionally invalidates the
    /// cached entry for its IP (spec.md §8: "every write...invalidated
    /// before the API returns").
    pub async fn add_registration(&self, record: ConsoleRegistration) -> Result<(), Error> {
        let ip = record.console_ip.clone();
        self.store.save(record).await?;
        self.invalidate(&ip);
        Ok(())
    }

    pub async fn remove_registration(&self, ip: &str) -> Result<(), Error> {
        self.store.delete(ip).await?;
        self.invalidate(ip);
        Ok(())
    }

    /// Idempotent: invalidating an IP with no cached entry is a no-op.
    pub fn invalidate(&self, ip: &str) {
        self.inner.lock().entries.remove(ip);
    }

    fn admit(&self, ip: &str, record: Option<ConsoleRegistration>, now: Instant) {
        let mut guard = self.inner.lock();
        self.sweep_expired(&mut guard, now);
        guard
            .entries
            .insert(ip.to_string(), CacheEntry { record, cached_at: now });
    }

    fn sweep_expired(&self, guard: &mut Inner, now: Instant) {
        let ttl = self.ttl;
        let before = guard.entries.len();
        guard.entries.retain(|_, entry| !entry.is_expired(ttl, now));
        let removed = before - guard.entries.len();
        guard.stats.expired_cleaned += removed as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::ConsoleTarget;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeStore {
        records: StdMutex<HashMap<String, ConsoleRegistration>>,
    }

    #[async_trait]
    impl CredentialStore for FakeStore {
        async fn load_all(&self) -> Result<Vec<ConsoleRegistration>, Error> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn save(&self, record: ConsoleRegistration) -> Result<(), Error> {
            self.records
                .lock()
                .unwrap()
                .insert(record.console_ip.clone(), record);
            Ok(())
        }

        async fn find_by_ip(&self, ip: &str) -> Result<Option<ConsoleRegistration>, Error> {
            Ok(self.records.lock().unwrap().get(ip).cloned())
        }

        async fn delete(&self, ip: &str) -> Result<(), Error> {
            self.records.lock().unwrap().remove(ip);
            Ok(())
        }

        async fn is_initialised(&self) -> bool {
            true
        }
    }

    fn record(ip: &str) -> ConsoleRegistration {
        ConsoleRegistration::new(
            ip,
            "Test Console",
            ConsoleTarget::Ps5V1,
            1,
            "8830739c",
            [1u8; 16],
            "nD1Ho0mY7wY=",
            true,
            true,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn miss_then_hit_on_second_lookup() {
        let store = Arc::new(FakeStore::default());
        store.save(record("192.168.1.5")).await.unwrap();
        let cache = RegistrationCache::new(store, Duration::from_secs(300));

        assert!(cache.is_registered("192.168.1.5").await.unwrap());
        assert!(cache.is_registered("192.168.1.5").await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn write_invalidates_before_returning() {
        let store = Arc::new(FakeStore::default());
        let cache = RegistrationCache::new(store, Duration::from_secs(300));

        assert!(!cache.is_registered("192.168.1.9").await.unwrap());
        cache.add_registration(record("192.168.1.9")).await.unwrap();
        assert!(cache.is_registered("192.168.1.9").await.unwrap());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let store = Arc::new(FakeStore::default());
        let cache = RegistrationCache::new(store, Duration::from_secs(300));
        cache.invalidate("10.0.0.1");
        cache.invalidate("10.0.0.1");
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned_as_a_hit() {
        let store = Arc::new(FakeStore::default());
        store.save(record("192.168.1.7")).await.unwrap();
        let cache = RegistrationCache::new(store, Duration::from_millis(1));

        assert!(cache.is_registered("192.168.1.7").await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.is_registered("192.168.1.7").await.unwrap());
        assert_eq!(cache.stats().misses, 2);
    }
}
