//! Process-wide DNS cache
//!
//! All connection pools share one bounded cache of resolved addresses.
//! Entries are reference counted: a pool holds a reference for the
//! duration of a connect attempt and releases it afterwards, and entries
//! with live references are never evicted. Expired entries with live
//! references are flagged and reaped on the final release.
//!
//! The table is guarded by a read/write lock; the hot path (a hit) takes
//! only the read lock, with per-entry counters kept in atomics. Actual
//! resolution happens outside any lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::error::{McpgateError, Result};

/// Fixed number of cache slots.
const DNS_CACHE_CAPACITY: usize = 64;

/// Default time-to-live for a resolved entry.
const DNS_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct DnsEntry {
    key: String,
    addrs: Vec<SocketAddr>,
    created_at: Instant,
    ref_count: AtomicU32,
    hit_count: AtomicU64,
    /// Set when the entry outlived its TTL while references were live;
    /// reaped on the final release.
    expired: AtomicBool,
}

/// Bounded cache of resolved socket addresses with TTL, reference
/// counting, and least-frequently-used eviction.
///
/// Use [`DnsCache::global`] in production code; constructing a private
/// instance is supported for tests.
///
/// # Examples
///
/// ```no_run
/// use mcpgate::dns::DnsCache;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let addrs = DnsCache::global().resolve("localhost", 8080).await?;
/// // ... connect to one of `addrs` ...
/// DnsCache::global().release("localhost", 8080);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DnsCache {
    entries: RwLock<Vec<Option<DnsEntry>>>,
    ttl: Duration,
}

static GLOBAL_DNS_CACHE: OnceLock<DnsCache> = OnceLock::new();

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCache {
    /// Create a cache with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DNS_CACHE_TTL)
    }

    /// Create a cache with a custom TTL (used by tests).
    pub fn with_ttl(ttl: Duration) -> Self {
        let mut entries = Vec::with_capacity(DNS_CACHE_CAPACITY);
        entries.resize_with(DNS_CACHE_CAPACITY, || None);
        Self {
            entries: RwLock::new(entries),
            ttl,
        }
    }

    /// The shared process-wide cache, constructed on first use.
    pub fn global() -> &'static DnsCache {
        GLOBAL_DNS_CACHE.get_or_init(DnsCache::new)
    }

    /// Resolve `host:port`, consulting the cache first.
    ///
    /// A hit within the TTL increments the entry's reference and hit
    /// counts and returns the cached addresses. A miss resolves via the
    /// system resolver (outside any lock) and inserts the result, choosing
    /// the first empty slot, else the least-frequently-used unreferenced
    /// slot, else the oldest such slot. When every slot is referenced the
    /// result is returned uncached.
    ///
    /// Every successful `resolve` must be paired with one
    /// [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns [`McpgateError::Transport`] when resolution fails or yields
    /// no addresses.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let key = cache_key(host, port);

        if let Some(addrs) = self.lookup_hit(&key) {
            return Ok(addrs);
        }

        // Miss: resolve with no lock held.
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| McpgateError::Transport(format!("DNS lookup for {key} failed: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(
                McpgateError::Transport(format!("DNS lookup for {key} returned no addresses"))
                    .into(),
            );
        }

        self.insert(key, addrs.clone());
        Ok(addrs)
    }

    /// Release one reference taken by [`resolve`](Self::resolve).
    ///
    /// An entry that expired while referenced is removed once its last
    /// reference is gone.
    pub fn release(&self, host: &str, port: u16) {
        let key = cache_key(host, port);
        let needs_reap = {
            let entries = self.read_entries();
            let mut reap = false;
            for entry in entries.iter().flatten() {
                if entry.key == key {
                    let previous = entry.ref_count.fetch_sub(1, Ordering::SeqCst);
                    debug_assert!(previous > 0, "release without matching resolve");
                    let dead = previous <= 1;
                    let stale =
                        entry.expired.load(Ordering::SeqCst) || entry.created_at.elapsed() > self.ttl;
                    reap = dead && stale;
                    break;
                }
            }
            reap
        };

        if needs_reap {
            let mut entries = self.write_entries();
            for slot in entries.iter_mut() {
                let remove = matches!(
                    slot,
                    Some(e) if e.key == key && e.ref_count.load(Ordering::SeqCst) == 0
                );
                if remove {
                    *slot = None;
                    break;
                }
            }
        }
    }

    /// Drop every entry. Intended for tests that share the global cache.
    pub fn clear(&self) {
        let mut entries = self.write_entries();
        for slot in entries.iter_mut() {
            *slot = None;
        }
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.read_entries().iter().flatten().count()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count for `host:port`, if cached.
    pub fn ref_count(&self, host: &str, port: u16) -> Option<u32> {
        let key = cache_key(host, port);
        self.read_entries()
            .iter()
            .flatten()
            .find(|e| e.key == key)
            .map(|e| e.ref_count.load(Ordering::SeqCst))
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, Vec<Option<DnsEntry>>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, Vec<Option<DnsEntry>>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Read-locked scan. A live hit bumps counters; an expired entry with
    /// references is flagged for reaping on release.
    fn lookup_hit(&self, key: &str) -> Option<Vec<SocketAddr>> {
        let entries = self.read_entries();
        for entry in entries.iter().flatten() {
            if entry.key != key {
                continue;
            }
            if entry.expired.load(Ordering::SeqCst) {
                return None;
            }
            if entry.created_at.elapsed() > self.ttl {
                if entry.ref_count.load(Ordering::SeqCst) > 0 {
                    // Referenced: flag and reap on final release.
                    entry.expired.store(true, Ordering::SeqCst);
                    return None;
                }
                return None;
            }
            entry.ref_count.fetch_add(1, Ordering::SeqCst);
            entry.hit_count.fetch_add(1, Ordering::SeqCst);
            return Some(entry.addrs.clone());
        }
        None
    }

    /// Write-locked insert with the eviction policy from the module docs.
    fn insert(&self, key: String, addrs: Vec<SocketAddr>) {
        let mut entries = self.write_entries();

        // The same key may have been inserted by a racing resolver, or an
        // expired copy may still occupy a slot; replace it in place. Live
        // references to the old copy are carried over so their releases
        // stay balanced against the refreshed entry.
        for slot in entries.iter_mut() {
            let carried = match slot {
                Some(e) if e.key == key => e.ref_count.load(Ordering::SeqCst),
                _ => continue,
            };
            let entry = new_entry(key, addrs);
            entry.ref_count.store(carried + 1, Ordering::SeqCst);
            *slot = Some(entry);
            return;
        }

        // First empty slot.
        if let Some(slot) = entries.iter_mut().find(|s| s.is_none()) {
            *slot = Some(new_entry(key, addrs));
            return;
        }

        // Reclaim expired unreferenced slots eagerly.
        for slot in entries.iter_mut() {
            let stale = matches!(
                slot,
                Some(e) if e.ref_count.load(Ordering::SeqCst) == 0
                    && e.created_at.elapsed() > self.ttl
            );
            if stale {
                *slot = Some(new_entry(key, addrs));
                return;
            }
        }

        // Evict: least hits among unreferenced entries, oldest breaking ties.
        let mut victim: Option<usize> = None;
        let mut victim_hits = u64::MAX;
        let mut victim_age = Instant::now();
        for (index, slot) in entries.iter().enumerate() {
            if let Some(e) = slot {
                if e.ref_count.load(Ordering::SeqCst) != 0 {
                    continue;
                }
                let hits = e.hit_count.load(Ordering::SeqCst);
                if hits < victim_hits || (hits == victim_hits && e.created_at < victim_age) {
                    victim = Some(index);
                    victim_hits = hits;
                    victim_age = e.created_at;
                }
            }
        }
        if let Some(index) = victim {
            entries[index] = Some(new_entry(key, addrs));
        } else {
            tracing::debug!(key, "dns cache full with live references; result uncached");
        }
    }
}

fn cache_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

fn new_entry(key: String, addrs: Vec<SocketAddr>) -> DnsEntry {
    DnsEntry {
        key,
        addrs,
        created_at: Instant::now(),
        ref_count: AtomicU32::new(1),
        hit_count: AtomicU64::new(0),
        expired: AtomicBool::new(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_miss_then_hit_increments_hit_count() {
        let cache = DnsCache::new();
        let first = cache.resolve("127.0.0.1", 8080).await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(cache.len(), 1);

        let second = cache.resolve("127.0.0.1", 8080).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.ref_count("127.0.0.1", 8080), Some(2));

        cache.release("127.0.0.1", 8080);
        cache.release("127.0.0.1", 8080);
    }

    #[tokio::test]
    async fn test_release_restores_ref_count() {
        let cache = DnsCache::new();
        cache.resolve("127.0.0.1", 9000).await.unwrap();
        let before = cache.ref_count("127.0.0.1", 9000).unwrap();
        cache.resolve("127.0.0.1", 9000).await.unwrap();
        cache.release("127.0.0.1", 9000);
        assert_eq!(cache.ref_count("127.0.0.1", 9000), Some(before));
        cache.release("127.0.0.1", 9000);
    }

    #[tokio::test]
    async fn test_expired_unreferenced_entry_replaced_on_next_lookup() {
        let cache = DnsCache::with_ttl(Duration::from_millis(10));
        cache.resolve("127.0.0.1", 9001).await.unwrap();
        cache.release("127.0.0.1", 9001);

        tokio::time::sleep(Duration::from_millis(30)).await;

        // The stale entry is not served; re-resolution repopulates it.
        cache.resolve("127.0.0.1", 9001).await.unwrap();
        assert_eq!(cache.ref_count("127.0.0.1", 9001), Some(1));
        cache.release("127.0.0.1", 9001);
    }

    #[tokio::test]
    async fn test_expired_referenced_entry_reaped_on_release() {
        let cache = DnsCache::with_ttl(Duration::from_millis(10));
        cache.resolve("127.0.0.1", 9002).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        // A lookup past the TTL flags the referenced entry instead of
        // serving it; resolve() re-resolves and replaces the slot.
        cache.resolve("127.0.0.1", 9002).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.release("127.0.0.1", 9002);
        cache.release("127.0.0.1", 9002);
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let cache = DnsCache::new();
        cache.resolve("127.0.0.1", 9003).await.unwrap();
        cache.release("127.0.0.1", 9003);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_transport_error() {
        let cache = DnsCache::new();
        let err = cache
            .resolve("name.invalid.mcpgate-test.", 80)
            .await
            .unwrap_err();
        let typed = crate::error::as_mcpgate_error(&err).unwrap();
        assert!(matches!(typed, McpgateError::Transport(_)));
    }

    #[test]
    fn test_global_is_singleton() {
        let a = DnsCache::global() as *const DnsCache;
        let b = DnsCache::global() as *const DnsCache;
        assert_eq!(a, b);
    }

    /// Serialized: other tests resolve through the shared global cache.
    #[tokio::test]
    #[serial_test::serial]
    async fn test_global_cache_clear_supports_tests() {
        let cache = DnsCache::global();
        cache.clear();
        cache.resolve("127.0.0.1", 9999).await.unwrap();
        assert!(!cache.is_empty());
        cache.release("127.0.0.1", 9999);
        cache.clear();
        assert!(cache.is_empty());
    }
}
