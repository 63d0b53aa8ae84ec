//! Time-bounded keyed resource cache.
//!
//! Expensive handles (remote daemon connections, project caches) are memoized
//! here so repeated lookups within the linger window reuse the same
//! underlying resource. Entries follow an allocate → generate → validate →
//! expire → close lifecycle driven by the key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::daemon::error::DaemonError;

/// Interval at which idle entries are swept. A constructor parameter so tests
/// can shrink it together with short-expiry keys.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A cache key describing the full lifecycle of the resource it maps to.
#[async_trait]
pub trait ResourceKey: Clone + Eq + Hash + Send + Sync + 'static {
    /// The shared underlying resource.
    type Resource: Send + Sync + 'static;
    /// The handle handed out to callers.
    type Handle: Send + 'static;

    /// Creates the underlying resource.
    async fn allocate(&self) -> Result<Self::Resource, DaemonError>;

    /// Wraps the shared resource into a caller handle.
    fn generate(&self, resource: &Arc<Self::Resource>) -> Self::Handle;

    /// Consulted on every lookup; returning false discards the entry.
    fn validate(&self, resource: &Self::Resource) -> bool;

    /// Idle linger before the entry is closed.
    fn expiry(&self) -> Duration;

    /// Runs on eviction, exactly once per allocated resource.
    async fn close(&self, resource: Arc<Self::Resource>);
}

struct CacheEntry<R> {
    resource: Arc<R>,
    last_access: Instant,
}

/// Keyed cache with idle expiry.
pub struct ResourceCache<K: ResourceKey> {
    entries: Mutex<HashMap<K, CacheEntry<K::Resource>>>,
    closed: AtomicBool,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<K: ResourceKey> ResourceCache<K> {
    /// Creates a cache and spawns its background sweeper.
    pub fn new(sweep_interval: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            sweeper: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&cache);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                if cache.closed.load(Ordering::Acquire) {
                    break;
                }
                cache.sweep().await;
            }
        });
        *cache.sweeper.lock().unwrap() = Some(handle);

        cache
    }

    /// Looks up or allocates the resource for `key` and returns a fresh
    /// handle over it.
    pub async fn get(&self, key: K) -> Result<K::Handle, DaemonError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DaemonError::configuration("Resource cache is closed"));
        }

        let stale = {
            let mut entries = self.entries.lock().await;
            let cached = match entries.get_mut(&key) {
                Some(entry) if key.validate(&entry.resource) => {
                    entry.last_access = Instant::now();
                    Some(key.generate(&entry.resource))
                }
                _ => None,
            };
            if let Some(handle) = cached {
                return Ok(handle);
            }
            entries.remove(&key).map(|entry| entry.resource)
        };
        if let Some(resource) = stale {
            key.close(resource).await;
        }

        // Allocation happens outside the map lock; a concurrent allocation
        // for the same key wins and the loser is closed again.
        let resource = Arc::new(key.allocate().await?);

        let mut entries = self.entries.lock().await;
        let raced = match entries.get_mut(&key) {
            Some(existing) if key.validate(&existing.resource) => {
                existing.last_access = Instant::now();
                Some(key.generate(&existing.resource))
            }
            _ => None,
        };
        if let Some(handle) = raced {
            drop(entries);
            key.close(resource).await;
            return Ok(handle);
        }
        if let Some(entry) = entries.remove(&key) {
            let stale = entry.resource;
            let close_key = key.clone();
            tokio::spawn(async move { close_key.close(stale).await });
        }
        let handle = key.generate(&resource);
        entries.insert(
            key,
            CacheEntry {
                resource,
                last_access: Instant::now(),
            },
        );
        Ok(handle)
    }

    /// Closes entries idle past their expiry.
    async fn sweep(&self) {
        let mut expired = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            entries.retain(|key, entry| {
                if now.duration_since(entry.last_access) >= key.expiry() {
                    expired.push((key.clone(), Arc::clone(&entry.resource)));
                    false
                } else {
                    true
                }
            });
        }
        for (key, resource) in expired {
            key.close(resource).await;
        }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Drains and closes every entry; the cache rejects lookups afterwards.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        let drained: Vec<(K, Arc<K::Resource>)> = {
            let mut entries = self.entries.lock().await;
            entries
                .drain()
                .map(|(key, entry)| (key, entry.resource))
                .collect()
        };
        for (key, resource) in drained {
            key.close(resource).await;
        }
    }
}
