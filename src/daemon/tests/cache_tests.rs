use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::daemon::cache::{ResourceCache, ResourceKey};
use crate::daemon::error::DaemonError;

/// Counters shared between a test key and its assertions.
#[derive(Default)]
struct KeyProbe {
    allocations: AtomicUsize,
    closes: AtomicUsize,
    valid: AtomicBool,
}

impl KeyProbe {
    fn new() -> Arc<Self> {
        let probe = Arc::new(Self::default());
        probe.valid.store(true, Ordering::Release);
        probe
    }
}

#[derive(Clone)]
struct TestKey {
    id: u32,
    expiry: Duration,
    probe: Arc<KeyProbe>,
}

impl PartialEq for TestKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TestKey {}

impl std::hash::Hash for TestKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug)]
struct TestResource {
    serial: usize,
}

#[async_trait]
impl ResourceKey for TestKey {
    type Resource = TestResource;
    type Handle = Arc<TestResource>;

    async fn allocate(&self) -> Result<TestResource, DaemonError> {
        let serial = self.probe.allocations.fetch_add(1, Ordering::AcqRel);
        Ok(TestResource { serial })
    }

    fn generate(&self, resource: &Arc<TestResource>) -> Arc<TestResource> {
        Arc::clone(resource)
    }

    fn validate(&self, _resource: &TestResource) -> bool {
        self.probe.valid.load(Ordering::Acquire)
    }

    fn expiry(&self) -> Duration {
        self.expiry
    }

    async fn close(&self, _resource: Arc<TestResource>) {
        self.probe.closes.fetch_add(1, Ordering::AcqRel);
    }
}

fn key(id: u32, expiry: Duration, probe: &Arc<KeyProbe>) -> TestKey {
    TestKey {
        id,
        expiry,
        probe: Arc::clone(probe),
    }
}

#[tokio::test]
async fn test_lookups_share_one_resource() {
    let probe = KeyProbe::new();
    let cache = ResourceCache::new(Duration::from_secs(60));

    let first = cache
        .get(key(1, Duration::from_secs(60), &probe))
        .await
        .unwrap();
    let second = cache
        .get(key(1, Duration::from_secs(60), &probe))
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(probe.allocations.load(Ordering::Acquire), 1);
    assert_eq!(cache.len().await, 1);

    cache.close_all().await;
}

#[tokio::test]
async fn test_distinct_keys_get_distinct_resources() {
    let probe = KeyProbe::new();
    let cache = ResourceCache::new(Duration::from_secs(60));

    let first = cache
        .get(key(1, Duration::from_secs(60), &probe))
        .await
        .unwrap();
    let second = cache
        .get(key(2, Duration::from_secs(60), &probe))
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(probe.allocations.load(Ordering::Acquire), 2);

    cache.close_all().await;
}

#[tokio::test]
async fn test_failed_validation_closes_and_reallocates() {
    let probe = KeyProbe::new();
    let cache = ResourceCache::new(Duration::from_secs(60));

    let first = cache
        .get(key(1, Duration::from_secs(60), &probe))
        .await
        .unwrap();

    // invalidate the cached entry; the next lookup must discard it and
    // allocate a replacement
    probe.valid.store(false, Ordering::Release);
    let replacement = cache
        .get(key(1, Duration::from_secs(60), &probe))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &replacement));
    assert_ne!(first.serial, replacement.serial);
    assert_eq!(probe.closes.load(Ordering::Acquire), 1);
    assert_eq!(probe.allocations.load(Ordering::Acquire), 2);

    // once valid again, the replacement is served from the cache
    probe.valid.store(true, Ordering::Release);
    let second = cache
        .get(key(1, Duration::from_secs(60), &probe))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&replacement, &second));
    assert_eq!(probe.allocations.load(Ordering::Acquire), 2);

    cache.close_all().await;
}

#[tokio::test]
async fn test_idle_entry_expires_and_closes_exactly_once() {
    let probe = KeyProbe::new();
    let cache = ResourceCache::new(Duration::from_millis(20));

    let handle = cache
        .get(key(1, Duration::from_millis(50), &probe))
        .await
        .unwrap();
    drop(handle);

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(cache.len().await, 0);
    assert_eq!(probe.closes.load(Ordering::Acquire), 1);

    // a new lookup reallocates
    let _fresh = cache
        .get(key(1, Duration::from_millis(50), &probe))
        .await
        .unwrap();
    assert_eq!(probe.allocations.load(Ordering::Acquire), 2);

    cache.close_all().await;
}

#[tokio::test]
async fn test_access_refreshes_the_linger() {
    let probe = KeyProbe::new();
    let cache = ResourceCache::new(Duration::from_millis(20));

    let first = cache
        .get(key(1, Duration::from_millis(120), &probe))
        .await
        .unwrap();

    // keep touching the entry more often than the expiry
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = cache
            .get(key(1, Duration::from_millis(120), &probe))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
    assert_eq!(probe.allocations.load(Ordering::Acquire), 1);
    assert_eq!(probe.closes.load(Ordering::Acquire), 0);

    cache.close_all().await;
}

#[tokio::test]
async fn test_close_all_closes_entries_and_rejects_lookups() {
    let probe = KeyProbe::new();
    let cache = ResourceCache::new(Duration::from_secs(60));

    cache
        .get(key(1, Duration::from_secs(60), &probe))
        .await
        .unwrap();
    cache
        .get(key(2, Duration::from_secs(60), &probe))
        .await
        .unwrap();

    cache.close_all().await;
    assert_eq!(probe.closes.load(Ordering::Acquire), 2);

    let err = cache
        .get(key(3, Duration::from_secs(60), &probe))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Configuration(_)));
}
