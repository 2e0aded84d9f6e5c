//! Reference-cache behaviour under concurrency and partial failure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use engage_core::refdata::{CachePolicy, ReferenceCache, TableSource};
use engage_core::EngineError;

/// Counts fetches and yields at the transport boundary so concurrent
/// callers genuinely overlap.
struct SlowSource {
    fetches: AtomicU32,
    fail_from: Option<u32>,
}

impl SlowSource {
    fn reliable() -> Self {
        Self {
            fetches: AtomicU32::new(0),
            fail_from: None,
        }
    }

    fn failing_after(successes: u32) -> Self {
        Self {
            fetches: AtomicU32::new(0),
            fail_from: Some(successes + 1),
        }
    }

    fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableSource for SlowSource {
    async fn fetch_table(&self, dataset: &str) -> Result<String, String> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        if matches!(self.fail_from, Some(from) if n >= from) {
            return Err(format!("simulated outage #{n}"));
        }
        Ok(format!(
            "BCEID1,FirstName,LegalSurname1\nS1,Fetch{n},{dataset}\n"
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_loads_share_one_fetch() {
    let source = Arc::new(SlowSource::reliable());
    let cache = Arc::new(ReferenceCache::new(
        Arc::clone(&source) as Arc<dyn TableSource>,
        CachePolicy::default(),
    ));

    let (a, b, c) = tokio::join!(
        cache.load("students"),
        cache.load("students"),
        cache.load("students"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(source.fetch_count(), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert_eq!(a[0]["FirstName"], "Fetch1");
}

#[tokio::test(start_paused = true)]
async fn force_reload_coalesces_concurrent_callers() {
    let source = Arc::new(SlowSource::reliable());
    let cache = Arc::new(ReferenceCache::new(
        Arc::clone(&source) as Arc<dyn TableSource>,
        CachePolicy::default(),
    ));

    cache.load("students").await.unwrap();
    assert_eq!(source.fetch_count(), 1);

    // Both bypass freshness, but only one fetch goes out.
    let (a, b) = tokio::join!(
        cache.force_reload("students"),
        cache.force_reload("students"),
    );
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(source.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_reload_leaves_cached_rows_usable() {
    let source = Arc::new(SlowSource::failing_after(1));
    let cache = ReferenceCache::new(
        Arc::clone(&source) as Arc<dyn TableSource>,
        CachePolicy::default(),
    );

    let good = cache.load("students").await.unwrap();

    let err = cache.force_reload("students").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::DataUnavailable { attempts: 3, .. }
    ));
    // One fetch for the initial load, three for the exhausted reload.
    assert_eq!(source.fetch_count(), 4);

    let again = cache.load("students").await.unwrap();
    assert!(Arc::ptr_eq(&good, &again));
    assert_eq!(source.fetch_count(), 4);
}
