//! TTL cache with retry, backoff, and request coalescing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::TableSource;
use super::{parse_table, Row};
use crate::error::{EngineError, EngineResult};

/// Cached rows are shared out as immutable snapshots; a reload replaces the
/// whole Arc rather than mutating in place.
pub type Rows = Arc<Vec<Row>>;

type LoadOutcome = Result<Rows, String>;

/// Policy controlling cache freshness and retry behaviour.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// How long a loaded dataset stays fresh.
    pub ttl: Duration,
    /// Fetch attempts before a load fails (default: 3).
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub base_backoff: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }
}

struct CacheEntry {
    rows: Rows,
    loaded_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// One watch channel per dataset with a load in flight; concurrent
    /// callers subscribe instead of issuing duplicate fetches.
    in_flight: HashMap<String, watch::Receiver<Option<LoadOutcome>>>,
}

/// Caching, retrying loader for reference datasets.
///
/// Owned explicitly by the composing application (no global singleton);
/// callers only read, the cache is the sole writer of its map.
///
/// - cache hit within TTL → cached rows, no I/O
/// - miss → fetch with up to `max_attempts` tries and exponential backoff
/// - concurrent loads of the same dataset coalesce onto one fetch
/// - a force reload bypasses the freshness check but still coalesces
/// - a failed reload leaves any previous entry intact and usable
/// - the fetch runs in its own task, so a caller dropped mid-load
///   (timeout, teardown) neither cancels the shared load nor strands
///   its in-flight entry
pub struct ReferenceCache {
    source: Arc<dyn TableSource>,
    policy: CachePolicy,
    state: Arc<Mutex<CacheState>>,
}

impl ReferenceCache {
    pub fn new(source: Arc<dyn TableSource>, policy: CachePolicy) -> Self {
        Self {
            source,
            policy,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Load a dataset, serving from cache when fresh.
    pub async fn load(&self, dataset: &str) -> EngineResult<Rows> {
        self.load_inner(dataset, false).await
    }

    /// Load a dataset, bypassing the freshness check. Does not cancel a
    /// load already in flight for the same dataset; it joins it.
    pub async fn force_reload(&self, dataset: &str) -> EngineResult<Rows> {
        self.load_inner(dataset, true).await
    }

    /// Drop a cached dataset so the next `load` refetches.
    pub async fn invalidate(&self, dataset: &str) {
        self.state.lock().await.entries.remove(dataset);
    }

    /// Drop all cached datasets.
    pub async fn invalidate_all(&self) {
        self.state.lock().await.entries.clear();
    }

    /// Number of datasets currently cached.
    pub async fn entry_count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    async fn load_inner(&self, dataset: &str, force: bool) -> EngineResult<Rows> {
        let mut rx = {
            let mut state = self.state.lock().await;

            if !force {
                if let Some(entry) = state.entries.get(dataset) {
                    if entry.loaded_at.elapsed() < self.policy.ttl {
                        debug!(dataset, "reference cache hit");
                        return Ok(Arc::clone(&entry.rows));
                    }
                }
            }

            if let Some(rx) = state.in_flight.get(dataset) {
                debug!(dataset, "coalescing onto in-flight load");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                state.in_flight.insert(dataset.to_string(), rx.clone());
                self.spawn_load(dataset.to_string(), tx);
                rx
            }
        };

        let outcome = loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                break outcome;
            }
            if rx.changed().await.is_err() {
                // The loader task died without reporting (panic). Clear
                // the stale entry so the next call issues a fresh fetch.
                let mut state = self.state.lock().await;
                if matches!(state.in_flight.get(dataset), Some(stale) if stale.same_channel(&rx))
                {
                    state.in_flight.remove(dataset);
                }
                break Err("in-flight load abandoned".to_string());
            }
        };

        outcome.map_err(|reason| EngineError::DataUnavailable {
            dataset: dataset.to_string(),
            attempts: self.policy.max_attempts,
            reason,
        })
    }

    /// Run the fetch in its own task. A caller dropped mid-load (timeout,
    /// teardown) must not kill the shared load or strand the in-flight
    /// entry; the task always removes it and reports through the channel.
    fn spawn_load(&self, dataset: String, tx: watch::Sender<Option<LoadOutcome>>) {
        let source = Arc::clone(&self.source);
        let policy = self.policy.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let outcome = fetch_with_retry(source.as_ref(), &policy, &dataset).await;

            let mut state = state.lock().await;
            state.in_flight.remove(&dataset);
            if let Ok(rows) = &outcome {
                state.entries.insert(
                    dataset,
                    CacheEntry {
                        rows: Arc::clone(rows),
                        loaded_at: Instant::now(),
                    },
                );
            }
            drop(state);

            // Waiters may already be gone; that is fine.
            let _ = tx.send(Some(outcome));
        });
    }
}

async fn fetch_with_retry(
    source: &dyn TableSource,
    policy: &CachePolicy,
    dataset: &str,
) -> LoadOutcome {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match source.fetch_table(dataset).await {
            Ok(text) => {
                let rows = parse_table(&text);
                info!(dataset, rows = rows.len(), attempt, "reference table loaded");
                return Ok(Arc::new(rows));
            }
            Err(reason) => {
                if attempt >= policy.max_attempts {
                    warn!(dataset, attempt, "reference load exhausted retries: {reason}");
                    return Err(reason);
                }
                let delay = policy.base_backoff * 2u32.pow(attempt - 1);
                warn!(
                    dataset,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reference load failed, retrying: {reason}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Handle for a periodic-refresh task. Dropping the handle does not stop
/// the task; call [`RefreshHandle::dispose`] on teardown so no orphaned
/// timer keeps reloading after the consuming view is gone.
pub struct RefreshHandle {
    token: CancellationToken,
}

impl RefreshHandle {
    /// Cancel the refresh task.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    /// Whether the task has been cancelled.
    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Spawn a background task that force-reloads the given datasets on a
/// fixed interval until the returned handle is disposed.
pub fn spawn_refresh(
    cache: Arc<ReferenceCache>,
    datasets: Vec<String>,
    interval: Duration,
) -> RefreshHandle {
    let token = CancellationToken::new();
    let child = token.child_token();

    // Anchor the interval now rather than at the task's first poll so the
    // tick schedule starts when the caller spawns the refresh.
    let mut ticker = tokio::time::interval(interval);

    tokio::spawn(async move {
        // The first tick fires immediately; the initial load is the
        // caller's responsibility.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = child.cancelled() => {
                    debug!("reference refresh task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    for dataset in &datasets {
                        if let Err(err) = cache.force_reload(dataset).await {
                            warn!(dataset = %dataset, "periodic refresh failed: {err}");
                        }
                    }
                }
            }
        }
    });

    RefreshHandle { token }
}
