//! Single-flight execution primitive.
//!
//! Every asynchronous entry point in this library (property reads and writes,
//! device actions, the controller's connect/disconnect sequences) funnels
//! through a [`SingleFlightExecutor`]: a per-key flight table that guarantees
//! at most one in-flight unit of work per logical key. A second start request
//! observed while a flight is running is accepted but starts nothing — an
//! explicit idempotence guarantee, not an error.
//!
//! Completion is observed two ways, both non-throwing:
//!
//! - **Joining**: [`SingleFlightExecutor::join`] resolves once the tracked
//!   flight (if any) finishes. The handle is a `watch` channel, so any number
//!   of callers can await the same cycle.
//! - **Outcomes**: every finished flight broadcasts a [`FlightOutcome`]
//!   carrying the key and the `Result` of the work. Failures ride inside the
//!   outcome as `Arc<InstrumentError>` instead of propagating to whoever
//!   happened to call `start`.
//!
//! Outcomes are delivered on whatever task the work completed on; callers that
//! need thread affinity marshal themselves.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::debug;
use tokio::sync::{broadcast, watch};

use crate::error::{InstrResult, InstrumentError};

/// Buffered outcomes per executor before slow subscribers start lagging.
const OUTCOME_CHANNEL_CAPACITY: usize = 64;

/// Marker for types usable as flight keys.
///
/// Blanket-implemented; a key only needs cheap copy semantics and hashing.
pub trait FlightKey: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<K: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static> FlightKey for K {}

/// A unit of work executed by a flight.
pub type FlightWork = BoxFuture<'static, InstrResult<()>>;

/// Completion record for one finished flight.
///
/// Broadcast after the key has been removed from the flight table, so a
/// subscriber reacting to an outcome can immediately start a fresh flight
/// for the same key.
#[derive(Clone, Debug)]
pub struct FlightOutcome<K> {
    /// Key the finished flight was tracked under.
    pub key: K,
    /// Result of the work. Failures are shared so every subscriber sees them.
    pub result: Result<(), Arc<InstrumentError>>,
    /// UTC timestamp taken when the work finished.
    pub finished_at: DateTime<Utc>,
}

impl<K> FlightOutcome<K> {
    /// Returns the error carried by a failed flight, if any.
    pub fn error(&self) -> Option<&Arc<InstrumentError>> {
        self.result.as_ref().err()
    }
}

struct Inner<K: FlightKey> {
    flights: Mutex<HashMap<K, watch::Receiver<bool>>>,
    outcomes: broadcast::Sender<FlightOutcome<K>>,
}

impl<K: FlightKey> Inner<K> {
    // A poisoned table only means a worker panicked mid-update; the map
    // itself is still consistent, so recover the guard and keep going.
    fn table(&self) -> MutexGuard<'_, HashMap<K, watch::Receiver<bool>>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keyed single-flight executor.
///
/// Cheap to clone: clones share the same flight table, so a clone handed to a
/// spawned task observes and coalesces with the original's flights.
pub struct SingleFlightExecutor<K: FlightKey> {
    inner: Arc<Inner<K>>,
}

impl<K: FlightKey> Clone for SingleFlightExecutor<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: FlightKey> Default for SingleFlightExecutor<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: FlightKey> SingleFlightExecutor<K> {
    /// Create an executor with an empty flight table.
    pub fn new() -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                flights: Mutex::new(HashMap::new()),
                outcomes,
            }),
        }
    }

    /// Subscribe to completion outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<FlightOutcome<K>> {
        self.inner.outcomes.subscribe()
    }

    /// Start `work` under `key` unless a flight is already running for it.
    ///
    /// Returns `true` if a fresh flight actually began. Returns `false` — and
    /// drops `work` unexecuted — when a flight for `key` is in progress.
    pub fn start(&self, key: K, work: FlightWork) -> bool {
        let done_tx = {
            let mut flights = self.inner.table();
            if flights.contains_key(&key) {
                debug!("flight {key:?} already running, coalescing request");
                return false;
            }
            let (done_tx, done_rx) = watch::channel(false);
            flights.insert(key, done_rx);
            done_tx
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = work.await.map_err(Arc::new);
            inner.table().remove(&key);
            if let Err(err) = &result {
                debug!("flight {key:?} failed: {err}");
            }
            let _ = inner.outcomes.send(FlightOutcome {
                key,
                result,
                finished_at: Utc::now(),
            });
            // Joiners are woken last, after the table slot is free again.
            let _ = done_tx.send(true);
        });
        true
    }

    /// Whether a call to [`start`](Self::start) would begin a fresh flight.
    pub fn can_start(&self, key: K) -> bool {
        !self.inner.table().contains_key(&key)
    }

    /// Whether no flights are currently tracked.
    pub fn is_idle(&self) -> bool {
        self.inner.table().is_empty()
    }

    /// Wait for the flight tracked under `key`, resolving immediately if idle.
    pub async fn join(&self, key: K) {
        let handle = self.inner.table().get(&key).cloned();
        if let Some(mut done) = handle {
            // An Err here means the flight task is gone; either way it is over.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Join every currently tracked flight, swallowing individual failures.
    ///
    /// Used for graceful shutdown: failures still surface through the outcome
    /// channel, they just never block the teardown path.
    pub async fn wait_for_all(&self) {
        let handles: Vec<_> = self.inner.table().values().cloned().collect();
        for mut done in handles {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counting_work(counter: &Arc<AtomicU32>, delay_ms: u64) -> FlightWork {
        let counter = Arc::clone(counter);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_concurrent_starts_run_once() {
        let executor = SingleFlightExecutor::new();
        let counter = Arc::new(AtomicU32::new(0));

        assert!(executor.start("read", counting_work(&counter, 50)));
        for _ in 0..9 {
            assert!(!executor.start("read", counting_work(&counter, 50)));
        }

        executor.join("read").await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lane_resets_after_completion() {
        let executor = SingleFlightExecutor::new();
        let counter = Arc::new(AtomicU32::new(0));

        assert!(executor.start("read", counting_work(&counter, 1)));
        executor.join("read").await;
        assert!(executor.can_start("read"));

        assert!(executor.start("read", counting_work(&counter, 1)));
        executor.join("read").await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_reported_as_outcome() {
        let executor: SingleFlightExecutor<&str> = SingleFlightExecutor::new();
        let mut outcomes = executor.subscribe();

        executor.start(
            "reset",
            Box::pin(async { Err(InstrumentError::Device("stuck shutter".into())) }),
        );
        executor.join("reset").await;

        let outcome = outcomes.recv().await.expect("outcome delivered");
        assert_eq!(outcome.key, "reset");
        assert!(outcome.error().is_some());
        // The lane is free for a retry after the failure.
        assert!(executor.can_start("reset"));
    }

    #[tokio::test]
    async fn test_join_idle_key_resolves_immediately() {
        let executor: SingleFlightExecutor<u64> = SingleFlightExecutor::new();
        executor.join(7).await;
        assert!(executor.is_idle());
    }

    #[tokio::test]
    async fn test_wait_for_all_swallows_failures() {
        let executor = SingleFlightExecutor::new();
        let counter = Arc::new(AtomicU32::new(0));

        executor.start(1u32, counting_work(&counter, 20));
        executor.start(
            2u32,
            Box::pin(async { Err(InstrumentError::Device("bad response".into())) }),
        );
        executor.wait_for_all().await;

        assert!(executor.is_idle());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
