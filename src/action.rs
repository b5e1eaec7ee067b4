//! Device actions and the scoped action tracker.
//!
//! A [`DeviceAction`] applies the single-flight discipline to a zero-argument
//! operation (reset, zero, self-test, …): repeated concurrent invocations
//! before completion are accepted and coalesced into the one in-flight run,
//! and failures surface as outcomes rather than propagating to the caller.
//!
//! The [`ActionTracker`] provides the same dedup semantics keyed by delegate
//! identity, for call paths that do not hold a dedicated `DeviceAction`
//! instance (generic UI commands binding straight to a callback). It is an
//! explicitly-scoped registry — construct one per controller, or share one
//! handle across controllers — never process-global state, so tests run in
//! isolation.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::InstrResult;
use crate::executor::{FlightOutcome, SingleFlightExecutor};

/// The single execution lane of an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActionLane;

/// Zero-argument operation callback.
pub type ActionDelegate = Arc<dyn Fn() -> BoxFuture<'static, InstrResult<()>> + Send + Sync>;

/// Identity of an action delegate, derived from its `Arc` pointer.
///
/// Two clones of the same `Arc` produce the same key; two separately
/// constructed delegates never collide while either is alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ActionKey(usize);

impl ActionKey {
    /// Key for a delegate handle.
    pub fn of(delegate: &ActionDelegate) -> Self {
        Self(Arc::as_ptr(delegate) as *const () as usize)
    }
}

// =============================================================================
// DeviceAction
// =============================================================================

/// Named zero-argument device operation with its own single-flight lane.
pub struct DeviceAction {
    name: String,
    delegate: ActionDelegate,
    lane: SingleFlightExecutor<ActionLane>,
}

impl DeviceAction {
    /// Create an action from a callback.
    pub fn new(
        name: impl Into<String>,
        delegate: impl Fn() -> BoxFuture<'static, InstrResult<()>> + Send + Sync + 'static,
    ) -> Self {
        Self::from_delegate(name, Arc::new(delegate))
    }

    /// Create an action from an existing delegate handle.
    pub fn from_delegate(name: impl Into<String>, delegate: ActionDelegate) -> Self {
        Self {
            name: name.into(),
            delegate,
            lane: SingleFlightExecutor::new(),
        }
    }

    /// Action name, unique within its device's action set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying delegate handle (the identity used by trackers).
    pub fn delegate(&self) -> &ActionDelegate {
        &self.delegate
    }

    /// Start the operation unless it is already running.
    ///
    /// Returns immediately; `false` means the call coalesced into the
    /// in-flight run. Completion and failure are observed via
    /// [`subscribe_outcomes`](Self::subscribe_outcomes) or [`join`](Self::join).
    pub fn execute(&self) -> bool {
        let delegate = Arc::clone(&self.delegate);
        self.lane
            .start(ActionLane, Box::pin(async move { delegate().await }))
    }

    /// Whether the operation is currently in flight.
    pub fn is_running(&self) -> bool {
        !self.lane.can_start(ActionLane)
    }

    /// Await the current run, resolving immediately when idle.
    pub async fn join(&self) {
        self.lane.join(ActionLane).await;
    }

    /// Subscribe to completion outcomes.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<FlightOutcome<ActionLane>> {
        self.lane.subscribe()
    }
}

impl Clone for DeviceAction {
    /// An independent action with the same name and delegate but a fresh,
    /// unshared lane.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            delegate: Arc::clone(&self.delegate),
            lane: SingleFlightExecutor::new(),
        }
    }
}

// =============================================================================
// ActionTracker
// =============================================================================

/// Scoped single-flight registry keyed by delegate identity.
///
/// Cheap to clone; clones share one flight table. The two global queries,
/// [`none_running`](Self::none_running) and
/// [`wait_for_all`](Self::wait_for_all), support orderly shutdown before a
/// session closes.
#[derive(Clone, Default)]
pub struct ActionTracker {
    flights: SingleFlightExecutor<ActionKey>,
}

impl ActionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            flights: SingleFlightExecutor::new(),
        }
    }

    /// Run `delegate` unless a run for the same delegate identity is already
    /// tracked here. Returns immediately.
    pub fn execute(&self, delegate: &ActionDelegate) -> bool {
        let key = ActionKey::of(delegate);
        let work = Arc::clone(delegate);
        self.flights
            .start(key, Box::pin(async move { work().await }))
    }

    /// Run a named action's delegate through this tracker.
    ///
    /// Dedup happens on delegate identity and is independent of the action's
    /// own private lane.
    pub fn execute_action(&self, action: &DeviceAction) -> bool {
        self.execute(action.delegate())
    }

    /// Await the run tracked for `delegate`, resolving immediately when idle.
    pub async fn join(&self, delegate: &ActionDelegate) {
        self.flights.join(ActionKey::of(delegate)).await;
    }

    /// Whether no tracked action is currently running.
    pub fn none_running(&self) -> bool {
        self.flights.is_idle()
    }

    /// Join every tracked run, swallowing individual failures.
    pub async fn wait_for_all(&self) {
        self.flights.wait_for_all().await;
    }

    /// Subscribe to completion outcomes.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<FlightOutcome<ActionKey>> {
        self.flights.subscribe()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstrumentError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counting_delegate(counter: &Arc<AtomicU32>, delay_ms: u64) -> ActionDelegate {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_concurrent_executes_coalesce() {
        let runs = Arc::new(AtomicU32::new(0));
        let action = DeviceAction::from_delegate("zero", counting_delegate(&runs, 30));

        assert!(action.execute());
        assert!(action.is_running());
        for _ in 0..4 {
            assert!(!action.execute());
        }
        action.join().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!action.is_running());
    }

    #[tokio::test]
    async fn test_failure_fires_outcome_and_resets_lane() {
        let action = DeviceAction::new("self_test", || {
            Box::pin(async { Err(InstrumentError::Device("self test failed".into())) })
        });
        let mut outcomes = action.subscribe_outcomes();

        action.execute();
        action.join().await;

        let outcome = outcomes.recv().await.expect("outcome delivered");
        assert!(outcome.error().is_some());
        assert!(action.execute());
        action.join().await;
    }

    #[tokio::test]
    async fn test_tracker_dedups_by_delegate_identity() {
        let runs = Arc::new(AtomicU32::new(0));
        let delegate = counting_delegate(&runs, 30);
        let tracker = ActionTracker::new();

        // Two call sites holding clones of the same delegate handle.
        let first = Arc::clone(&delegate);
        let second = Arc::clone(&delegate);
        assert!(tracker.execute(&first));
        assert!(!tracker.execute(&second));
        assert!(!tracker.none_running());

        tracker.wait_for_all().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(tracker.none_running());
    }

    #[tokio::test]
    async fn test_tracker_distinguishes_delegates() {
        let runs = Arc::new(AtomicU32::new(0));
        let tracker = ActionTracker::new();
        let a = counting_delegate(&runs, 10);
        let b = counting_delegate(&runs, 10);

        assert!(tracker.execute(&a));
        assert!(tracker.execute(&b));
        tracker.wait_for_all().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clone_gets_fresh_lane() {
        let runs = Arc::new(AtomicU32::new(0));
        let action = DeviceAction::from_delegate("home", counting_delegate(&runs, 20));
        let copy = action.clone();

        assert!(action.execute());
        // Independent lane: the clone runs concurrently with the original.
        assert!(copy.execute());
        action.join().await;
        copy.join().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
