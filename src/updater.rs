//! Periodic background refresh of property getters.
//!
//! The [`AutoUpdater`] owns a cancellable loop that sweeps a snapshot of
//! properties: each sweep issues `request_read` on every property in
//! declaration order (without waiting for one read to finish before starting
//! the next), awaits the sweep's read cycles, reports their failures, runs any
//! registered cycle hooks, emits a cycle event, then sleeps the configured
//! delay. Failures — whether from a read lane or from a hook — never stop the
//! loop; only [`stop`](AutoUpdater::stop) or
//! [`request_stop`](AutoUpdater::request_stop) terminates it.
//!
//! Cancellation is cooperative: in-flight device calls run to completion, only
//! the next sweep is suppressed. `stop()` is idempotent and resolves only once
//! the loop task has actually exited, so dependent resources (the transport
//! session, typically) can be torn down immediately afterwards. From inside a
//! cycle hook use the signal-only `request_stop()`; it cannot deadlock against
//! the loop that invoked the hook.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{broadcast, watch};

use crate::error::{InstrResult, InstrumentError};
use crate::property::PropertyBase;

/// Buffered updater events before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Per-sweep notifications emitted by the loop.
#[derive(Clone, Debug)]
pub enum UpdaterEvent {
    /// A full sweep over the property snapshot finished.
    CycleCompleted,
    /// A read lane or a cycle hook failed during the sweep.
    ///
    /// `property` names the failing property, or is `None` for hook failures.
    CycleFailed {
        /// Name of the property whose read failed, if any.
        property: Option<String>,
        /// The failure, shared across subscribers.
        error: Arc<InstrumentError>,
    },
}

/// Callback invoked after every sweep; an `Err` becomes a
/// [`UpdaterEvent::CycleFailed`] and never stops the loop.
pub type CycleHook = Arc<dyn Fn() -> InstrResult<()> + Send + Sync>;

#[derive(Default)]
struct LoopState {
    cancel: Option<watch::Sender<bool>>,
    done: Option<watch::Receiver<bool>>,
}

/// Cancellable periodic read loop over a property-set snapshot.
pub struct AutoUpdater {
    properties: Vec<Arc<dyn PropertyBase>>,
    delay: Duration,
    state: Arc<Mutex<LoopState>>,
    hooks: Arc<Mutex<Vec<CycleHook>>>,
    events: broadcast::Sender<UpdaterEvent>,
}

impl AutoUpdater {
    /// Create an updater over a snapshot of properties.
    ///
    /// The snapshot is fixed: properties are swept in the given order for the
    /// lifetime of this updater.
    pub fn new(properties: Vec<Arc<dyn PropertyBase>>, delay: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            properties,
            delay,
            state: Arc::new(Mutex::new(LoopState::default())),
            hooks: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    /// Delay between sweeps.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Register a cycle hook, invoked after every sweep.
    pub fn on_cycle(&self, hook: impl Fn() -> InstrResult<()> + Send + Sync + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Subscribe to cycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<UpdaterEvent> {
        self.events.subscribe()
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel
            .is_some()
    }

    /// Start the loop.
    ///
    /// No-op (returns `false`) when already running, or when the property
    /// snapshot is empty — an empty sweep would busy-spin to no effect.
    pub fn start(&self) -> bool {
        if self.properties.is_empty() {
            debug!("auto-update start skipped: no properties to refresh");
            return false;
        }
        let (cancel_rx, done_tx) = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.cancel.is_some() {
                return false;
            }
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let (done_tx, done_rx) = watch::channel(false);
            state.cancel = Some(cancel_tx);
            state.done = Some(done_rx);
            (cancel_rx, done_tx)
        };

        info!(
            "auto-update loop started: {} properties, {:?} delay",
            self.properties.len(),
            self.delay
        );
        let properties = self.properties.clone();
        let hooks = Arc::clone(&self.hooks);
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        let delay = self.delay;
        tokio::spawn(async move {
            run_loop(properties, hooks, events, delay, cancel_rx).await;
            {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.cancel = None;
                state.done = None;
            }
            let _ = done_tx.send(true);
            info!("auto-update loop exited");
        });
        true
    }

    /// Signal cancellation without waiting for the loop to exit.
    ///
    /// Safe to call from inside a cycle hook.
    pub fn request_stop(&self) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = &state.cancel {
            let _ = cancel.send(true);
        }
    }

    /// Signal cancellation and wait until the loop has actually exited.
    ///
    /// Idempotent; resolves immediately when the loop is not running.
    pub async fn stop(&self) {
        let done = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cancel) = &state.cancel {
                let _ = cancel.send(true);
            }
            state.done.clone()
        };
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

async fn run_loop(
    properties: Vec<Arc<dyn PropertyBase>>,
    hooks: Arc<Mutex<Vec<CycleHook>>>,
    events: broadcast::Sender<UpdaterEvent>,
    delay: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        // Issue every read first so the sweep never serializes on one
        // property; each `update` future then resolves with its own outcome.
        let updates: Vec<_> = properties.iter().map(|prop| prop.update()).collect();
        for (prop, update) in properties.iter().zip(updates) {
            if let Err(error) = update.await {
                let _ = events.send(UpdaterEvent::CycleFailed {
                    property: Some(prop.name().to_string()),
                    error,
                });
            }
        }

        let snapshot: Vec<CycleHook> = hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for hook in snapshot {
            if let Err(error) = hook() {
                let _ = events.send(UpdaterEvent::CycleFailed {
                    property: None,
                    error: Arc::new(error),
                });
            }
        }

        let _ = events.send(UpdaterEvent::CycleCompleted);

        if *cancel.borrow() {
            break;
        }
        tokio::select! {
            _ = cancel.wait_for(|cancelled| *cancelled) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::AsyncProperty;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn counter_property(name: &str, reads: &Arc<AtomicU32>) -> Arc<dyn PropertyBase> {
        let reads = Arc::clone(reads);
        Arc::new(AsyncProperty::<u64>::new(name).with_getter(move || {
            let reads = Arc::clone(&reads);
            Box::pin(async move { Ok(reads.fetch_add(1, Ordering::SeqCst) as u64) })
        }))
    }

    async fn nth_cycle(events: &mut broadcast::Receiver<UpdaterEvent>, n: usize) {
        let mut seen = 0;
        while seen < n {
            if let Ok(UpdaterEvent::CycleCompleted) = events.recv().await {
                seen += 1;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_sweeps_repeatedly() {
        let reads = Arc::new(AtomicU32::new(0));
        let updater = AutoUpdater::new(
            vec![
                counter_property("power", &reads),
                counter_property("wavelength", &reads),
            ],
            Duration::from_millis(50),
        );
        let mut events = updater.subscribe();

        assert!(updater.start());
        assert!(!updater.start());
        nth_cycle(&mut events, 3).await;

        // Three completed sweeps over two properties.
        assert!(reads.load(Ordering::SeqCst) >= 6);
        updater.stop().await;
        assert!(!updater.is_running());
    }

    #[tokio::test]
    async fn test_empty_snapshot_stays_stopped() {
        let updater = AutoUpdater::new(Vec::new(), Duration::from_millis(10));
        assert!(!updater.start());
        assert!(!updater.is_running());
        // stop() on a never-started loop resolves immediately.
        updater.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_does_not_stop_loop() {
        let fail = Arc::new(AtomicBool::new(true));
        let toggle = Arc::clone(&fail);
        let prop: Arc<dyn PropertyBase> =
            Arc::new(AsyncProperty::<u64>::new("status").with_getter(move || {
                let toggle = Arc::clone(&toggle);
                Box::pin(async move {
                    if toggle.swap(false, Ordering::SeqCst) {
                        Err(InstrumentError::Device("bus collision".into()))
                    } else {
                        Ok(1)
                    }
                })
            }));

        let updater = AutoUpdater::new(vec![prop], Duration::from_millis(20));
        let mut events = updater.subscribe();
        updater.start();

        let mut saw_failure = false;
        let mut cycles = 0;
        while cycles < 3 {
            match events.recv().await {
                Ok(UpdaterEvent::CycleFailed { property, .. }) => {
                    assert_eq!(property.as_deref(), Some("status"));
                    saw_failure = true;
                }
                Ok(UpdaterEvent::CycleCompleted) => cycles += 1,
                Err(_) => break,
            }
        }
        assert!(saw_failure);
        updater.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_failure_does_not_stop_loop() {
        let reads = Arc::new(AtomicU32::new(0));
        let updater = AutoUpdater::new(
            vec![counter_property("power", &reads)],
            Duration::from_millis(20),
        );
        updater.on_cycle(|| Err(InstrumentError::Device("handler bug".into())));
        let mut events = updater.subscribe();
        updater.start();

        let mut failures = 0;
        let mut cycles = 0;
        while cycles < 2 {
            match events.recv().await {
                Ok(UpdaterEvent::CycleFailed { property: None, .. }) => failures += 1,
                Ok(UpdaterEvent::CycleCompleted) => cycles += 1,
                _ => {}
            }
        }
        assert!(failures >= 2);
        updater.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_stop_from_hook_is_deadlock_free() {
        let reads = Arc::new(AtomicU32::new(0));
        let updater = Arc::new(AutoUpdater::new(
            vec![counter_property("power", &reads)],
            Duration::from_millis(20),
        ));
        let handle = Arc::clone(&updater);
        updater.on_cycle(move || {
            handle.request_stop();
            Ok(())
        });

        updater.start();
        // The hook's signal alone must exit the loop; nothing else cancels it.
        while updater.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // The loop stopped after exactly one sweep.
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        // stop() after self-termination resolves immediately.
        updater.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_restart() {
        let reads = Arc::new(AtomicU32::new(0));
        let updater = AutoUpdater::new(
            vec![counter_property("power", &reads)],
            Duration::from_millis(20),
        );
        let mut events = updater.subscribe();

        assert!(updater.start());
        nth_cycle(&mut events, 1).await;
        updater.stop().await;

        let after_stop = reads.load(Ordering::SeqCst);
        assert!(updater.start());
        nth_cycle(&mut events, 1).await;
        assert!(reads.load(Ordering::SeqCst) > after_stop);
        updater.stop().await;
    }
}
