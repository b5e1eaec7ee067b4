//! Device controller: the connection state machine.
//!
//! A [`DeviceController`] sequences session opening, device initialization,
//! identification, the initial property refresh, the auto-update lifecycle,
//! and session closing — and aggregates every failure raised by the
//! components underneath it onto one [`ControllerEvent`] stream, so a single
//! subscriber can observe all of them.
//!
//! ```text
//!            connect()                      disconnect()
//! Disconnected ──────▶ Initializing ──▶ Connected ──────▶ DeInitializing ──▶ Disconnected
//!      ▲                    │                                                     │
//!      │                    ▼ (any failure)                                       │
//!      └──────── DisconnectedWithError ◀──────────────────────────────────────────┘
//! ```
//!
//! `connect()` and `disconnect()` return immediately; the sequences run on
//! single-flight lanes and their failures are reported, never thrown.
//! `disconnect()` called while `Initializing` interrupts the connect sequence
//! between steps rather than waiting it out; in-flight transport calls always
//! run to completion first (cooperative cancellation).

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::action::ActionTracker;
use crate::config::ControllerSettings;
use crate::device::DeviceDefinition;
use crate::error::{InstrResult, InstrumentError};
use crate::executor::SingleFlightExecutor;
use crate::property::{Lane, PropertyBase};
use crate::transport::{SessionHandle, Transport};
use crate::updater::{AutoUpdater, UpdaterEvent};

/// Buffered controller events before slow subscribers start lagging.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Connection lifecycle of one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session; a connect attempt may start.
    Disconnected,
    /// Connect sequence in progress.
    Initializing,
    /// Session open, device initialized, properties readable.
    Connected,
    /// Disconnect sequence in progress.
    DeInitializing,
    /// The last connect attempt failed; a new attempt may start.
    DisconnectedWithError,
}

impl ConnectionState {
    /// Whether a connect attempt may start from this state.
    pub fn can_connect(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::DisconnectedWithError
        )
    }
}

/// Unified notification stream re-publishing every component-level failure
/// plus connection-state changes.
#[derive(Clone, Debug)]
pub enum ControllerEvent {
    /// The connection state moved.
    StateChanged(ConnectionState),
    /// A property's read or write lane failed.
    PropertyFailed {
        /// Property name.
        property: String,
        /// Which lane failed.
        lane: Lane,
        /// The failure.
        error: Arc<InstrumentError>,
    },
    /// A named device action failed.
    ActionFailed {
        /// Action name.
        action: String,
        /// The failure.
        error: Arc<InstrumentError>,
    },
    /// A delegate run through the action tracker failed.
    TrackedActionFailed {
        /// The failure.
        error: Arc<InstrumentError>,
    },
    /// The auto-update loop reported a failed read or cycle hook.
    CycleFailed {
        /// Failing property, or `None` for a hook failure.
        property: Option<String>,
        /// The failure.
        error: Arc<InstrumentError>,
    },
    /// A connect attempt failed; the state is now `DisconnectedWithError`.
    ConnectionFailed {
        /// The failure.
        error: Arc<InstrumentError>,
    },
    /// A deinitialize/close step failed while disconnecting. Disconnection
    /// proceeded regardless.
    DisconnectionFailed {
        /// The swallowed failure.
        error: Arc<InstrumentError>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SequenceLane {
    Connect,
    Disconnect,
}

struct ControllerInner {
    device: Arc<DeviceDefinition>,
    transport: Arc<dyn Transport>,
    settings: ControllerSettings,
    tracker: ActionTracker,
    updater: Arc<AutoUpdater>,
    state_tx: watch::Sender<ConnectionState>,
    identifier_tx: watch::Sender<Option<String>>,
    session: Mutex<Option<SessionHandle>>,
    sequences: SingleFlightExecutor<SequenceLane>,
    cancel_connect: Mutex<Option<watch::Sender<bool>>>,
    events: broadcast::Sender<ControllerEvent>,
}

impl ControllerInner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!(
                "device '{}' connection state: {previous:?} -> {next:?}",
                self.device.name()
            );
            let _ = self.events.send(ControllerEvent::StateChanged(next));
        }
    }

    fn store_session(&self, session: SessionHandle) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    fn take_session(&self) -> Option<SessionHandle> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn signal_connect_cancel(&self) {
        let cancel = self
            .cancel_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = &*cancel {
            let _ = cancel.send(true);
        }
    }

    fn report_disconnect_failure(&self, error: InstrumentError) {
        warn!(
            "device '{}' disconnect step failed (ignored): {error}",
            self.device.name()
        );
        let _ = self.events.send(ControllerEvent::DisconnectionFailed {
            error: Arc::new(error),
        });
    }
}

/// Orchestrates one device's connection lifecycle.
///
/// Cheap to clone; clones share the same state machine.
#[derive(Clone)]
pub struct DeviceController {
    inner: Arc<ControllerInner>,
}

impl DeviceController {
    /// Create a controller for `device` over `transport`.
    ///
    /// The action tracker is injected so callers control its scope: one per
    /// controller for isolation, or one shared handle across controllers.
    pub fn new(
        device: DeviceDefinition,
        transport: Arc<dyn Transport>,
        settings: ControllerSettings,
        tracker: ActionTracker,
    ) -> Self {
        let device = Arc::new(device);
        let updater = Arc::new(AutoUpdater::new(
            device.properties().to_vec(),
            settings.auto_update_interval,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (identifier_tx, _) = watch::channel(None);

        spawn_forwarders(&device, &updater, &tracker, &events);

        Self {
            inner: Arc::new(ControllerInner {
                device,
                transport,
                settings,
                tracker,
                updater,
                state_tx,
                identifier_tx,
                session: Mutex::new(None),
                sequences: SingleFlightExecutor::new(),
                cancel_connect: Mutex::new(None),
                events,
            }),
        }
    }

    /// The device this controller drives.
    pub fn device(&self) -> &DeviceDefinition {
        &self.inner.device
    }

    /// The injected action tracker.
    pub fn tracker(&self) -> &ActionTracker {
        &self.inner.tracker
    }

    /// The background updater (subscribe to its cycle events, register
    /// hooks). Its lifecycle is owned by the controller.
    pub fn updater(&self) -> &AutoUpdater {
        &self.inner.updater
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch connection-state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Identification string read during the last successful connect.
    pub fn identifier(&self) -> Option<String> {
        self.inner.identifier_tx.borrow().clone()
    }

    /// Watch identifier changes.
    pub fn watch_identifier(&self) -> watch::Receiver<Option<String>> {
        self.inner.identifier_tx.subscribe()
    }

    /// Subscribe to the unified event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    /// Start the connect sequence.
    ///
    /// Returns immediately; `false` when ignored because the state does not
    /// allow connecting (already connecting or connected) or a sequence is
    /// already in flight. Failure is reported via
    /// [`ControllerEvent::ConnectionFailed`], never thrown.
    pub fn connect(&self) -> bool {
        let previous = self.inner.state();
        if !previous.can_connect() {
            debug!(
                "connect ignored for '{}' in state {previous:?}",
                self.inner.device.name()
            );
            return false;
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Enter Initializing before the sequence task exists, so a disconnect
        // issued right after this call observes the attempt and interrupts it.
        self.inner.set_state(ConnectionState::Initializing);
        *self
            .inner
            .cancel_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cancel_tx);
        let inner = Arc::clone(&self.inner);
        let started = self.inner.sequences.start(
            SequenceLane::Connect,
            Box::pin(async move { run_connect(inner, cancel_rx).await }),
        );
        if !started {
            // A previous sequence is still unwinding; give the state back.
            self.inner.set_state(previous);
        }
        started
    }

    /// Start the disconnect sequence.
    ///
    /// Returns immediately; idempotent in every state. Called while
    /// `Initializing`, it interrupts the connect sequence rather than waiting
    /// for it to finish. De-initialize and session-close failures are
    /// swallowed (reported via [`ControllerEvent::DisconnectionFailed`]) so a
    /// broken device can never get stuck un-disconnectable.
    pub fn disconnect(&self) -> bool {
        if matches!(
            self.inner.state(),
            ConnectionState::Disconnected | ConnectionState::DisconnectedWithError
        ) {
            return false;
        }
        self.inner.signal_connect_cancel();
        let inner = Arc::clone(&self.inner);
        self.inner.sequences.start(
            SequenceLane::Disconnect,
            Box::pin(async move { run_disconnect(inner).await }),
        )
    }

    /// Await the in-flight connect sequence, resolving immediately when idle.
    pub async fn join_connect(&self) {
        self.inner.sequences.join(SequenceLane::Connect).await;
    }

    /// Await the in-flight disconnect sequence, resolving immediately when
    /// idle.
    pub async fn join_disconnect(&self) {
        self.inner.sequences.join(SequenceLane::Disconnect).await;
    }

    /// Disconnect and wait for every sequence to settle (disposal path).
    pub async fn shutdown(&self) {
        self.disconnect();
        self.inner.sequences.wait_for_all().await;
    }
}

/// Re-publish component failures onto the controller's unified stream.
fn spawn_forwarders(
    device: &Arc<DeviceDefinition>,
    updater: &Arc<AutoUpdater>,
    tracker: &ActionTracker,
    events: &broadcast::Sender<ControllerEvent>,
) {
    for prop in device.properties() {
        let mut outcomes = prop.subscribe_outcomes();
        let events = events.clone();
        let property = prop.name().to_string();
        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        if let Err(error) = outcome.result {
                            let _ = events.send(ControllerEvent::PropertyFailed {
                                property: property.clone(),
                                lane: outcome.key,
                                error,
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    for action in device.actions() {
        let mut outcomes = action.subscribe_outcomes();
        let events = events.clone();
        let name = action.name().to_string();
        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        if let Err(error) = outcome.result {
                            let _ = events.send(ControllerEvent::ActionFailed {
                                action: name.clone(),
                                error,
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    {
        let mut outcomes = tracker.subscribe_outcomes();
        let events = events.clone();
        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        if let Err(error) = outcome.result {
                            let _ = events.send(ControllerEvent::TrackedActionFailed { error });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    {
        let mut cycles = updater.subscribe();
        let events = events.clone();
        tokio::spawn(async move {
            loop {
                match cycles.recv().await {
                    Ok(UpdaterEvent::CycleFailed { property, error }) => {
                        let _ = events.send(ControllerEvent::CycleFailed { property, error });
                    }
                    Ok(UpdaterEvent::CycleCompleted) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Resolve when the cancel signal fires; pend forever if it never can.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Race one connect step against cancellation.
async fn step<T>(
    cancel: &mut watch::Receiver<bool>,
    work: impl std::future::Future<Output = InstrResult<T>>,
) -> InstrResult<T> {
    tokio::select! {
        _ = cancelled(cancel) => Err(InstrumentError::ConnectionAborted),
        result = work => result,
    }
}

async fn connect_sequence(
    inner: &ControllerInner,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), Arc<InstrumentError>> {
    let resource = inner.device.resource().to_string();
    let timeout = inner.settings.connect_timeout;

    let session = step(cancel, inner.transport.open_session(&resource, timeout))
        .await
        .map_err(Arc::new)?;
    inner.store_session(session.clone());

    if let Some(initialize) = inner.device.initialize() {
        step(cancel, initialize(session.clone()))
            .await
            .map_err(Arc::new)?;
    }

    if let Some(identify) = inner.device.identify() {
        let identifier = step(cancel, identify()).await.map_err(Arc::new)?;
        info!(
            "device '{}' identified as '{identifier}'",
            inner.device.name()
        );
        inner.identifier_tx.send_replace(Some(identifier));
    }

    // One full read of every declared property; a failure here is a
    // connection failure, not a property event.
    for prop in inner.device.properties() {
        step_update(cancel, prop).await?;
    }

    Ok(())
}

async fn step_update(
    cancel: &mut watch::Receiver<bool>,
    prop: &Arc<dyn PropertyBase>,
) -> Result<(), Arc<InstrumentError>> {
    let update = prop.update();
    tokio::select! {
        _ = cancelled(cancel) => Err(Arc::new(InstrumentError::ConnectionAborted)),
        result = update => result,
    }
}

async fn run_connect(
    inner: Arc<ControllerInner>,
    mut cancel: watch::Receiver<bool>,
) -> InstrResult<()> {
    match connect_sequence(&inner, &mut cancel).await {
        Ok(()) => {
            inner.set_state(ConnectionState::Connected);
            if inner.settings.auto_update_enabled {
                inner.updater.start();
            }
        }
        Err(error) if matches!(&*error, InstrumentError::ConnectionAborted) => {
            // An explicit disconnect interrupted us; the disconnect sequence
            // owns the remaining state and session cleanup.
            debug!("connect to '{}' interrupted", inner.device.name());
        }
        Err(error) => {
            if let Some(session) = inner.take_session() {
                if let Err(close_error) = inner.transport.close_session(session).await {
                    inner.report_disconnect_failure(close_error);
                }
            }
            inner.identifier_tx.send_replace(None);
            inner.set_state(ConnectionState::DisconnectedWithError);
            warn!(
                "device '{}' failed to connect: {error}",
                inner.device.name()
            );
            let _ = inner
                .events
                .send(ControllerEvent::ConnectionFailed { error });
        }
    }
    Ok(())
}

async fn run_disconnect(inner: Arc<ControllerInner>) -> InstrResult<()> {
    // Let an interrupted connect sequence unwind before touching shared state.
    inner.sequences.join(SequenceLane::Connect).await;

    if matches!(
        inner.state(),
        ConnectionState::Disconnected | ConnectionState::DisconnectedWithError
    ) {
        // The connect attempt already failed on its own; nothing to undo.
        return Ok(());
    }

    inner.set_state(ConnectionState::DeInitializing);

    // Stop issuing new work, then let in-flight device calls drain so the
    // session never closes underneath them.
    inner.updater.stop().await;
    inner.tracker.wait_for_all().await;
    inner.device.wait_for_idle().await;

    if let Some(session) = inner.take_session() {
        if let Some(deinitialize) = inner.device.deinitialize() {
            if let Err(error) = deinitialize().await {
                inner.report_disconnect_failure(error);
            }
        }
        if let Err(error) = inner.transport.close_session(session).await {
            inner.report_disconnect_failure(error);
        }
    }

    inner.identifier_tx.send_replace(None);
    inner.set_state(ConnectionState::Disconnected);
    Ok(())
}
