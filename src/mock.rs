//! Mock transport and a canned mock device.
//!
//! [`MockTransport`] is a scripted stand-in for real instrument I/O, used by
//! the test suite and by demos: exact and prefix-matched request→response
//! tables, per-exchange latency, open-failure injection, an exchange log, and
//! an overlap detector that records whether two exchanges ever ran
//! concurrently (they must not — the channel contract is one exchange at a
//! time, enforced here the same way a serial port sits behind a mutex).
//!
//! [`mock_device`] assembles a small SCPI-flavored power meter on top of a
//! mock transport: a read-only power property, a read/write wavelength
//! property with refresh-after-write, and a zeroing action that changes what
//! subsequent power reads report.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use crate::action::DeviceAction;
use crate::device::DeviceDefinition;
use crate::error::{InstrResult, InstrumentError};
use crate::property::AsyncProperty;
use crate::transport::{SessionHandle, SessionSlot, SharedSessionSlot, Transport};

enum MockReply {
    Ok(String),
    Err(String),
}

fn guarded<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted in-memory transport.
pub struct MockTransport {
    latency: Duration,
    replies: Mutex<HashMap<String, MockReply>>,
    prefixes: Mutex<Vec<(String, String)>>,
    sessions: Mutex<HashSet<Uuid>>,
    log: Mutex<Vec<String>>,
    fail_next_open: AtomicBool,
    channel: tokio::sync::Mutex<()>,
    busy: AtomicBool,
    overlapped: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a transport with no scripted exchanges and no latency.
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            replies: Mutex::new(HashMap::new()),
            prefixes: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
            fail_next_open: AtomicBool::new(false),
            channel: tokio::sync::Mutex::new(()),
            busy: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        }
    }

    /// Simulate wire latency on opens and exchanges.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Script an exact request → response exchange. Re-scripting a request
    /// replaces its reply, which is how device state changes are simulated.
    pub fn script(&self, request: impl Into<String>, reply: impl Into<String>) {
        guarded(&self.replies).insert(request.into(), MockReply::Ok(reply.into()));
    }

    /// Script an exact request to fail with a device error.
    pub fn script_error(&self, request: impl Into<String>, message: impl Into<String>) {
        guarded(&self.replies).insert(request.into(), MockReply::Err(message.into()));
    }

    /// Script every request starting with `prefix` (checked after exact
    /// matches) to succeed with `reply`.
    pub fn script_prefix(&self, prefix: impl Into<String>, reply: impl Into<String>) {
        guarded(&self.prefixes).push((prefix.into(), reply.into()));
    }

    /// Make the next `open_session` fail.
    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// Every request sent so far, in wire order.
    pub fn exchange_log(&self) -> Vec<String> {
        guarded(&self.log).clone()
    }

    /// Number of currently open sessions.
    pub fn open_session_count(&self) -> usize {
        guarded(&self.sessions).len()
    }

    /// Whether two exchanges ever overlapped on the channel.
    pub fn overlap_detected(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn lookup(&self, request: &str) -> InstrResult<String> {
        if let Some(reply) = guarded(&self.replies).get(request) {
            return match reply {
                MockReply::Ok(text) => Ok(text.clone()),
                MockReply::Err(message) => Err(InstrumentError::Device(message.clone())),
            };
        }
        if let Some((_, reply)) = guarded(&self.prefixes)
            .iter()
            .find(|(prefix, _)| request.starts_with(prefix.as_str()))
        {
            return Ok(reply.clone());
        }
        Err(anyhow::anyhow!("unscripted request: {request}").into())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_session(&self, resource: &str, timeout: Duration) -> InstrResult<SessionHandle> {
        if self.latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(InstrumentError::Timeout(timeout));
        }
        tokio::time::sleep(self.latency).await;
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(InstrumentError::Transport(format!(
                "failed to open '{resource}'"
            )));
        }
        let handle = SessionHandle::new(resource);
        guarded(&self.sessions).insert(handle.id());
        debug!("mock session {} opened on '{resource}'", handle.id());
        Ok(handle)
    }

    async fn close_session(&self, session: SessionHandle) -> InstrResult<()> {
        if !guarded(&self.sessions).remove(&session.id()) {
            return Err(InstrumentError::SessionNotOpen);
        }
        debug!("mock session {} closed", session.id());
        Ok(())
    }

    async fn send(&self, session: &SessionHandle, request: &str) -> InstrResult<String> {
        if !guarded(&self.sessions).contains(&session.id()) {
            return Err(InstrumentError::SessionNotOpen);
        }
        let _channel = self.channel.lock().await;
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.latency).await;
        guarded(&self.log).push(request.to_string());
        let reply = self.lookup(request);
        self.busy.store(false, Ordering::SeqCst);
        reply
    }
}

fn parse_f64(reply: &str) -> InstrResult<f64> {
    reply
        .trim()
        .parse()
        .map_err(|_| InstrumentError::Device(format!("unparseable response: {reply}")))
}

/// Assemble a mock power meter on `transport`.
///
/// Scripts the exchanges the device uses, then wires up:
/// - `power_mw` — read-only, `READ:POW?`
/// - `wavelength_nm` — read/write with refresh-after-write, `CONF:WAVE`
/// - `zero` action — `CAL:ZERO`, after which power reads report `0`
/// - lifecycle: `SYST:REM` on initialize, `SYST:LOC` on deinitialize,
///   `*IDN?` for identification
pub fn mock_device(transport: Arc<MockTransport>) -> DeviceDefinition {
    transport.script("SYST:REM", "OK");
    transport.script("SYST:LOC", "OK");
    transport.script("*IDN?", "ACME Photonics,PM-101,0042,1.2.0");
    transport.script("READ:POW?", "1.25");
    transport.script("CONF:WAVE?", "780");
    transport.script_prefix("CONF:WAVE ", "OK");
    transport.script("CAL:ZERO", "OK");

    let slot: SharedSessionSlot = Arc::new(SessionSlot::new());

    let power = {
        let transport = Arc::clone(&transport);
        let slot = Arc::clone(&slot);
        AsyncProperty::<f64>::new("power_mw").with_getter(move || {
            let transport = Arc::clone(&transport);
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                let session = slot.get()?;
                let reply = transport.send(&session, "READ:POW?").await?;
                parse_f64(&reply)
            })
        })
    };

    let wavelength = {
        let read_transport = Arc::clone(&transport);
        let read_slot = Arc::clone(&slot);
        let write_transport = Arc::clone(&transport);
        let write_slot = Arc::clone(&slot);
        AsyncProperty::<f64>::new("wavelength_nm")
            .with_getter(move || {
                let transport = Arc::clone(&read_transport);
                let slot = Arc::clone(&read_slot);
                Box::pin(async move {
                    let session = slot.get()?;
                    let reply = transport.send(&session, "CONF:WAVE?").await?;
                    parse_f64(&reply)
                })
            })
            .with_setter(move |nm: f64| {
                let transport = Arc::clone(&write_transport);
                let slot = Arc::clone(&write_slot);
                Box::pin(async move {
                    let session = slot.get()?;
                    let reply = transport.send(&session, &format!("CONF:WAVE {nm}")).await?;
                    if reply != "OK" {
                        return Err(InstrumentError::Device(format!("write rejected: {reply}")));
                    }
                    // The instrument now reports the new wavelength.
                    transport.script("CONF:WAVE?", format!("{nm}"));
                    Ok(())
                })
            })
            .with_refresh_after_write()
    };

    let zero = {
        let transport = Arc::clone(&transport);
        let slot = Arc::clone(&slot);
        DeviceAction::new("zero", move || {
            let transport = Arc::clone(&transport);
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                let session = slot.get()?;
                let reply = transport.send(&session, "CAL:ZERO").await?;
                if reply != "OK" {
                    return Err(InstrumentError::Device(format!("zero rejected: {reply}")));
                }
                transport.script("READ:POW?", "0.00");
                Ok(())
            })
        })
    };

    let init_transport = Arc::clone(&transport);
    let init_slot = Arc::clone(&slot);
    let deinit_transport = Arc::clone(&transport);
    let deinit_slot = Arc::clone(&slot);
    let idn_transport = Arc::clone(&transport);
    let idn_slot = Arc::clone(&slot);

    DeviceDefinition::builder("pm101", "MOCK::PM101::INSTR")
        .property(power)
        .property(wavelength)
        .action(zero)
        .on_initialize(move |session| {
            let transport = Arc::clone(&init_transport);
            let slot = Arc::clone(&init_slot);
            Box::pin(async move {
                slot.set(session.clone());
                transport.send(&session, "SYST:REM").await?;
                Ok(())
            })
        })
        .on_deinitialize(move || {
            let transport = Arc::clone(&deinit_transport);
            let slot = Arc::clone(&deinit_slot);
            Box::pin(async move {
                let session = slot.get()?;
                let result = transport.send(&session, "SYST:LOC").await;
                slot.clear();
                result.map(|_| ())
            })
        })
        .on_identify(move || {
            let transport = Arc::clone(&idn_transport);
            let slot = Arc::clone(&idn_slot);
            Box::pin(async move {
                let session = slot.get()?;
                transport.send(&session, "*IDN?").await
            })
        })
        .build()
}
