//! `AsyncProperty<T>` - non-blocking instrument parameter access.
//!
//! An asynchronous property couples a getter callback and a setter callback to
//! two independent single-flight lanes, so that a UI, a script, or a test can
//! issue reads and writes without ever blocking on the physical transport:
//!
//! - [`AsyncProperty::request_read`] starts (or coalesces into) a read cycle
//!   and returns immediately; the result lands in a cached value observable
//!   through a watch channel.
//! - [`AsyncProperty::write`] stores a pending value and starts (or coalesces
//!   into) a write cycle.
//! - Failures never propagate to the caller of either entry point; they are
//!   broadcast as lane outcomes instead.
//!
//! Within one property at most one read and at most one write are in flight
//! simultaneously, but a read and a write may overlap each other. Callers that
//! need read-after-write freshness opt into the `refresh_after_write` policy
//! or join the write lane explicitly before requesting a read.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_instrument::property::AsyncProperty;
//!
//! let wavelength = AsyncProperty::<f64>::new("wavelength_nm")
//!     .with_getter(move || {
//!         let session = session.clone();
//!         Box::pin(async move { query_wavelength(&session).await })
//!     })
//!     .with_setter(move |nm| {
//!         let session = session.clone();
//!         Box::pin(async move { command_wavelength(&session, nm).await })
//!     })
//!     .with_refresh_after_write();
//!
//! wavelength.write(780.24);          // returns immediately
//! wavelength.join_write().await;     // optional: await this write cycle
//! let last_known = wavelength.read() // cached, never blocks
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::error::{InstrResult, InstrumentError};
use crate::executor::{FlightOutcome, FlightWork, SingleFlightExecutor};

/// Execution lane identity within one property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Getter lane; its completion is the only writer of the cached value.
    Read,
    /// Setter lane; the only consumer of the pending-write value.
    Write,
}

/// Marker for types a property can carry.
pub trait PropertyValue: Clone + Default + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Default + fmt::Debug + Send + Sync + 'static> PropertyValue for T {}

/// Getter callback: fetches the device-native value.
pub type Getter<T> = Arc<dyn Fn() -> BoxFuture<'static, InstrResult<T>> + Send + Sync>;

/// Setter callback: pushes a value to the device.
pub type Setter<T> = Arc<dyn Fn(T) -> BoxFuture<'static, InstrResult<()>> + Send + Sync>;

// =============================================================================
// StringCodec - best-effort conversion for the untyped accessor
// =============================================================================

/// Pluggable string conversion pair used by the untyped property contract.
///
/// Decoding is best-effort by design: a malformed or incompatible string
/// yields the zero value instead of an error, so cross-type generic callers
/// (a UI binding a text field to an arbitrary property) can never crash on a
/// mismatched binding.
pub struct StringCodec<T> {
    encode: Arc<dyn Fn(&T) -> String + Send + Sync>,
    decode: Arc<dyn Fn(&str) -> T + Send + Sync>,
}

impl<T> Clone for StringCodec<T> {
    fn clone(&self) -> Self {
        Self {
            encode: Arc::clone(&self.encode),
            decode: Arc::clone(&self.decode),
        }
    }
}

impl<T> StringCodec<T> {
    /// Create a codec from an encode/decode pair.
    pub fn new(
        encode: impl Fn(&T) -> String + Send + Sync + 'static,
        decode: impl Fn(&str) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    /// Render a value as its string form.
    pub fn encode(&self, value: &T) -> String {
        (self.encode)(value)
    }

    /// Parse a string, yielding the zero value when it does not fit.
    pub fn decode(&self, raw: &str) -> T {
        (self.decode)(raw)
    }
}

impl<T: fmt::Display + FromStr + Default> StringCodec<T> {
    /// Codec based on the type's natural round-trip representation.
    pub fn display() -> Self {
        Self::new(
            |value: &T| value.to_string(),
            |raw: &str| raw.trim().parse().unwrap_or_default(),
        )
    }
}

impl<T: fmt::Display + FromStr + Default> Default for StringCodec<T> {
    fn default() -> Self {
        Self::display()
    }
}

// =============================================================================
// AsyncProperty<T>
// =============================================================================

/// Typed asynchronous property with single-flight read/write lanes.
pub struct AsyncProperty<T: PropertyValue> {
    name: String,
    getter: Option<Getter<T>>,
    setter: Option<Setter<T>>,

    /// Last value produced by a completed read cycle; `None` until then.
    value_tx: watch::Sender<Option<T>>,

    /// Value stored by `write()` and consumed by the write lane.
    pending: Arc<Mutex<Option<T>>>,

    lanes: SingleFlightExecutor<Lane>,
    refresh_after_write: bool,
    codec: StringCodec<T>,
}

fn pending_slot<T>(slot: &Mutex<Option<T>>) -> MutexGuard<'_, Option<T>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_work<T: PropertyValue>(getter: Getter<T>, value_tx: watch::Sender<Option<T>>) -> FlightWork {
    Box::pin(async move {
        let value = getter().await?;
        value_tx.send_replace(Some(value));
        Ok(())
    })
}

impl<T: PropertyValue + fmt::Display + FromStr> AsyncProperty<T> {
    /// Create a property with no delegates and the natural string codec.
    ///
    /// A property without delegates is inert: reads and writes are benign
    /// no-ops. Attach behavior with [`with_getter`](Self::with_getter) and
    /// [`with_setter`](Self::with_setter).
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_codec_only(name, StringCodec::display())
    }
}

impl<T: PropertyValue> AsyncProperty<T> {
    /// Create a property with an explicit codec (for types without a natural
    /// string round-trip).
    pub fn with_codec_only(name: impl Into<String>, codec: StringCodec<T>) -> Self {
        let (value_tx, _) = watch::channel(None);
        Self {
            name: name.into(),
            getter: None,
            setter: None,
            value_tx,
            pending: Arc::new(Mutex::new(None)),
            lanes: SingleFlightExecutor::new(),
            refresh_after_write: false,
            codec,
        }
    }

    /// Attach the getter callback.
    pub fn with_getter(
        mut self,
        getter: impl Fn() -> BoxFuture<'static, InstrResult<T>> + Send + Sync + 'static,
    ) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Attach the setter callback.
    pub fn with_setter(
        mut self,
        setter: impl Fn(T) -> BoxFuture<'static, InstrResult<()>> + Send + Sync + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Replace the string codec.
    pub fn with_codec(mut self, codec: StringCodec<T>) -> Self {
        self.codec = codec;
        self
    }

    /// Chain an automatic read after every successful write cycle.
    pub fn with_refresh_after_write(mut self) -> Self {
        self.refresh_after_write = true;
        self
    }

    /// Property name, unique within its device's property set.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a real getter was supplied.
    pub fn can_read(&self) -> bool {
        self.getter.is_some()
    }

    /// Whether a real setter was supplied.
    pub fn can_write(&self) -> bool {
        self.setter.is_some()
    }

    /// Start a read cycle unless one is already in flight.
    ///
    /// Returns immediately. Returns `false` without starting anything when a
    /// read is already running or when the property has no getter (a benign
    /// no-op on a write-only property, never an error).
    pub fn request_read(&self) -> bool {
        let Some(getter) = self.getter.clone() else {
            return false;
        };
        self.lanes
            .start(Lane::Read, read_work(getter, self.value_tx.clone()))
    }

    /// Last cached value; the zero value before any read cycle has completed.
    ///
    /// Never blocks and never touches the device.
    pub fn read(&self) -> T {
        self.value_tx.borrow().clone().unwrap_or_default()
    }

    /// Store `value` as the pending write and start a write cycle.
    ///
    /// Returns immediately. Returns `false` without starting anything when a
    /// write is already running or when the property has no setter. When a
    /// write is already running the pending value is still replaced, but no
    /// second cycle starts; the running cycle has already consumed its input.
    pub fn write(&self, value: T) -> bool {
        let Some(setter) = self.setter.clone() else {
            return false;
        };
        *pending_slot(&self.pending) = Some(value);

        let pending = Arc::clone(&self.pending);
        let refresh = self
            .refresh_after_write
            .then(|| (self.getter.clone(), self.lanes.clone(), self.value_tx.clone()));
        self.lanes.start(
            Lane::Write,
            Box::pin(async move {
                let Some(value) = pending_slot(&pending).take() else {
                    return Ok(());
                };
                setter(value).await?;
                if let Some((Some(getter), lanes, value_tx)) = refresh {
                    lanes.start(Lane::Read, read_work(getter, value_tx));
                }
                Ok(())
            }),
        )
    }

    /// Await the current read cycle, resolving immediately when idle.
    pub async fn join_read(&self) {
        self.lanes.join(Lane::Read).await;
    }

    /// Await the current write cycle, resolving immediately when idle.
    pub async fn join_write(&self) {
        self.lanes.join(Lane::Write).await;
    }

    /// Request a read and await that cycle's outcome.
    ///
    /// Resolves `Ok` immediately on a property without a getter. Used by the
    /// controller's initial-read step and by the auto-update sweep.
    pub fn update(&self) -> BoxFuture<'static, Result<(), Arc<InstrumentError>>> {
        if self.getter.is_none() {
            return Box::pin(async { Ok(()) });
        }
        let mut outcomes = self.lanes.subscribe();
        self.request_read();
        Box::pin(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) if outcome.key == Lane::Read => return outcome.result,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        })
    }

    /// Subscribe to cached-value changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.value_tx.subscribe()
    }

    /// Subscribe to lane completion outcomes (read and write failures land
    /// here instead of being thrown).
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<FlightOutcome<Lane>> {
        self.lanes.subscribe()
    }
}

impl<T: PropertyValue> Clone for AsyncProperty<T> {
    /// An independent property with the same delegates, name, codec, and
    /// policy flags, but fresh unshared lanes, cache, and pending slot.
    fn clone(&self) -> Self {
        let (value_tx, _) = watch::channel(None);
        Self {
            name: self.name.clone(),
            getter: self.getter.clone(),
            setter: self.setter.clone(),
            value_tx,
            pending: Arc::new(Mutex::new(None)),
            lanes: SingleFlightExecutor::new(),
            refresh_after_write: self.refresh_after_write,
            codec: self.codec.clone(),
        }
    }
}

// =============================================================================
// PropertyBase - untyped contract for heterogeneous collections
// =============================================================================

/// Object-safe, untyped view of a property.
///
/// This is the contract generic callers (device definitions, the auto-update
/// loop, presentation layers) use to drive properties of arbitrary value type.
/// Every operation here is non-throwing: getting a write-only property or
/// writing a read-only one is a benign no-op, and malformed string input
/// converts to the zero value.
pub trait PropertyBase: Send + Sync {
    /// Property name.
    fn name(&self) -> &str;

    /// Whether a real getter was supplied.
    fn can_read(&self) -> bool;

    /// Whether a real setter was supplied.
    fn can_write(&self) -> bool;

    /// Start a read cycle; see [`AsyncProperty::request_read`].
    fn request_read(&self) -> bool;

    /// Cached value rendered through the codec; the zero value's rendering
    /// before any read has completed.
    fn value_string(&self) -> String;

    /// Decode `raw` (best-effort; blank input means the zero value) and start
    /// a write cycle with it.
    fn write_string(&self, raw: &str) -> bool;

    /// Cached value as a JSON snapshot for presentation layers.
    fn value_json(&self) -> serde_json::Value;

    /// Request a read and await that cycle's outcome.
    fn update(&self) -> BoxFuture<'static, Result<(), Arc<InstrumentError>>>;

    /// Await the current read cycle.
    fn join_read(&self) -> BoxFuture<'_, ()>;

    /// Await the current write cycle.
    fn join_write(&self) -> BoxFuture<'_, ()>;

    /// Subscribe to lane completion outcomes.
    fn subscribe_outcomes(&self) -> broadcast::Receiver<FlightOutcome<Lane>>;
}

impl<T: PropertyValue + Serialize> PropertyBase for AsyncProperty<T> {
    fn name(&self) -> &str {
        AsyncProperty::name(self)
    }

    fn can_read(&self) -> bool {
        AsyncProperty::can_read(self)
    }

    fn can_write(&self) -> bool {
        AsyncProperty::can_write(self)
    }

    fn request_read(&self) -> bool {
        AsyncProperty::request_read(self)
    }

    fn value_string(&self) -> String {
        self.codec.encode(&self.read())
    }

    fn write_string(&self, raw: &str) -> bool {
        let value = if raw.trim().is_empty() {
            T::default()
        } else {
            self.codec.decode(raw)
        };
        self.write(value)
    }

    fn value_json(&self) -> serde_json::Value {
        serde_json::to_value(self.read()).unwrap_or(serde_json::Value::Null)
    }

    fn update(&self) -> BoxFuture<'static, Result<(), Arc<InstrumentError>>> {
        AsyncProperty::update(self)
    }

    fn join_read(&self) -> BoxFuture<'_, ()> {
        Box::pin(AsyncProperty::join_read(self))
    }

    fn join_write(&self) -> BoxFuture<'_, ()> {
        Box::pin(AsyncProperty::join_write(self))
    }

    fn subscribe_outcomes(&self) -> broadcast::Receiver<FlightOutcome<Lane>> {
        AsyncProperty::subscribe_outcomes(self)
    }
}

// =============================================================================
// Tests
// =============================================================================
