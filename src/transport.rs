//! Transport seam for the physical communication channel.
//!
//! The actual instrument I/O (message framing, serial/VISA/socket plumbing,
//! vendor quirks) lives outside this library. The execution core consumes it
//! through the narrow [`Transport`] trait: open a session, exchange one
//! request/response pair, close the session.
//!
//! A transport implementation owns the single exclusive physical channel and
//! **must serialize overlapping [`send`](Transport::send) calls on the same
//! handle** (typically behind an internal async mutex, the way a serial port
//! sits behind one). Many property and action lanes may be "running"
//! concurrently from the caller's perspective; the transport is where they
//! queue so the wire sees one exchange at a time.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{InstrResult, InstrumentError};

/// Opaque handle to one open communication session.
///
/// Cloneable and cheap; a transport matches handles to its internal session
/// objects by id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    id: Uuid,
    resource: String,
}

impl SessionHandle {
    /// Mint a fresh handle for `resource`. Called by transport
    /// implementations from `open_session`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.into(),
        }
    }

    /// Unique id of this session.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resource identifier the session was opened against.
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// The physical transport collaborator, consumed by the execution core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a communication channel to `resource`, enforcing `timeout` on the
    /// attempt and on subsequent exchanges.
    async fn open_session(&self, resource: &str, timeout: Duration) -> InstrResult<SessionHandle>;

    /// Close a previously opened session.
    async fn close_session(&self, session: SessionHandle) -> InstrResult<()>;

    /// Perform one request/response exchange on an open session.
    async fn send(&self, session: &SessionHandle, request: &str) -> InstrResult<String>;
}

/// Shared slot holding the session handle while a device is connected.
///
/// Device delegates are assembled long before a session exists; they capture a
/// clone of this slot, the device's `initialize` callback fills it, and
/// `deinitialize` clears it. A delegate invoked while disconnected observes an
/// empty slot and fails with [`InstrumentError::SessionNotOpen`].
#[derive(Default)]
pub struct SessionSlot {
    session: RwLock<Option<SessionHandle>>,
}

impl SessionSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the session opened for this device.
    pub fn set(&self, session: SessionHandle) {
        *self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    /// Clear the slot on disconnect.
    pub fn clear(&self) {
        *self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The current session, or `SessionNotOpen` when disconnected.
    pub fn get(&self) -> InstrResult<SessionHandle> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(InstrumentError::SessionNotOpen)
    }
}

/// Convenience alias used by device assemblies.
pub type SharedSessionSlot = Arc<SessionSlot>;
