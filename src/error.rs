//! Custom error types for the library.
//!
//! This module defines the primary error type, `InstrumentError`, used across
//! the execution core. Using the `thiserror` crate, it provides a centralized
//! and consistent way to classify the failures that can occur while talking to
//! a remote instrument, from session-level I/O problems to errors raised by
//! application-supplied device callbacks.
//!
//! Nothing in this library propagates an `InstrumentError` across an
//! asynchronous boundary as a panic or an unexpected `Err` in a fire-and-forget
//! entry point: failures travel inside completion outcomes and event streams
//! (see [`crate::executor::FlightOutcome`]), and the error type is shared
//! behind an `Arc` so every subscriber can observe the same failure.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type InstrResult<T> = std::result::Result<T, InstrumentError>;

/// Errors raised by the asynchronous instrument-control core.
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// Transport-level failure (channel open, raw exchange, close).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Underlying I/O failure surfaced by a transport implementation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An exchange was attempted on a session that is not open.
    #[error("Session is not open")]
    SessionNotOpen,

    /// A transport operation exceeded its configured timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Failure reported by the device itself (callback, status byte, etc.).
    #[error("Device error: {0}")]
    Device(String),

    /// A connection attempt was interrupted by an explicit disconnect.
    #[error("Connection attempt was interrupted")]
    ConnectionAborted,

    /// Opaque error from an application-supplied callback.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
