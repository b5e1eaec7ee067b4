//! Asynchronous execution core for remote instrument control.
//!
//! This library exposes remote instrument parameters and operations as
//! non-blocking properties and actions: callers issue requests that return
//! immediately, work runs on single-flight lanes over a shared transport
//! channel, and completion (including every failure) is observed through
//! outcome values and event streams rather than thrown errors.
//!
//! # Architecture
//!
//! ```text
//! DeviceController ──▶ AutoUpdater ──▶ AsyncProperty / DeviceAction
//!                                            │
//!                                            ▼
//!                                   SingleFlightExecutor
//!                                            │
//!                                            ▼
//!                                    Transport (collaborator)
//! ```
//!
//! Control flows bottom-up at runtime: the controller drives the updater,
//! which drives properties, which drive single-flight execution, which
//! ultimately invokes the transport.

pub mod action;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod executor;
pub mod mock;
pub mod property;
pub mod transport;
pub mod updater;
