// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Camera Arbitration Broker for Rust
//!
//! A privileged broker that sits between many untrusted client processes and
//! a small number of exclusive camera devices, enumerated at runtime by
//! pluggable hardware backends.
//!
//! The broker guarantees that each device has at most one active user at a
//! time, arbitrates conflicting open requests by a priority policy tied to the
//! requesting process's foreground/background state, and tracks each device's
//! present/absent/enumerating/unavailable status as backends attach and detach.
//!
//! # Quick Start
//!
//! ```no_run
//! use camerabroker::backend::{VirtualBackend, VirtualDevice, VirtualDirectory};
//! use camerabroker::context::{ArbitrationContext, Collaborators};
//! use camerabroker::config::BrokerConfig;
//! use camerabroker::session::{CallerCredentials, SessionProtocol};
//! use std::sync::Arc;
//!
//! let directory = Arc::new(VirtualDirectory::new());
//! let backend = VirtualBackend::new("virtual");
//! backend.plug(VirtualDevice::new("0").with_cost(100));
//! directory.publish(backend);
//!
//! let ctx = ArbitrationContext::start(
//!     BrokerConfig::default(),
//!     Collaborators::permissive(directory),
//! )?;
//! # let callbacks: Arc<dyn camerabroker::session::ClientCallbacks> = unimplemented!();
//! let session = ctx.supervisor().connect(
//!     "0",
//!     CallerCredentials::new(1000, 10_001, "com.example.camera"),
//!     SessionProtocol::Modern,
//!     callbacks,
//! )?;
//! session.disconnect();
//! ctx.shutdown();
//! # Ok::<(), camerabroker::Error>(())
//! ```
//!
//! # Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`priority`] | Comparable per-process priorities |
//! | [`activity`] | Process activity cache with bounded oracle polling |
//! | [`registry`] | Lease admission and eviction decisions |
//! | [`status`] | Per-device status state machine |
//! | [`backend`] | Hot-plug backend registry and the virtual backend |
//! | [`supervisor`] | Open/close orchestration and admin surface |
//! | [`context`] | Explicit construction and teardown of all of the above |
//!
//! Lock domains are independent: the lease registry lock, one lock per
//! device status record, and the listener fan-out lock. Per-record locks are
//! always taken before the listener lock. The registry lock is never held
//! across a backend call or a lease teardown wait.

use std::{error, fmt, io};

/// Error type for broker operations
///
/// Every variant raised for a device carries a message naming the device id
/// and the cause.
#[derive(Debug)]
pub enum Error {
    /// Bad device id or parameter
    IllegalArgument(String),

    /// Credential or policy check failed
    PermissionDenied(String),

    /// Device absent, still enumerating, or its backend is unreachable
    Disconnected(String),

    /// The specific device is held by an equal-or-higher priority owner
    CameraInUse(String),

    /// The system-wide resource ceiling is reached
    MaxCamerasInUse(String),

    /// A policy override (privacy, mute, background restriction) blocks access
    Disabled(String),

    /// Unexpected backend response or protocol mismatch
    InvalidOperation(String),

    /// Internal inconsistency that could not be attributed to the caller
    Internal(String),

    /// A bounded wait on eviction teardown was exceeded
    Timeout(String),

    /// A backend or listener is already registered
    AlreadyExists(String),

    /// I/O error while writing diagnostics or reading configuration
    Io(io::Error),

    /// Configuration could not be parsed
    Json(serde_json::Error),
}

impl Error {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::CameraInUse(_) | Error::MaxCamerasInUse(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IllegalArgument(msg) => write!(f, "Illegal argument: {}", msg),
            Error::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            Error::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
            Error::CameraInUse(msg) => write!(f, "Camera in use: {}", msg),
            Error::MaxCamerasInUse(msg) => write!(f, "Too many cameras in use: {}", msg),
            Error::Disabled(msg) => write!(f, "Camera disabled: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
            Error::Timeout(msg) => write!(f, "Timed out: {}", msg),
            Error::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Json(err) => write!(f, "Configuration error: {}", err),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

/// Opaque device identifier reported by a backend.
pub type DeviceId = String;

/// The priority module maps processes to comparable priorities.
pub mod priority;

/// The activity module tracks whether a process is considered active.
pub mod activity;

/// The registry module decides lease admission and eviction.
pub mod registry;

/// The status module provides the per-device status state machine.
pub mod status;

/// The listener module fans status changes out to observers.
pub mod listener;

/// The backend module watches hot-plug hardware backends.
pub mod backend;

/// The session module defines client sessions and caller identity.
pub mod session;

/// The supervisor module orchestrates opening and closing devices.
pub mod supervisor;

/// The eventlog module keeps recent broker events for diagnostics.
pub mod eventlog;

/// The config module holds broker tunables.
pub mod config;

/// The context module owns the broker components.
pub mod context;

pub use context::ArbitrationContext;
pub use priority::Priority;
pub use status::{DeviceStatus, TorchStatus};
