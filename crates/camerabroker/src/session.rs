// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Client sessions and caller identity.
//!
//! A [`Session`] is the handle a client gets back from a successful connect.
//! It owns the backend's [`DeviceSession`] and is itself owned by the lease
//! the supervisor inserts into the client registry, so dropping the lease
//! disconnects the session.
//!
//! The protocol-specific differences between sessions are captured by the
//! closed [`SessionKind`] variant. The arbitration core only ever looks at the
//! lease and the common session fields.

use crate::backend::{DeviceSession, SessionCallback};
use crate::registry::LeaseHandle;
use crate::supervisor::ConnectionSupervisor;
use crate::{DeviceId, Error};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Users are `uid / PER_USER_RANGE`.
pub const PER_USER_RANGE: u32 = 100_000;

/// Protocol level a client connects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProtocol {
    /// Older protocol. Reconnecting from the same remote returns the
    /// existing session.
    Legacy,
    Modern,
}

/// Protocol-specific part of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// Parameters captured from the device when the session started.
    Legacy { parameters: Option<Vec<u8>> },
    Modern,
    /// Finishes in-flight work after the online session was closed.
    Offline { switched_at: DateTime<Local> },
}

impl SessionKind {
    pub fn name(&self) -> &'static str {
        match self {
            SessionKind::Legacy { .. } => "legacy",
            SessionKind::Modern => "modern",
            SessionKind::Offline { .. } => "offline",
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, SessionKind::Offline { .. })
    }
}

/// Identity of a connecting process.
///
/// A trusted caller may open on behalf of another process with
/// [`CallerCredentials::on_behalf_of`]; the forwarded pid and uid then
/// decide priority and policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub package: String,
    pub trusted: bool,
    forwarded: Option<(i32, u32)>,
}

impl CallerCredentials {
    pub fn new(pid: i32, uid: u32, package: impl Into<String>) -> Self {
        CallerCredentials {
            pid,
            uid,
            package: package.into(),
            trusted: false,
            forwarded: None,
        }
    }

    /// Mark the caller as a platform-internal trusted source.
    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }

    /// Open for the client process `pid`/`uid` instead of the caller.
    pub fn on_behalf_of(mut self, pid: i32, uid: u32) -> Self {
        self.forwarded = Some((pid, uid));
        self
    }

    pub fn user_id(&self) -> u32 {
        self.uid / PER_USER_RANGE
    }

    /// The identity the broker arbitrates for.
    ///
    /// Only trusted callers may forward another identity, and the forwarded
    /// identity is not itself trusted.
    pub fn resolve(&self) -> Result<CallerCredentials, Error> {
        match self.forwarded {
            None => Ok(self.clone()),
            Some((pid, uid)) if pid == self.pid && uid == self.uid => Ok(CallerCredentials {
                forwarded: None,
                ..self.clone()
            }),
            Some((pid, uid)) if self.trusted => Ok(CallerCredentials {
                pid,
                uid,
                package: self.package.clone(),
                trusted: false,
                forwarded: None,
            }),
            Some((pid, uid)) => Err(Error::PermissionDenied(format!(
                "pid {} (uid {}) may not open on behalf of pid {} (uid {})",
                self.pid, self.uid, pid, uid
            ))),
        }
    }
}

/// Why a session was disconnected by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A higher-priority client took the device.
    Evicted { by_pid: i32, by_package: String },
    DeviceRemoved,
    ClientDied,
    Blocked(BlockReason),
    Shutdown,
}

/// Policy that blocked a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    UidIdle,
    SensorPrivacy,
    UserNotAllowed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Evicted { by_pid, by_package } => write!(
                f,
                "evicted by package {} (PID {})",
                by_package, by_pid
            ),
            DisconnectReason::DeviceRemoved => write!(f, "device removed"),
            DisconnectReason::ClientDied => write!(f, "client died"),
            DisconnectReason::Blocked(BlockReason::UidIdle) => write!(f, "uid went idle"),
            DisconnectReason::Blocked(BlockReason::SensorPrivacy) => {
                write!(f, "sensor privacy enabled")
            }
            DisconnectReason::Blocked(BlockReason::UserNotAllowed) => {
                write!(f, "user no longer allowed")
            }
            DisconnectReason::Shutdown => write!(f, "broker shutting down"),
        }
    }
}

/// Handle the broker keeps on a client's remote end.
pub trait ClientCallbacks: Send + Sync {
    /// Identity of the remote end. Sessions from the same remote share it.
    fn remote_id(&self) -> u64;

    fn on_disconnected(&self, device_id: &str, reason: &DisconnectReason);

    fn on_device_error(&self, _device_id: &str, _message: &str) {}

    /// Arrange for `link` to fire when the remote dies. Returns false if
    /// the remote is already dead.
    fn link_to_death(&self, _link: DeathLink) -> bool {
        true
    }

    fn unlink_to_death(&self) {}
}

/// Death notification bound to a remote.
#[derive(Clone)]
pub struct DeathLink {
    supervisor: Weak<ConnectionSupervisor>,
    remote_id: u64,
}

impl DeathLink {
    pub(crate) fn new(supervisor: Weak<ConnectionSupervisor>, remote_id: u64) -> Self {
        DeathLink {
            supervisor,
            remote_id,
        }
    }

    pub fn remote_id(&self) -> u64 {
        self.remote_id
    }

    /// The remote died: reap every session bound to it.
    pub fn fire(&self) {
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.client_died(self.remote_id);
        }
    }
}

impl fmt::Debug for DeathLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeathLink")
            .field("remote_id", &self.remote_id)
            .finish()
    }
}

/// Forwards device errors from the backend to the client.
pub(crate) struct ErrorForwarder {
    pub(crate) callbacks: Arc<dyn ClientCallbacks>,
}

impl SessionCallback for ErrorForwarder {
    fn on_device_error(&self, device_id: &str, message: &str) {
        log::warn!("device {} error: {}", device_id, message);
        self.callbacks.on_device_error(device_id, message);
    }
}

/// An open client session on one device.
pub struct Session {
    device_id: DeviceId,
    kind: SessionKind,
    client: CallerCredentials,
    callbacks: Arc<dyn ClientCallbacks>,
    device: Mutex<Option<Box<dyn DeviceSession>>>,
    supervisor: Weak<ConnectionSupervisor>,
    opened_at: DateTime<Local>,
    started: AtomicBool,
    notified: AtomicBool,
    disconnected: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        device_id: &str,
        kind: SessionKind,
        client: CallerCredentials,
        callbacks: Arc<dyn ClientCallbacks>,
        device: Box<dyn DeviceSession>,
        supervisor: Weak<ConnectionSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Session {
            device_id: device_id.to_string(),
            kind,
            client,
            callbacks,
            device: Mutex::new(Some(device)),
            supervisor,
            opened_at: Local::now(),
            started: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub fn pid(&self) -> i32 {
        self.client.pid
    }

    pub fn uid(&self) -> u32 {
        self.client.uid
    }

    pub fn package(&self) -> &str {
        &self.client.package
    }

    pub fn client(&self) -> &CallerCredentials {
        &self.client
    }

    pub fn remote_id(&self) -> u64 {
        self.callbacks.remote_id()
    }

    pub fn opened_at(&self) -> DateTime<Local> {
        self.opened_at
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn callbacks(&self) -> &Arc<dyn ClientCallbacks> {
        &self.callbacks
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Run `f` against the backend session, if it is still open.
    pub(crate) fn with_device<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&dyn DeviceSession) -> T,
    {
        self.device.lock().as_deref().map(f)
    }

    /// Tell the client why it is losing the device. Only the first reason
    /// is delivered.
    pub(crate) fn notify_disconnected(&self, reason: &DisconnectReason) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(
            "disconnecting device {} from package {} (PID {}): {}",
            self.device_id,
            self.client.package,
            self.client.pid,
            reason
        );
        self.callbacks.on_disconnected(&self.device_id, reason);
    }

    /// Close the session. Repeated calls are no-ops.
    ///
    /// The backend session is closed first, which may block, and only then
    /// is the lease released, so a waiter on the lease observes a fully
    /// closed device.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(
            "closing {} session of device {} for PID {}",
            self.kind.name(),
            self.device_id,
            self.client.pid
        );
        let device = self.device.lock().take();
        if let Some(device) = device {
            device.close();
        }
        if let Some(supervisor) = self.supervisor.upgrade() {
            supervisor.on_session_closed(self);
        }
    }

    /// Hand in-flight work to a new offline session and close this one.
    pub fn switch_to_offline(self: &Arc<Self>) -> Result<Arc<Session>, Error> {
        let supervisor = self.supervisor.upgrade().ok_or_else(|| {
            Error::InvalidOperation(format!(
                "broker of device {} is shutting down",
                self.device_id
            ))
        })?;
        supervisor.switch_to_offline(self)
    }

    /// Switch the backend session to offline processing.
    pub(crate) fn take_offline(&self) -> Result<Box<dyn DeviceSession>, Error> {
        self.with_device(|d| d.switch_to_offline()).unwrap_or_else(|| {
            Err(Error::InvalidOperation(format!(
                "session of device {} is already closed",
                self.device_id
            )))
        })
    }
}

impl LeaseHandle for Arc<Session> {
    fn disconnect(&self) {
        Session::disconnect(self);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("kind", &self.kind.name())
            .field("pid", &self.client.pid)
            .field("uid", &self.client.uid)
            .field("package", &self.client.package)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        closes: Arc<AtomicUsize>,
    }

    impl DeviceSession for Counting {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Client {
        reasons: Mutex<Vec<DisconnectReason>>,
    }

    impl ClientCallbacks for Client {
        fn remote_id(&self) -> u64 {
            7
        }

        fn on_disconnected(&self, _device_id: &str, reason: &DisconnectReason) {
            self.reasons.lock().push(reason.clone());
        }
    }

    #[test]
    fn test_forwarding_requires_trust() {
        let caller = CallerCredentials::new(100, 1000, "cameraserver").on_behalf_of(200, 10_050);
        assert!(matches!(caller.resolve(), Err(Error::PermissionDenied(_))));

        let resolved = caller.trusted().resolve().unwrap();
        assert_eq!((resolved.pid, resolved.uid), (200, 10_050));
        assert!(!resolved.trusted);
    }

    #[test]
    fn test_forwarding_self_is_allowed() {
        let caller = CallerCredentials::new(100, 10_010, "app").on_behalf_of(100, 10_010);
        assert_eq!(caller.resolve().unwrap().pid, 100);
    }

    #[test]
    fn test_user_id() {
        assert_eq!(CallerCredentials::new(1, 1_010_045, "app").user_id(), 10);
        assert_eq!(CallerCredentials::new(1, 10_045, "app").user_id(), 0);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let client = Arc::new(Client::default());
        let session = Session::new(
            "0",
            SessionKind::Modern,
            CallerCredentials::new(1, 10_001, "app"),
            client.clone(),
            Box::new(Counting {
                closes: closes.clone(),
            }),
            Weak::new(),
        );
        session.disconnect();
        LeaseHandle::disconnect(&session);
        assert!(session.is_disconnected());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(session.with_device(|_| ()).is_none());
    }

    #[test]
    fn test_only_first_reason_is_delivered() {
        let client = Arc::new(Client::default());
        let session = Session::new(
            "0",
            SessionKind::Modern,
            CallerCredentials::new(1, 10_001, "app"),
            client.clone(),
            Box::new(Counting {
                closes: Arc::new(AtomicUsize::new(0)),
            }),
            Weak::new(),
        );
        session.notify_disconnected(&DisconnectReason::DeviceRemoved);
        session.notify_disconnected(&DisconnectReason::ClientDied);
        assert_eq!(*client.reasons.lock(), vec![DisconnectReason::DeviceRemoved]);
    }

    #[test]
    fn test_reason_display() {
        let reason = DisconnectReason::Evicted {
            by_pid: 42,
            by_package: "com.example".into(),
        };
        assert_eq!(reason.to_string(), "evicted by package com.example (PID 42)");
        assert_eq!(
            DisconnectReason::Blocked(BlockReason::SensorPrivacy).to_string(),
            "sensor privacy enabled"
        );
    }
}
