// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Open/close orchestration.
//!
//! The [`ConnectionSupervisor`] is the only component that touches both the
//! client registry and the device status tracker in one operation. A connect
//! runs in this order:
//!
//! 1. Validate the caller and the device status.
//! 2. Refresh owner priorities and ask the registry for an admission
//!    decision.
//! 3. Notify every losing session, disconnect it on its own thread and wait,
//!    bounded, until its lease is gone. A timeout is reported to the caller
//!    as [`Error::Timeout`].
//! 4. Re-validate the device, open the backend session, then insert the
//!    lease and mark the device `NotAvailable`.
//! 5. Bind the caller's death notification last.
//!
//! Connects and offline switches are serialized by a connect gate with a
//! bounded wait. No supervisor lock is held across a backend call or a
//! teardown wait. A separate device-ops lock orders lease insertion and
//! removal against the matching status transitions, so a closing session
//! can never flip a device back to `Present` after a new owner took it.
//!
//! The supervisor also receives device events from the backend registry
//! and hosts the administrative surface: activity overrides, sensor privacy,
//! the allowed user set, the global camera mute and rotate-and-crop
//! overrides, and the dump.

use crate::activity::{ActivityMonitor, UidState};
use crate::backend::{BackendRegistry, BackendSummary, DeviceEventListener};
use crate::config::BrokerConfig;
use crate::eventlog::{DiagnosticSnapshot, EventLog};
use crate::listener::{ListenerId, ListenerRegistry, StatusListener};
use crate::priority::{process_state, Priority, PriorityCatalog, ProcessInfo, UNKNOWN_PROCESS_SCORE};
use crate::registry::{Admission, ClientLease, ClientRegistry, LeaseKey, LeaseSummary, WaitOutcome};
use crate::session::{
    BlockReason, CallerCredentials, ClientCallbacks, DeathLink, DisconnectReason, ErrorForwarder,
    Session, SessionKind, SessionProtocol,
};
use crate::status::{
    DeviceCost, DeviceSnapshot, DeviceStatus, DeviceStatusTracker, TorchStatus, Transition,
};
use crate::{DeviceId, Error};
use chrono::Local;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Lease type held by the supervisor.
pub type Lease = ClientLease<Arc<Session>>;

/// Largest rotate-and-crop value. It also means "no override": sessions use
/// their own setting.
pub const ROTATE_AND_CROP_AUTO: u8 = 4;

/// Permission checks delegated to the platform.
pub trait PermissionPolicy: Send + Sync {
    fn can_use_camera(&self, client: &CallerCredentials, device_id: &str) -> bool;

    /// Whether `caller` may receive device open/close events.
    fn can_observe_open_close(&self, caller: &CallerCredentials) -> bool;

    fn can_see_device(&self, _caller: &CallerCredentials, _device_id: &str) -> bool {
        true
    }
}

/// Everyone may use every camera; only trusted callers observe open/close
/// events.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissivePolicy;

impl PermissionPolicy for PermissivePolicy {
    fn can_use_camera(&self, _client: &CallerCredentials, _device_id: &str) -> bool {
        true
    }

    fn can_observe_open_close(&self, caller: &CallerCredentials) -> bool {
        caller.trusted
    }
}

struct ConnectGate {
    busy: Mutex<bool>,
    cond: Condvar,
}

struct GatePermit<'a> {
    gate: &'a ConnectGate,
}

impl ConnectGate {
    fn new() -> Self {
        ConnectGate {
            busy: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self, timeout: Duration) -> Option<GatePermit<'_>> {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.lock();
        while *busy {
            if self.cond.wait_until(&mut busy, deadline).timed_out() && *busy {
                return None;
            }
        }
        *busy = true;
        Some(GatePermit { gate: self })
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        *self.gate.busy.lock() = false;
        self.gate.cond.notify_one();
    }
}

#[derive(Debug)]
struct ServiceState {
    rotate_and_crop: u8,
    camera_mute: bool,
    sensor_privacy: bool,
    allowed_users: Option<BTreeSet<u32>>,
    shut_down: bool,
}

/// Per-device entry of a [`DumpReport`].
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device_id: DeviceId,
    pub status: DeviceStatus,
    pub cost: i32,
    pub conflicting: Vec<DeviceId>,
    pub unavailable_physical_ids: Vec<DeviceId>,
    pub torch: Option<TorchStatus>,
    pub backend: Option<String>,
}

/// Listener entry of a [`DumpReport`].
#[derive(Debug, Clone, Serialize)]
pub struct ListenerReport {
    pub id: ListenerId,
    pub owner: i32,
    pub privileged: bool,
    pub open_close_events: bool,
}

/// Serializable broker state.
#[derive(Debug, Clone, Serialize)]
pub struct DumpReport {
    pub leases: Vec<LeaseSummary>,
    pub devices: Vec<DeviceReport>,
    pub backends: Vec<BackendSummary>,
    pub listeners: Vec<ListenerReport>,
    pub rotate_and_crop: u8,
    pub camera_mute: bool,
    pub sensor_privacy: bool,
    pub allowed_users: Option<Vec<u32>>,
    /// Event log, most recent first.
    pub events: Vec<String>,
}

/// Orchestrates opening and closing devices.
pub struct ConnectionSupervisor {
    self_ref: Weak<ConnectionSupervisor>,
    config: BrokerConfig,
    leases: ClientRegistry<Arc<Session>>,
    tracker: Arc<DeviceStatusTracker>,
    backends: Arc<BackendRegistry>,
    listeners: ListenerRegistry,
    activity: ActivityMonitor,
    process_info: Arc<dyn ProcessInfo>,
    permissions: Arc<dyn PermissionPolicy>,
    events: EventLog,
    snapshot: DiagnosticSnapshot,
    gate: ConnectGate,
    device_ops: Mutex<()>,
    service: Mutex<ServiceState>,
    torch: Mutex<BTreeMap<DeviceId, TorchStatus>>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: BrokerConfig,
        tracker: Arc<DeviceStatusTracker>,
        backends: Arc<BackendRegistry>,
        activity: ActivityMonitor,
        process_info: Arc<dyn ProcessInfo>,
        permissions: Arc<dyn PermissionPolicy>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| ConnectionSupervisor {
            self_ref: self_ref.clone(),
            leases: ClientRegistry::new(config.max_cost),
            events: EventLog::new(config.event_log_length),
            snapshot: DiagnosticSnapshot::new(config.snapshot_path.clone()),
            config,
            tracker,
            backends,
            listeners: ListenerRegistry::new(),
            activity,
            process_info,
            permissions,
            gate: ConnectGate::new(),
            device_ops: Mutex::new(()),
            service: Mutex::new(ServiceState {
                rotate_and_crop: ROTATE_AND_CROP_AUTO,
                camera_mute: false,
                sensor_privacy: false,
                allowed_users: None,
                shut_down: false,
            }),
            torch: Mutex::new(BTreeMap::new()),
        })
    }

    /// Open `device_id` for `caller`.
    ///
    /// Fails with [`Error::CameraInUse`] when a higher-priority client holds
    /// the device itself, [`Error::MaxCamerasInUse`] when the cost ceiling or
    /// a conflicting device blocks it, and [`Error::Timeout`] when a losing
    /// session did not finish closing in time. A failed connect leaves the
    /// lease table unchanged, apart from sessions already evicted on its
    /// behalf.
    ///
    /// # Panics
    ///
    /// Panics if inserting the new lease evicts anything, which means the
    /// lease table changed behind the connect gate.
    pub fn connect(
        &self,
        device_id: &str,
        caller: CallerCredentials,
        protocol: SessionProtocol,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> Result<Arc<Session>, Error> {
        let client = caller.resolve()?;
        let _permit = self
            .gate
            .acquire(self.config.connect_timeout())
            .ok_or_else(|| {
                Error::MaxCamerasInUse(format!(
                    "cannot open device {} for PID {}: too many other clients connecting",
                    device_id, client.pid
                ))
            })?;

        self.validate(device_id, &client)?;

        if protocol == SessionProtocol::Legacy {
            if let Some(existing) = self.reconnect_legacy(device_id, &callbacks) {
                return Ok(existing);
            }
        }

        let (priority, cost, evicted) = self.admit(device_id, &client)?;
        self.tear_down(device_id, evicted)?;

        // The device may have been unplugged while the losers were closing.
        self.validate(device_id, &client)?;

        let forwarder = Arc::new(ErrorForwarder {
            callbacks: Arc::clone(&callbacks),
        });
        let device = self.backends.open_session(device_id, forwarder)?;
        let kind = match protocol {
            SessionProtocol::Legacy => SessionKind::Legacy {
                parameters: device.legacy_parameters(),
            },
            SessionProtocol::Modern => SessionKind::Modern,
        };
        let session = Session::new(
            device_id,
            kind,
            client.clone(),
            Arc::clone(&callbacks),
            device,
            self.self_ref.clone(),
        );
        let lease = ClientLease::new(
            LeaseKey::online(device_id),
            client.pid,
            cost.cost,
            cost.conflicting,
            priority,
            Arc::clone(&session),
        );

        let (admitted, leftover) = {
            let _ops = self.device_ops.lock();
            match self.tracker.update_status(
                device_id,
                DeviceStatus::NotAvailable,
                &[],
                self.status_callback(),
            ) {
                Transition::Accepted { .. } | Transition::Unchanged => {
                    let leftover = self.leases.add_and_evict(Arc::clone(&lease));
                    self.start_session(&session);
                    (true, leftover)
                }
                _ => (false, Vec::new()),
            }
        };
        if !leftover.is_empty() {
            panic!(
                "opening device {} for PID {} evicted {} leases that passed admission",
                device_id,
                client.pid,
                leftover.len()
            );
        }
        if !admitted {
            drop(lease);
            return Err(Error::Disconnected(format!(
                "device {} was removed while it was being opened",
                device_id
            )));
        }

        log::info!(
            "device {} opened by package {} (PID {}, {})",
            device_id,
            client.package,
            client.pid,
            priority
        );
        self.events.connect(device_id, &client.package, client.pid);
        if caller.trusted {
            self.write_snapshot();
        }

        let link = DeathLink::new(self.self_ref.clone(), callbacks.remote_id());
        if !callbacks.link_to_death(link) {
            log::warn!(
                "client of device {} (PID {}) died while opening",
                device_id,
                client.pid
            );
            session.disconnect();
            return Err(Error::Disconnected(format!(
                "client of device {} died while it was being opened",
                device_id
            )));
        }
        Ok(session)
    }

    fn validate(&self, device_id: &str, client: &CallerCredentials) -> Result<(), Error> {
        if device_id.is_empty() {
            return Err(Error::IllegalArgument("empty device id".to_string()));
        }
        if !self.permissions.can_use_camera(client, device_id) {
            return Err(Error::PermissionDenied(format!(
                "package {} (PID {}, uid {}) may not use device {}",
                client.package, client.pid, client.uid, device_id
            )));
        }
        {
            let service = self.service.lock();
            if service.shut_down {
                return Err(Error::Disconnected(format!(
                    "cannot open device {}: broker is shutting down",
                    device_id
                )));
            }
            if let Some(users) = service.allowed_users.as_ref() {
                if !client.trusted && !users.contains(&client.user_id()) {
                    return Err(Error::PermissionDenied(format!(
                        "user {} may not open device {}",
                        client.user_id(),
                        device_id
                    )));
                }
            }
            if service.sensor_privacy && !client.trusted {
                return Err(Error::Disabled(format!(
                    "cannot open device {}: sensor privacy is enabled",
                    device_id
                )));
            }
        }
        if !client.trusted && !self.activity.is_uid_active(client.uid, &client.package) {
            self.events.rejected(device_id, &client.package, client.pid, "uid is not active");
            return Err(Error::Disabled(format!(
                "device {} cannot be opened by package {} (uid {}) while it is inactive",
                device_id, client.package, client.uid
            )));
        }
        match self.tracker.status(device_id) {
            Some(status) if status.is_usable() => Ok(()),
            Some(status) => Err(Error::Disconnected(format!(
                "device {} is not available, status {}",
                device_id, status
            ))),
            None => Err(Error::Disconnected(format!(
                "device {} is not present",
                device_id
            ))),
        }
    }

    fn reconnect_legacy(
        &self,
        device_id: &str,
        callbacks: &Arc<dyn ClientCallbacks>,
    ) -> Option<Arc<Session>> {
        let lease = self.leases.get(&LeaseKey::online(device_id))?;
        let session = lease.handle()?;
        let same_remote = session.remote_id() == callbacks.remote_id();
        if same_remote
            && matches!(session.kind(), SessionKind::Legacy { .. })
            && !session.is_disconnected()
        {
            log::info!(
                "reconnecting legacy client of device {} (PID {})",
                device_id,
                session.pid()
            );
            return Some(Arc::clone(session));
        }
        None
    }

    /// Refresh priorities and decide admission. On success, every losing
    /// session has been told why it is going away.
    fn admit(
        &self,
        device_id: &str,
        client: &CallerCredentials,
    ) -> Result<(Priority, DeviceCost, Vec<Arc<Lease>>), Error> {
        let record = self
            .tracker
            .get(device_id)
            .ok_or_else(|| Error::Disconnected(format!("device {} is not present", device_id)))?;
        let cost = record.cost().clone();

        let mut owners: Vec<(i32, bool)> = Vec::new();
        for lease in self.leases.summaries() {
            if !owners.contains(&(lease.owner, lease.trusted)) {
                owners.push((lease.owner, lease.trusted));
            }
        }
        owners.push((client.pid, client.trusted));
        let catalog = PriorityCatalog::snapshot(self.process_info.as_ref(), &owners);
        self.leases.update_priorities(&catalog);
        let priority = catalog.get(client.pid).unwrap_or_else(|| {
            Priority::for_owner(UNKNOWN_PROCESS_SCORE, process_state::NONEXISTENT, client.trusted)
        });

        let candidate = Lease::descriptor(
            LeaseKey::online(device_id),
            client.pid,
            cost.cost,
            cost.conflicting.clone(),
            priority,
        );
        match self.leases.admission(&candidate) {
            Admission::Reject => {
                let incompatible = self.leases.incompatible_clients(&candidate);
                let holders = incompatible
                    .iter()
                    .map(|l| l.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                log::info!(
                    "rejecting device {} for package {} (PID {}, {}): held by {}",
                    device_id,
                    client.package,
                    client.pid,
                    priority,
                    if holders.is_empty() { "resource limits" } else { holders.as_str() }
                );
                self.events.rejected(
                    device_id,
                    &client.package,
                    client.pid,
                    &format!("Higher-priority clients: {}", holders),
                );
                if incompatible.iter().any(|l| l.key() == candidate.key()) {
                    Err(Error::CameraInUse(format!(
                        "device {} is in use by a higher-priority client: {}",
                        device_id, holders
                    )))
                } else {
                    Err(Error::MaxCamerasInUse(format!(
                        "cannot open device {}: camera limit reached or a conflicting device is held",
                        device_id
                    )))
                }
            }
            Admission::Admit(evicted) => {
                let reason = DisconnectReason::Evicted {
                    by_pid: client.pid,
                    by_package: client.package.clone(),
                };
                for lease in &evicted {
                    log::info!("evicting conflicting client {}", lease);
                    if let Some(session) = lease.handle() {
                        self.events.evict(
                            &lease.key().to_string(),
                            session.package(),
                            lease.owner(),
                            &format!(
                                "Evicted by package {} (PID {}) opening device {}",
                                client.package, client.pid, device_id
                            ),
                        );
                        session.notify_disconnected(&reason);
                    }
                }
                Ok((priority, cost, evicted))
            }
        }
    }

    /// Disconnect every evicted session on its own thread and wait for
    /// their leases to go away.
    fn tear_down(&self, device_id: &str, evicted: Vec<Arc<Lease>>) -> Result<(), Error> {
        for lease in &evicted {
            if let Some(session) = lease.handle() {
                let session = Arc::clone(session);
                thread::Builder::new()
                    .name(format!("evict-{}", lease.key()))
                    .spawn(move || session.disconnect())?;
            }
        }
        let timeout = self.config.disconnect_timeout();
        for lease in &evicted {
            if self.leases.wait_until_removed(lease, timeout) == WaitOutcome::TimedOut {
                log::error!(
                    "timed out after {:?} waiting for evicted client {} to close",
                    timeout,
                    lease
                );
                return Err(Error::Timeout(format!(
                    "evicted client of device {} did not close within {} ms, device {} not opened",
                    lease.key(),
                    timeout.as_millis(),
                    device_id
                )));
            }
        }
        Ok(())
    }

    /// Start operations of a freshly inserted session. Called with the
    /// device-ops lock held.
    fn start_session(&self, session: &Session) {
        let device_id = session.device_id();
        let (rotate_and_crop, camera_mute) = {
            let service = self.service.lock();
            (service.rotate_and_crop, service.camera_mute)
        };
        self.activity.register_monitor_uid(session.uid());
        self.listeners
            .for_each_open_close(|l| l.on_device_opened(device_id, session.package()));
        session.with_device(|device| {
            if rotate_and_crop != ROTATE_AND_CROP_AUTO {
                if let Err(e) = device.set_rotate_and_crop(rotate_and_crop) {
                    log::warn!("device {}: unable to apply rotate-and-crop: {}", device_id, e);
                }
            }
            if camera_mute && device.supports_camera_mute() {
                if let Err(e) = device.set_camera_mute(true) {
                    log::warn!("device {}: unable to apply camera mute: {}", device_id, e);
                }
            }
        });
        if let SessionKind::Legacy { parameters } = session.kind() {
            if let Some(record) = self.tracker.get(device_id) {
                record.set_shim_params(parameters.clone());
            }
        }
        session.mark_started();
    }

    /// Close path of a session: drop its lease, release its hooks, then
    /// move the device back toward `Present`.
    pub(crate) fn on_session_closed(&self, session: &Session) {
        let device_id = session.device_id();
        let removed = {
            let _ops = self.device_ops.lock();
            let removed = self.leases.remove_matching(|l| {
                l.handle()
                    .map_or(false, |h| std::ptr::eq(Arc::as_ptr(h), session))
            });
            if session.is_started() && !session.kind().is_offline() {
                self.activity.unregister_monitor_uid(session.uid());
                self.tracker.update_status(
                    device_id,
                    DeviceStatus::Present,
                    &[DeviceStatus::NotPresent, DeviceStatus::Enumerating],
                    self.status_callback(),
                );
                self.listeners
                    .for_each_open_close(|l| l.on_device_closed(device_id));
            }
            removed
        };

        if !removed.is_empty() {
            self.events
                .disconnect(&removed[0].key().to_string(), session.package(), session.pid());
            log::info!(
                "device {} closed by package {} (PID {})",
                removed[0].key(),
                session.package(),
                session.pid()
            );
        }
        let remote = session.remote_id();
        let remote_alive = self
            .leases
            .all()
            .iter()
            .any(|l| l.handle().map_or(false, |s| s.remote_id() == remote));
        if !remote_alive {
            session.callbacks().unlink_to_death();
        }
        drop(removed);
    }

    /// Move `session`'s in-flight work to an offline session under the
    /// `offline-<id>` key and close the online session.
    pub(crate) fn switch_to_offline(&self, session: &Arc<Session>) -> Result<Arc<Session>, Error> {
        let device_id = session.device_id();
        let _permit = self
            .gate
            .acquire(self.config.connect_timeout())
            .ok_or_else(|| {
                Error::MaxCamerasInUse(format!(
                    "cannot switch device {} offline: too many other clients connecting",
                    device_id
                ))
            })?;
        if session.is_disconnected() || session.kind().is_offline() {
            return Err(Error::InvalidOperation(format!(
                "session of device {} cannot be switched offline",
                device_id
            )));
        }
        let priority = self
            .leases
            .get(&LeaseKey::online(device_id))
            .filter(|l| l.handle().map_or(false, |h| Arc::ptr_eq(h, session)))
            .map(|l| l.priority())
            .ok_or_else(|| {
                Error::InvalidOperation(format!("session of device {} holds no lease", device_id))
            })?;

        let key = LeaseKey::offline(device_id);
        let candidate = Lease::descriptor(key.clone(), session.pid(), 0, BTreeSet::new(), priority);
        let incompatible: Vec<String> = self
            .leases
            .would_evict(&candidate)
            .iter()
            .filter(|l| !Arc::ptr_eq(l, &candidate))
            .map(|l| l.to_string())
            .collect();
        if !incompatible.is_empty() {
            let holders = incompatible.join(", ");
            log::warn!("offline switch of device {} blocked by {}", device_id, holders);
            self.events.rejected(
                &key.to_string(),
                session.package(),
                session.pid(),
                &format!("Incompatible clients: {}", holders),
            );
            return Err(Error::IllegalArgument(format!(
                "offline session of device {} conflicts with existing clients: {}",
                device_id, holders
            )));
        }
        if self.leases.get(&key).is_some() {
            return Err(Error::IllegalArgument(format!(
                "device {} already has an offline session",
                device_id
            )));
        }

        let device = session.take_offline()?;
        let offline = Session::new(
            device_id,
            SessionKind::Offline {
                switched_at: Local::now(),
            },
            session.client().clone(),
            Arc::clone(session.callbacks()),
            device,
            self.self_ref.clone(),
        );
        offline.mark_started();
        let lease = Lease::new(
            key.clone(),
            session.pid(),
            0,
            BTreeSet::new(),
            priority,
            Arc::clone(&offline),
        );
        let leftover = {
            let _ops = self.device_ops.lock();
            self.leases.add_and_evict(lease)
        };
        if !leftover.is_empty() {
            panic!(
                "offline session of device {} evicted {} leases that passed admission",
                device_id,
                leftover.len()
            );
        }
        self.events.record(format!(
            "OFFLINE device {} switched for package {} (PID {})",
            device_id,
            session.package(),
            session.pid()
        ));
        session.disconnect();
        Ok(offline)
    }

    /// Disconnect every session bound to the dead remote `remote_id`.
    pub fn client_died(&self, remote_id: u64) -> usize {
        log::info!("client remote {} died", remote_id);
        self.disconnect_where(|s| s.remote_id() == remote_id, &DisconnectReason::ClientDied)
    }

    fn disconnect_where<P>(&self, pred: P, reason: &DisconnectReason) -> usize
    where
        P: Fn(&Session) -> bool,
    {
        let sessions: Vec<Arc<Session>> = self
            .leases
            .all()
            .iter()
            .filter_map(|l| l.handle().filter(|s| pred(s)).cloned())
            .collect();
        for session in &sessions {
            self.events.evict(
                session.device_id(),
                session.package(),
                session.pid(),
                &reason.to_string(),
            );
            session.notify_disconnected(reason);
        }
        for session in &sessions {
            session.disconnect();
        }
        sessions.len()
    }

    fn block_uid(&self, uid: u32) -> usize {
        self.disconnect_where(
            |s| s.uid() == uid && !s.client().trusted,
            &DisconnectReason::Blocked(BlockReason::UidIdle),
        )
    }

    // Device events

    fn status_callback(&self) -> impl FnOnce(&str, DeviceStatus, DeviceStatus) + '_ {
        move |device_id, from, to| {
            self.events
                .device_status(device_id, &format!("{} -> {}", from, to));
            self.listeners.for_each(|l| l.on_status_changed(device_id, to));
            self.update_torch_for_status(device_id, to);
        }
    }

    fn update_torch_for_status(&self, device_id: &str, status: DeviceStatus) {
        let torch = match status {
            DeviceStatus::Present => TorchStatus::AvailableOff,
            DeviceStatus::Enumerating => return,
            _ => TorchStatus::NotAvailable,
        };
        let changed = {
            let mut map = self.torch.lock();
            match map.get_mut(device_id) {
                Some(current) if *current != torch => {
                    *current = torch;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.listeners
                .for_each(|l| l.on_torch_status_changed(device_id, torch));
        }
    }

    fn add_device(&self, device_id: &str) -> bool {
        let cost = match self.backends.device_cost(device_id) {
            Ok(cost) => cost,
            Err(e) => {
                log::warn!("unable to add device {}: {}", device_id, e);
                return false;
            }
        };
        let flash = self.backends.has_flash_unit(device_id);
        self.tracker.add_device(device_id, cost, flash);
        if flash {
            self.torch
                .lock()
                .entry(device_id.to_string())
                .or_insert(TorchStatus::NotAvailable);
        }
        self.events.device_status(device_id, "added");
        true
    }

    /// The device is gone: mark it `NotPresent`, disconnect its sessions and
    /// forget its record.
    fn remove_device(&self, device_id: &str) {
        let removed = {
            let _ops = self.device_ops.lock();
            let transition = self.tracker.update_status(
                device_id,
                DeviceStatus::NotPresent,
                &[],
                self.status_callback(),
            );
            if transition == Transition::UnknownDevice {
                return;
            }
            if let Some(record) = self.tracker.get(device_id) {
                record.set_shim_params(None);
            }
            self.leases.remove_matching(|l| l.device_id() == device_id)
        };

        for lease in &removed {
            if let Some(session) = lease.handle() {
                self.events.evict(
                    &lease.key().to_string(),
                    session.package(),
                    lease.owner(),
                    "Device removed",
                );
                session.notify_disconnected(&DisconnectReason::DeviceRemoved);
            }
        }
        for lease in &removed {
            if let Some(session) = lease.handle() {
                session.disconnect();
            }
        }
        drop(removed);

        self.tracker.remove_device(device_id);
        self.torch.lock().remove(device_id);
        log::info!("device {} removed", device_id);
    }

    // Listeners

    /// Register `listener` and return its id plus the current state of
    /// every device the caller may see. Current torch statuses are
    /// delivered to the listener before this returns.
    pub fn add_listener(
        &self,
        listener: &Arc<dyn StatusListener>,
        caller: &CallerCredentials,
    ) -> Result<(ListenerId, Vec<DeviceSnapshot>), Error> {
        let open_close = self.permissions.can_observe_open_close(caller);
        let id = self.listeners.add(listener, caller.pid, caller.trusted, open_close)?;
        let devices: Vec<DeviceSnapshot> = self
            .tracker
            .snapshot()
            .into_iter()
            .filter(|d| self.permissions.can_see_device(caller, &d.device_id))
            .collect();
        let torch: Vec<(DeviceId, TorchStatus)> = self
            .torch
            .lock()
            .iter()
            .map(|(id, status)| (id.clone(), *status))
            .collect();
        for (device_id, status) in torch {
            if self.permissions.can_see_device(caller, &device_id) {
                listener.on_torch_status_changed(&device_id, status);
            }
        }
        Ok((id, devices))
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StatusListener>) -> Result<(), Error> {
        self.listeners.remove(listener)
    }

    /// The process behind listener `id` died.
    pub fn listener_died(&self, id: ListenerId) {
        if self.listeners.remove_by_id(id) {
            log::debug!("status listener {} died", id);
        }
    }

    // Activity and policy

    /// The platform reports `uid` went idle.
    pub fn on_uid_idle(&self, uid: u32) {
        if self.activity.on_uid_idle(uid) {
            self.block_uid(uid);
        }
    }

    pub fn on_uid_active(&self, uid: u32) {
        self.activity.on_uid_active(uid);
    }

    /// The process state of `uid` changed.
    pub fn on_uid_state_changed(&self, uid: u32, proc_state: i32) {
        if self.activity.on_uid_state_changed(uid, proc_state) {
            self.listeners.for_each(|l| l.on_access_priorities_changed());
        }
    }

    pub fn uid_state(&self, uid: u32) -> UidState {
        self.activity.uid_state(uid)
    }

    /// Override the cached activity of `uid`. Forcing it idle disconnects
    /// its sessions.
    pub fn set_uid_state(&self, uid: u32, active: bool) {
        self.events.policy(&format!(
            "uid {} state overridden to {}",
            uid,
            if active { "active" } else { "idle" }
        ));
        if self.activity.set_override(uid, active) {
            self.block_uid(uid);
        }
    }

    pub fn reset_uid_state(&self, uid: u32) {
        self.events.policy(&format!("uid {} state override reset", uid));
        if self.activity.reset_override(uid) {
            self.block_uid(uid);
        }
    }

    pub fn set_sensor_privacy(&self, enabled: bool) {
        self.service.lock().sensor_privacy = enabled;
        self.events.policy(&format!(
            "sensor privacy {}",
            if enabled { "enabled" } else { "disabled" }
        ));
        if enabled {
            self.disconnect_where(
                |s| !s.client().trusted,
                &DisconnectReason::Blocked(BlockReason::SensorPrivacy),
            );
        }
    }

    pub fn sensor_privacy(&self) -> bool {
        self.service.lock().sensor_privacy
    }

    /// Restrict camera use to the given users and disconnect sessions of
    /// any other user.
    pub fn set_allowed_users<I>(&self, users: I)
    where
        I: IntoIterator<Item = u32>,
    {
        let users: BTreeSet<u32> = users.into_iter().collect();
        self.events.policy(&format!("allowed users {:?}", users));
        self.service.lock().allowed_users = Some(users.clone());
        self.disconnect_where(
            |s| !s.client().trusted && !users.contains(&s.client().user_id()),
            &DisconnectReason::Blocked(BlockReason::UserNotAllowed),
        );
    }

    pub fn rotate_and_crop_override(&self) -> u8 {
        self.service.lock().rotate_and_crop
    }

    /// Apply a rotate-and-crop override to every session.
    pub fn set_rotate_and_crop_override(&self, mode: u8) -> Result<(), Error> {
        if mode > ROTATE_AND_CROP_AUTO {
            return Err(Error::IllegalArgument(format!(
                "rotate-and-crop value {} is out of range 0..={}",
                mode, ROTATE_AND_CROP_AUTO
            )));
        }
        self.service.lock().rotate_and_crop = mode;
        self.events.policy(&format!("rotate-and-crop override {}", mode));
        for session in self.online_sessions() {
            session.with_device(|d| {
                if let Err(e) = d.set_rotate_and_crop(mode) {
                    log::warn!(
                        "device {}: unable to apply rotate-and-crop: {}",
                        session.device_id(),
                        e
                    );
                }
            });
        }
        Ok(())
    }

    pub fn camera_mute(&self) -> bool {
        self.service.lock().camera_mute
    }

    /// Mute or unmute every session that supports it.
    pub fn set_camera_mute(&self, muted: bool) {
        self.service.lock().camera_mute = muted;
        self.events
            .policy(&format!("camera mute {}", if muted { "on" } else { "off" }));
        for session in self.online_sessions() {
            session.with_device(|d| {
                if d.supports_camera_mute() {
                    if let Err(e) = d.set_camera_mute(muted) {
                        log::warn!(
                            "device {}: unable to apply camera mute: {}",
                            session.device_id(),
                            e
                        );
                    }
                }
            });
        }
    }

    /// Forward a physical device state change to every backend.
    pub fn notify_device_state(&self, device_state: u64) {
        self.backends.notify_device_state(device_state);
    }

    fn online_sessions(&self) -> Vec<Arc<Session>> {
        self.leases
            .all()
            .iter()
            .filter(|l| !l.key().is_offline())
            .filter_map(|l| l.handle().cloned())
            .collect()
    }

    // Queries

    /// Status of `device_id`. Devices without a record are `NotPresent`.
    pub fn status(&self, device_id: &str) -> DeviceStatus {
        self.tracker
            .status(device_id)
            .unwrap_or(DeviceStatus::NotPresent)
    }

    pub fn torch_status(&self, device_id: &str) -> Option<TorchStatus> {
        self.torch.lock().get(device_id).copied()
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.tracker.snapshot()
    }

    pub fn leases(&self) -> Vec<LeaseSummary> {
        self.leases.summaries()
    }

    /// Session currently holding `key`.
    pub fn session(&self, key: &LeaseKey) -> Option<Arc<Session>> {
        self.leases.get(key).and_then(|l| l.handle().cloned())
    }

    pub fn event_log(&self) -> &EventLog {
        &self.events
    }

    pub fn max_cost(&self) -> i32 {
        self.leases.max_cost()
    }

    pub fn dump_report(&self) -> DumpReport {
        let devices = self
            .tracker
            .records()
            .iter()
            .map(|r| {
                let snap = r.snapshot();
                DeviceReport {
                    status: snap.status,
                    cost: r.cost().cost,
                    conflicting: r.cost().conflicting.iter().cloned().collect(),
                    unavailable_physical_ids: snap.unavailable_physical_ids,
                    torch: self.torch_status(&snap.device_id),
                    backend: self.backends.backend_of(&snap.device_id),
                    device_id: snap.device_id,
                }
            })
            .collect();
        let listeners = self
            .listeners
            .describe()
            .into_iter()
            .map(|(id, owner, privileged, open_close_events)| ListenerReport {
                id,
                owner,
                privileged,
                open_close_events,
            })
            .collect();
        let service = self.service.lock();
        DumpReport {
            leases: self.leases.summaries(),
            devices,
            backends: self.backends.summaries(),
            listeners,
            rotate_and_crop: service.rotate_and_crop,
            camera_mute: service.camera_mute,
            sensor_privacy: service.sensor_privacy,
            allowed_users: service
                .allowed_users
                .as_ref()
                .map(|u| u.iter().copied().collect()),
            events: self.events.entries(),
        }
    }

    /// Human-readable dump of the broker state and event log.
    pub fn dump(&self) -> String {
        let report = self.dump_report();
        let mut out = String::from("== Camera broker state ==\n");
        let _ = writeln!(out, "Max cost: {}", self.leases.max_cost());
        let _ = writeln!(out, "Devices:");
        if report.devices.is_empty() {
            let _ = writeln!(out, "  [no devices]");
        }
        for d in &report.devices {
            let _ = write!(
                out,
                "  {}: {}, cost {}, conflicts {{{}}}",
                d.device_id,
                d.status,
                d.cost,
                d.conflicting.join(", ")
            );
            if let Some(torch) = d.torch {
                let _ = write!(out, ", torch {}", torch);
            }
            if !d.unavailable_physical_ids.is_empty() {
                let _ = write!(
                    out,
                    ", unavailable physical {{{}}}",
                    d.unavailable_physical_ids.join(", ")
                );
            }
            if let Some(backend) = d.backend.as_ref() {
                let _ = write!(out, ", backend {}", backend);
            }
            out.push('\n');
        }
        let _ = writeln!(out, "Active leases:");
        for line in self.leases.to_string().lines() {
            let _ = writeln!(out, "  {}", line);
        }
        let _ = writeln!(out, "Backends:");
        for b in &report.backends {
            let _ = writeln!(
                out,
                "  {} ({}, generation {}{}): {}",
                b.instance,
                b.name,
                b.generation,
                if b.initialized { "" } else { ", waiting" },
                b.devices.join(", ")
            );
        }
        let _ = writeln!(out, "Listeners: {}", report.listeners.len());
        let _ = writeln!(
            out,
            "Overrides: rotate-and-crop {}, camera mute {}, sensor privacy {}",
            report.rotate_and_crop,
            if report.camera_mute { "on" } else { "off" },
            if report.sensor_privacy { "on" } else { "off" }
        );
        out.push_str(&self.events.dump());
        out
    }

    fn write_snapshot(&self) {
        if self.snapshot.path().is_none() {
            return;
        }
        if let Err(e) = self.snapshot.write(&self.dump()) {
            log::warn!("unable to write diagnostic snapshot: {}", e);
        }
    }

    /// Refuse new connects and disconnect every session.
    pub(crate) fn shutdown(&self) {
        {
            let mut service = self.service.lock();
            if service.shut_down {
                return;
            }
            service.shut_down = true;
        }
        let count = self.disconnect_where(|_| true, &DisconnectReason::Shutdown);
        log::info!("supervisor shut down, {} sessions closed", count);
    }
}

impl DeviceEventListener for ConnectionSupervisor {
    fn on_device_status_changed(&self, device_id: &str, status: DeviceStatus) {
        match status {
            DeviceStatus::NotPresent => self.remove_device(device_id),
            DeviceStatus::Unknown => {
                if self
                    .tracker
                    .report_error(device_id, self.status_callback())
                    .is_accepted()
                {
                    log::warn!("device {} reported an error", device_id);
                }
            }
            _ => {
                if !self.tracker.contains(device_id) && !self.add_device(device_id) {
                    return;
                }
                // A held device stays NotAvailable until its session closes.
                let guard: &[DeviceStatus] = if status == DeviceStatus::Present {
                    &[DeviceStatus::NotAvailable]
                } else {
                    &[]
                };
                self.tracker
                    .update_status(device_id, status, guard, self.status_callback());
            }
        }
    }

    fn on_physical_device_status_changed(
        &self,
        device_id: &str,
        physical_id: &str,
        status: DeviceStatus,
    ) {
        let Some(record) = self.tracker.get(device_id) else {
            log::warn!(
                "physical device {} status for unknown device {}",
                physical_id,
                device_id
            );
            return;
        };
        let changed = match status {
            DeviceStatus::NotPresent => record.add_unavailable_physical_id(physical_id),
            DeviceStatus::Present => record.remove_unavailable_physical_id(physical_id),
            other => {
                log::warn!(
                    "unsupported status {} for physical device {} of {}",
                    other,
                    physical_id,
                    device_id
                );
                return;
            }
        };
        if changed {
            self.events
                .device_status(device_id, &format!("physical {} {}", physical_id, status));
            self.listeners
                .for_each(|l| l.on_physical_status_changed(device_id, physical_id, status));
        }
    }

    fn on_torch_status_changed(&self, device_id: &str, status: TorchStatus) {
        let known = {
            let mut map = self.torch.lock();
            match map.get_mut(device_id) {
                Some(current) => {
                    *current = status;
                    true
                }
                None => false,
            }
        };
        if known {
            self.listeners
                .for_each(|l| l.on_torch_status_changed(device_id, status));
        } else {
            log::debug!("torch status {} for device {} without a flash unit", status, device_id);
        }
    }

    fn on_new_backend_registered(&self, instance: &str) {
        self.events.backend(instance, "added");
        for device_id in self.backends.device_ids() {
            if self.tracker.contains(&device_id) || !self.add_device(&device_id) {
                continue;
            }
            self.tracker.update_status(
                &device_id,
                DeviceStatus::Present,
                &[],
                self.status_callback(),
            );
        }
    }

    fn on_backend_removed(&self, instance: &str) {
        self.events.backend(instance, "removed");
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("leases", &self.leases)
            .field("service", &*self.service.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_times_out_while_held() {
        let gate = ConnectGate::new();
        let permit = gate.acquire(Duration::from_millis(10));
        assert!(permit.is_some());
        assert!(gate.acquire(Duration::from_millis(20)).is_none());
        drop(permit);
        assert!(gate.acquire(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_gate_hands_over_to_waiter() {
        let gate = Arc::new(ConnectGate::new());
        let permit = gate.acquire(Duration::ZERO);
        assert!(permit.is_some());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.acquire(Duration::from_secs(5)).is_some())
        };
        thread::sleep(Duration::from_millis(20));
        drop(permit);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_permissive_policy() {
        let policy = PermissivePolicy;
        let app = CallerCredentials::new(1, 10_001, "app");
        assert!(policy.can_use_camera(&app, "0"));
        assert!(!policy.can_observe_open_close(&app));
        assert!(policy.can_observe_open_close(&app.clone().trusted()));
        assert!(policy.can_see_device(&app, "0"));
    }
}
