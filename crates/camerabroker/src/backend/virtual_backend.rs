// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! In-process virtual camera backend.
//!
//! Devices are plugged and unplugged at runtime and reported through the
//! event sink. Installing a callback replays the status of every device,
//! the way an external camera provider announces cameras it discovered
//! before the broker subscribed. A backend created with
//! [`VirtualBackend::hotplug_only`] leaves its devices out of
//! `enumerate_devices` entirely, so they are only known through those
//! events.

use super::{
    BackendDirectory, BackendEventSink, CameraBackend, DeviceSession, RegistrationNotifier,
    SessionCallback,
};
use crate::status::{DeviceCost, DeviceStatus, TorchStatus};
use crate::{DeviceId, Error};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Description of a virtual device.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    id: DeviceId,
    cost: DeviceCost,
    flash: bool,
    physical_ids: Vec<DeviceId>,
    mute: bool,
}

impl VirtualDevice {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        VirtualDevice {
            id: id.into(),
            cost: DeviceCost::new(100),
            flash: false,
            physical_ids: Vec::new(),
            mute: true,
        }
    }

    pub fn with_cost(mut self, cost: i32) -> Self {
        self.cost.cost = cost;
        self
    }

    pub fn with_conflicts<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DeviceId>,
    {
        self.cost = self.cost.with_conflicts(ids);
        self
    }

    pub fn with_flash(mut self, flash: bool) -> Self {
        self.flash = flash;
        self
    }

    pub fn with_physical_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DeviceId>,
    {
        self.physical_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mute_support(mut self, supported: bool) -> Self {
        self.mute = supported;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Blocks session closes while held shut.
#[derive(Debug, Default)]
pub struct CloseGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl CloseGate {
    /// Let blocked and future closes proceed.
    pub fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

#[derive(Default)]
struct VirtualState {
    devices: BTreeMap<DeviceId, (VirtualDevice, DeviceStatus)>,
    sink: Option<BackendEventSink>,
    open: HashMap<DeviceId, usize>,
    opens: usize,
    closes: usize,
    close_gate: Option<Arc<CloseGate>>,
    fail_open: bool,
    muted: HashMap<DeviceId, bool>,
    rotate_and_crop: HashMap<DeviceId, u8>,
}

struct Shared {
    name: String,
    listed: bool,
    state: Mutex<VirtualState>,
}

/// A software camera backend.
pub struct VirtualBackend {
    shared: Arc<Shared>,
}

impl VirtualBackend {
    /// Backend whose devices are listed by `enumerate_devices`.
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, true)
    }

    /// Backend that reports its devices only through status events.
    pub fn hotplug_only(name: &str) -> Arc<Self> {
        Self::build(name, false)
    }

    fn build(name: &str, listed: bool) -> Arc<Self> {
        Arc::new(VirtualBackend {
            shared: Arc::new(Shared {
                name: name.to_string(),
                listed,
                state: Mutex::new(VirtualState::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Attach `device` and report it `Present`.
    pub fn plug(&self, device: VirtualDevice) {
        let id = device.id.clone();
        let sink = {
            let mut state = self.shared.state.lock();
            state
                .devices
                .insert(id.clone(), (device, DeviceStatus::Present));
            state.sink.clone()
        };
        log::debug!("{}: plugged device {}", self.shared.name, id);
        if let Some(sink) = sink {
            sink.device_status_changed(&id, DeviceStatus::Present);
        }
    }

    /// Detach device `id` and report it `NotPresent`.
    pub fn unplug(&self, id: &str) {
        let sink = {
            let mut state = self.shared.state.lock();
            if state.devices.remove(id).is_none() {
                log::warn!("{}: cannot find device {}", self.shared.name, id);
                return;
            }
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.device_status_changed(id, DeviceStatus::NotPresent);
        }
    }

    /// Report an arbitrary status for a plugged device.
    pub fn set_device_status(&self, id: &str, status: DeviceStatus) {
        let sink = {
            let mut state = self.shared.state.lock();
            match state.devices.get_mut(id) {
                Some(entry) => entry.1 = status,
                None => return,
            }
            state.sink.clone()
        };
        if let Some(sink) = sink {
            sink.device_status_changed(id, status);
        }
    }

    /// Report a device error, which moves it to `Unknown`.
    pub fn report_error(&self, id: &str) {
        self.set_device_status(id, DeviceStatus::Unknown);
    }

    pub fn set_physical_status(&self, id: &str, physical_id: &str, status: DeviceStatus) {
        if let Some(sink) = self.sink() {
            sink.physical_device_status_changed(id, physical_id, status);
        }
    }

    pub fn set_torch_status(&self, id: &str, status: TorchStatus) {
        if let Some(sink) = self.sink() {
            sink.torch_status_changed(id, status);
        }
    }

    /// Simulate the backend process dying.
    pub fn die(&self) {
        if let Some(sink) = self.sink() {
            log::debug!("{}: dying", self.shared.name);
            sink.died();
        }
    }

    /// Make session closes block until the returned gate is released.
    pub fn stall_closes(&self) -> Arc<CloseGate> {
        let gate = Arc::new(CloseGate::default());
        self.shared.state.lock().close_gate = Some(gate.clone());
        gate
    }

    /// Make subsequent opens fail with an internal error.
    pub fn fail_opens(&self, fail: bool) {
        self.shared.state.lock().fail_open = fail;
    }

    /// Number of sessions opened so far.
    pub fn opens(&self) -> usize {
        self.shared.state.lock().opens
    }

    /// Number of sessions closed so far.
    pub fn closes(&self) -> usize {
        self.shared.state.lock().closes
    }

    /// Number of sessions currently open on `id`.
    pub fn open_sessions(&self, id: &str) -> usize {
        self.shared.state.lock().open.get(id).copied().unwrap_or(0)
    }

    /// Last camera mute setting applied to a session of `id`.
    pub fn muted(&self, id: &str) -> bool {
        self.shared.state.lock().muted.get(id).copied().unwrap_or(false)
    }

    /// Last rotate-and-crop value applied to a session of `id`.
    pub fn rotate_and_crop(&self, id: &str) -> Option<u8> {
        self.shared.state.lock().rotate_and_crop.get(id).copied()
    }

    fn sink(&self) -> Option<BackendEventSink> {
        self.shared.state.lock().sink.clone()
    }

    fn device(&self, id: &str) -> Result<VirtualDevice, Error> {
        self.shared
            .state
            .lock()
            .devices
            .get(id)
            .map(|(d, _)| d.clone())
            .ok_or_else(|| {
                Error::IllegalArgument(format!(
                    "backend {} has no device {}",
                    self.shared.name, id
                ))
            })
    }
}

impl CameraBackend for VirtualBackend {
    fn set_callback(&self, sink: BackendEventSink) -> Result<(), Error> {
        let replay: Vec<(DeviceId, DeviceStatus)> = {
            let mut state = self.shared.state.lock();
            state.sink = Some(sink.clone());
            state
                .devices
                .iter()
                .map(|(id, (_, status))| (id.clone(), *status))
                .collect()
        };
        for (id, status) in replay {
            sink.device_status_changed(&id, status);
        }
        Ok(())
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceId>, Error> {
        if !self.shared.listed {
            return Ok(Vec::new());
        }
        Ok(self.shared.state.lock().devices.keys().cloned().collect())
    }

    fn static_cost(&self, device_id: &str) -> Result<DeviceCost, Error> {
        self.device(device_id).map(|d| d.cost)
    }

    fn has_flash_unit(&self, device_id: &str) -> bool {
        self.device(device_id).map(|d| d.flash).unwrap_or(false)
    }

    fn physical_device_ids(&self, device_id: &str) -> Vec<DeviceId> {
        self.device(device_id)
            .map(|d| d.physical_ids)
            .unwrap_or_default()
    }

    fn open_session(
        &self,
        device_id: &str,
        callback: Arc<dyn SessionCallback>,
    ) -> Result<Box<dyn DeviceSession>, Error> {
        let mut state = self.shared.state.lock();
        if state.fail_open {
            return Err(Error::Internal(format!(
                "backend {} failed to open device {}",
                self.shared.name, device_id
            )));
        }
        let mute = match state.devices.get(device_id) {
            Some((device, status)) if status.is_usable() => device.mute,
            _ => {
                return Err(Error::Disconnected(format!(
                    "device {} is not present on backend {}",
                    device_id, self.shared.name
                )))
            }
        };
        if state.open.get(device_id).copied().unwrap_or(0) > 0 {
            return Err(Error::CameraInUse(format!(
                "device {} is still open on backend {}",
                device_id, self.shared.name
            )));
        }
        *state.open.entry(device_id.to_string()).or_insert(0) += 1;
        state.opens += 1;
        log::debug!("{}: opened device {}", self.shared.name, device_id);
        Ok(Box::new(VirtualSession {
            shared: Arc::clone(&self.shared),
            device_id: device_id.to_string(),
            callback,
            mute_supported: mute,
            muted: AtomicBool::new(false),
            rotate_and_crop: AtomicU8::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}

struct VirtualSession {
    shared: Arc<Shared>,
    device_id: DeviceId,
    callback: Arc<dyn SessionCallback>,
    mute_supported: bool,
    muted: AtomicBool,
    rotate_and_crop: AtomicU8,
    closed: AtomicBool,
}

impl DeviceSession for VirtualSession {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let gate = self.shared.state.lock().close_gate.clone();
        if let Some(gate) = gate {
            log::debug!("{}: close of {} stalled", self.shared.name, self.device_id);
            gate.wait();
        }
        let mut state = self.shared.state.lock();
        if let Some(n) = state.open.get_mut(&self.device_id) {
            *n = n.saturating_sub(1);
        }
        state.closes += 1;
        log::debug!("{}: closed device {}", self.shared.name, self.device_id);
    }

    fn supports_camera_mute(&self) -> bool {
        self.mute_supported
    }

    fn set_camera_mute(&self, muted: bool) -> Result<(), Error> {
        if !self.mute_supported {
            return Err(Error::InvalidOperation(format!(
                "device {} does not support camera mute",
                self.device_id
            )));
        }
        self.muted.store(muted, Ordering::SeqCst);
        self.shared
            .state
            .lock()
            .muted
            .insert(self.device_id.clone(), muted);
        Ok(())
    }

    fn set_rotate_and_crop(&self, mode: u8) -> Result<(), Error> {
        self.rotate_and_crop.store(mode, Ordering::SeqCst);
        self.shared
            .state
            .lock()
            .rotate_and_crop
            .insert(self.device_id.clone(), mode);
        Ok(())
    }

    fn legacy_parameters(&self) -> Option<Vec<u8>> {
        let params = format!(
            "device={};rotate-and-crop={};mute={}",
            self.device_id,
            self.rotate_and_crop.load(Ordering::SeqCst),
            self.muted.load(Ordering::SeqCst)
        );
        Some(params.into_bytes())
    }

    fn switch_to_offline(&self) -> Result<Box<dyn DeviceSession>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            self.callback
                .on_device_error(&self.device_id, "offline switch on a closed session");
            return Err(Error::InvalidOperation(format!(
                "session of device {} is already closed",
                self.device_id
            )));
        }
        Ok(Box::new(OfflineSession {
            device_id: self.device_id.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct OfflineSession {
    device_id: DeviceId,
    closed: AtomicBool,
}

impl DeviceSession for OfflineSession {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("offline session of device {} closed", self.device_id);
        }
    }
}

struct DirectoryEntry {
    backend: Option<Arc<VirtualBackend>>,
}

#[derive(Default)]
struct DirectoryState {
    entries: BTreeMap<String, DirectoryEntry>,
    notifier: Option<RegistrationNotifier>,
}

/// In-process [`BackendDirectory`] for virtual backends.
#[derive(Default)]
pub struct VirtualDirectory {
    state: Mutex<DirectoryState>,
}

impl VirtualDirectory {
    pub fn new() -> Self {
        VirtualDirectory::default()
    }

    /// Declare `backend` running and notify subscribers.
    pub fn publish(&self, backend: Arc<VirtualBackend>) {
        let name = backend.name().to_string();
        let notifier = {
            let mut state = self.state.lock();
            state.entries.insert(
                name.clone(),
                DirectoryEntry {
                    backend: Some(backend),
                },
            );
            state.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.backend_registered(&name);
        }
    }

    /// Publish a restarted backend under an existing name. The previous
    /// instance stays bound in the registry until it dies.
    pub fn replace(&self, backend: Arc<VirtualBackend>) {
        self.publish(backend);
    }

    /// Declare `name` without a running backend behind it.
    pub fn advertise(&self, name: &str) {
        self.state
            .lock()
            .entries
            .insert(name.to_string(), DirectoryEntry { backend: None });
    }

    /// Send another registration notification for `name`.
    pub fn announce(&self, name: &str) {
        let notifier = self.state.lock().notifier.clone();
        if let Some(notifier) = notifier {
            notifier.backend_registered(name);
        }
    }

    /// Remove `name` from the directory and let its backend die.
    pub fn withdraw(&self, name: &str) {
        let entry = self.state.lock().entries.remove(name);
        if let Some(backend) = entry.and_then(|e| e.backend) {
            backend.die();
        }
    }

    pub fn backend(&self, name: &str) -> Option<Arc<VirtualBackend>> {
        self.state
            .lock()
            .entries
            .get(name)
            .and_then(|e| e.backend.clone())
    }
}

impl BackendDirectory for VirtualDirectory {
    fn list(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    fn try_get(&self, name: &str) -> Option<Arc<dyn CameraBackend>> {
        self.state
            .lock()
            .entries
            .get(name)
            .and_then(|e| e.backend.clone())
            .map(|b| b as Arc<dyn CameraBackend>)
    }

    fn register_for_notifications(&self, notifier: RegistrationNotifier) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.notifier.is_some() {
            return Err(Error::AlreadyExists(
                "backend directory already has a subscriber".to_string(),
            ));
        }
        state.notifier = Some(notifier);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl SessionCallback for Quiet {
        fn on_device_error(&self, _device_id: &str, _message: &str) {}
    }

    #[test]
    fn test_enumeration_and_cost() {
        let backend = VirtualBackend::new("virtual");
        backend.plug(VirtualDevice::new("0").with_cost(70).with_conflicts(["1"]).with_flash(true));
        assert_eq!(backend.enumerate_devices().unwrap(), vec!["0".to_string()]);
        let cost = backend.static_cost("0").unwrap();
        assert_eq!(cost.cost, 70);
        assert!(cost.conflicting.contains("1"));
        assert!(backend.has_flash_unit("0"));
        assert!(matches!(
            backend.static_cost("9"),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_hotplug_only_hides_devices() {
        let backend = VirtualBackend::hotplug_only("external");
        backend.plug(VirtualDevice::new("0"));
        assert!(backend.enumerate_devices().unwrap().is_empty());
    }

    #[test]
    fn test_single_open_per_device() {
        let backend = VirtualBackend::new("virtual");
        backend.plug(VirtualDevice::new("0"));
        let s = backend.open_session("0", Arc::new(Quiet)).unwrap();
        assert!(matches!(
            backend.open_session("0", Arc::new(Quiet)),
            Err(Error::CameraInUse(_))
        ));
        s.close();
        s.close();
        assert_eq!(backend.closes(), 1);
        assert_eq!(backend.open_sessions("0"), 0);
        assert!(backend.open_session("0", Arc::new(Quiet)).is_ok());
    }

    #[test]
    fn test_open_unplugged_device() {
        let backend = VirtualBackend::new("virtual");
        backend.plug(VirtualDevice::new("0"));
        backend.unplug("0");
        assert!(matches!(
            backend.open_session("0", Arc::new(Quiet)),
            Err(Error::Disconnected(_))
        ));
    }

    #[test]
    fn test_mute_support() {
        let backend = VirtualBackend::new("virtual");
        backend.plug(VirtualDevice::new("0").with_mute_support(false));
        let s = backend.open_session("0", Arc::new(Quiet)).unwrap();
        assert!(!s.supports_camera_mute());
        assert!(s.set_camera_mute(true).is_err());
    }

    #[test]
    fn test_directory_lookup() {
        let directory = VirtualDirectory::new();
        directory.advertise("later");
        assert!(directory.try_get("later").is_none());
        directory.publish(VirtualBackend::new("now"));
        assert!(directory.try_get("now").is_some());
        assert_eq!(directory.list(), vec!["later".to_string(), "now".to_string()]);
    }
}
