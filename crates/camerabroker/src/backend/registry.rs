// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use super::{
    BackendDirectory, BackendEvent, BackendEventSink, CameraBackend, DeviceEventListener,
    DeviceSession, Envelope, SessionCallback,
};
use crate::status::{DeviceCost, DeviceStatus};
use crate::{DeviceId, Error};
use crossbeam::channel;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

/// Outcome of a backend registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The backend was bound and its devices enumerated.
    Added { instance: String },
    /// Another instance of the same name is still alive; this generation is
    /// initialized once that one dies.
    Deferred { instance: String },
    /// The backend is declared but not running yet. Retried on its next
    /// registration notification.
    NotRunning,
}

/// Handle a [`BackendDirectory`] uses to push registration notifications.
#[derive(Clone)]
pub struct RegistrationNotifier {
    registry: Weak<BackendRegistry>,
}

impl RegistrationNotifier {
    /// A backend named `name` (re)registered.
    pub fn backend_registered(&self, name: &str) {
        if let Some(registry) = self.registry.upgrade() {
            match registry.add_backend(name, false) {
                Ok(outcome) => log::debug!("registration of {}: {:?}", name, outcome),
                Err(e) => log::warn!("registration of {} failed: {}", name, e),
            }
        }
    }
}

/// Serializable view of a backend instance.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSummary {
    pub instance: String,
    pub name: String,
    pub generation: u32,
    pub initialized: bool,
    pub devices: Vec<DeviceId>,
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    cost: DeviceCost,
    has_flash_unit: bool,
    physical_ids: Vec<DeviceId>,
    status: DeviceStatus,
}

enum Interface {
    Unbound,
    Strong(Arc<dyn CameraBackend>),
    Lazy(Weak<dyn CameraBackend>),
}

struct BackendRecord {
    name: String,
    generation: u32,
    instance: String,
    initialized: bool,
    interface: Interface,
    sink: Option<BackendEventSink>,
    devices: BTreeMap<DeviceId, DeviceEntry>,
}

#[derive(Default)]
struct RegistryState {
    records: Vec<BackendRecord>,
    device_state: u64,
    shut_down: bool,
}

impl RegistryState {
    fn find(&self, instance: &str) -> Option<&BackendRecord> {
        self.records.iter().find(|r| r.instance == instance)
    }

    fn find_mut(&mut self, instance: &str) -> Option<&mut BackendRecord> {
        self.records.iter_mut().find(|r| r.instance == instance)
    }

    fn owner_of(&self, device_id: &str) -> Option<&BackendRecord> {
        self.records
            .iter()
            .find(|r| r.initialized && r.devices.contains_key(device_id))
    }
}

/// Registry of hardware backend instances.
pub struct BackendRegistry {
    self_ref: Weak<BackendRegistry>,
    directory: Arc<dyn BackendDirectory>,
    lazy: bool,
    queue_depth: usize,
    generation: AtomicU32,
    listener: Mutex<Option<Weak<dyn DeviceEventListener>>>,
    state: Mutex<RegistryState>,
    drains: Mutex<Vec<JoinHandle<()>>>,
    // Held shared while an event is applied, so flushes can wait for it.
    in_flight: RwLock<()>,
    applied: AtomicU64,
}

impl BackendRegistry {
    pub fn new(directory: Arc<dyn BackendDirectory>, lazy: bool, queue_depth: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| BackendRegistry {
            self_ref: self_ref.clone(),
            directory,
            lazy,
            queue_depth: queue_depth.max(1),
            generation: AtomicU32::new(0),
            listener: Mutex::new(None),
            state: Mutex::new(RegistryState::default()),
            drains: Mutex::new(Vec::new()),
            in_flight: RwLock::new(()),
            applied: AtomicU64::new(0),
        })
    }

    /// Subscribe to the directory and register every backend it lists.
    pub fn initialize(&self, listener: Weak<dyn DeviceEventListener>) -> Result<(), Error> {
        *self.listener.lock() = Some(listener);
        self.directory.register_for_notifications(RegistrationNotifier {
            registry: self.self_ref.clone(),
        })?;
        for name in self.directory.list() {
            match self.add_backend(&name, true) {
                Ok(_) | Err(Error::AlreadyExists(_)) => {}
                Err(e) => log::warn!("unable to add backend {}: {}", name, e),
            }
        }
        Ok(())
    }

    /// Register the backend `name`.
    ///
    /// `preexisting` marks a backend found by listing the directory rather
    /// than by a fresh registration notification. A preexisting name that
    /// is already known, a name that already has a generation waiting, or a
    /// notification for the very interface already bound reports
    /// [`Error::AlreadyExists`] and changes nothing. Only a notification for
    /// a different interface, a restart, defers a new generation.
    pub fn add_backend(&self, name: &str, preexisting: bool) -> Result<Registration, Error> {
        // Looked up before taking the registry lock; the directory may block
        // on its own lock.
        let current = if preexisting {
            None
        } else {
            self.directory.try_get(name)
        };

        let instance = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(Error::InvalidOperation(format!(
                    "backend {} registered after shutdown",
                    name
                )));
            }
            let same_name: Vec<&BackendRecord> =
                state.records.iter().filter(|r| r.name == name).collect();
            if !same_name.is_empty() {
                let already_bound = match current.as_ref() {
                    Some(iface) => same_name.iter().any(|r| r.is_bound_to(iface)),
                    None => true,
                };
                if preexisting || already_bound || same_name.iter().any(|r| !r.initialized) {
                    log::debug!("backend {} already registered", name);
                    return Err(Error::AlreadyExists(format!(
                        "backend {} is already registered",
                        name
                    )));
                }
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let instance = format!("{}-{}", name, generation);
                log::info!(
                    "backend {} registered while a previous instance is alive, deferring {}",
                    name,
                    instance
                );
                state.records.push(BackendRecord::pending(name, generation, &instance));
                return Ok(Registration::Deferred { instance });
            }
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let instance = format!("{}-{}", name, generation);
            state.records.push(BackendRecord::pending(name, generation, &instance));
            instance
        };

        self.try_initialize(&instance)
    }

    fn try_initialize(&self, instance: &str) -> Result<Registration, Error> {
        let name = match self.state.lock().find(instance) {
            Some(r) => r.name.clone(),
            None => return Err(Error::Internal(format!("backend {} vanished", instance))),
        };

        let Some(interface) = self.directory.try_get(&name) else {
            log::info!("backend {} is declared but not running yet", name);
            self.state.lock().records.retain(|r| r.instance != instance);
            return Ok(Registration::NotRunning);
        };

        match self.bind(instance, &interface) {
            Ok(()) => {
                log::info!("backend {} initialized", instance);
                self.notify(|l| l.on_new_backend_registered(instance));
                Ok(Registration::Added {
                    instance: instance.to_string(),
                })
            }
            Err(e) => {
                log::warn!("unable to initialize backend {}: {}", instance, e);
                let removed = {
                    let mut state = self.state.lock();
                    let idx = state.records.iter().position(|r| r.instance == instance);
                    idx.map(|i| state.records.remove(i))
                };
                if let Some(sink) = removed.and_then(|r| r.sink) {
                    sink.close();
                }
                Err(e)
            }
        }
    }

    /// Set the callback, enumerate devices, and start event delivery.
    fn bind(&self, instance: &str, interface: &Arc<dyn CameraBackend>) -> Result<(), Error> {
        let sink = BackendEventSink::new(instance);
        {
            let mut state = self.state.lock();
            let record = state
                .find_mut(instance)
                .ok_or_else(|| Error::Internal(format!("backend {} vanished", instance)))?;
            record.sink = Some(sink.clone());
        }

        // Events may arrive from inside set_callback; the sink caches them.
        interface.set_callback(sink.clone())?;

        let mut devices = BTreeMap::new();
        for id in interface.enumerate_devices()? {
            let entry = Self::describe(interface.as_ref(), &id, DeviceStatus::Present)?;
            devices.insert(id, entry);
        }

        let device_state = {
            let mut state = self.state.lock();
            let device_state = state.device_state;
            let record = state.find_mut(instance).ok_or_else(|| {
                Error::Disconnected(format!("backend {} died during initialization", instance))
            })?;
            record.devices = devices;
            record.interface = if self.lazy {
                Interface::Lazy(Arc::downgrade(interface))
            } else {
                Interface::Strong(Arc::clone(interface))
            };
            record.initialized = true;
            device_state
        };
        if device_state != 0 {
            interface.notify_device_state(device_state);
        }

        let rx = sink.open(self.queue_depth);
        self.spawn_drain(instance, rx, sink)
    }

    fn describe(
        backend: &dyn CameraBackend,
        id: &str,
        status: DeviceStatus,
    ) -> Result<DeviceEntry, Error> {
        Ok(DeviceEntry {
            cost: backend.static_cost(id)?,
            has_flash_unit: backend.has_flash_unit(id),
            physical_ids: backend.physical_device_ids(id),
            status,
        })
    }

    fn spawn_drain(
        &self,
        instance: &str,
        rx: channel::Receiver<Envelope>,
        sink: BackendEventSink,
    ) -> Result<(), Error> {
        let registry = self.self_ref.clone();
        let owned = instance.to_string();
        let handle = thread::Builder::new()
            .name(format!("backend-{}", instance))
            .spawn(move || {
                sink.attach_drain();
                for envelope in rx.iter() {
                    match envelope {
                        Envelope::Event(event) => match registry.upgrade() {
                            Some(registry) => {
                                let _applying = registry.in_flight.read();
                                registry.handle_event(&owned, event);
                                // Events reported from inside a backend call
                                // made while applying this one.
                                loop {
                                    let reentrant = sink.take_reentrant();
                                    if reentrant.is_empty() {
                                        break;
                                    }
                                    for event in reentrant {
                                        registry.handle_event(&owned, event);
                                    }
                                }
                                registry.applied.fetch_add(1, Ordering::SeqCst);
                            }
                            None => break,
                        },
                        Envelope::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                log::trace!("event drain for {} finished", owned);
            })?;
        self.drains.lock().push(handle);
        Ok(())
    }

    fn handle_event(&self, instance: &str, event: BackendEvent) {
        match event {
            BackendEvent::DeviceStatus { device_id, status } => {
                self.apply_device_status(instance, &device_id, status)
            }
            BackendEvent::PhysicalDeviceStatus {
                device_id,
                physical_id,
                status,
            } => {
                let known = self
                    .state
                    .lock()
                    .find(instance)
                    .and_then(|r| r.devices.get(&device_id))
                    .map(|d| d.physical_ids.contains(&physical_id));
                match known {
                    Some(true) => self.notify(|l| {
                        l.on_physical_device_status_changed(&device_id, &physical_id, status)
                    }),
                    Some(false) => log::warn!(
                        "{}: device {} has no physical device {}",
                        instance,
                        device_id,
                        physical_id
                    ),
                    None => log::warn!(
                        "{}: physical status change for unknown device {}",
                        instance,
                        device_id
                    ),
                }
            }
            BackendEvent::TorchStatus { device_id, status } => {
                let known = self
                    .state
                    .lock()
                    .find(instance)
                    .map_or(false, |r| r.devices.contains_key(&device_id));
                if known {
                    self.notify(|l| l.on_torch_status_changed(&device_id, status));
                } else {
                    log::debug!(
                        "{}: curious, torch status {} for unknown device {}",
                        instance,
                        status,
                        device_id
                    );
                }
            }
            BackendEvent::Died => {
                self.remove_backend(instance);
            }
        }
    }

    fn apply_device_status(&self, instance: &str, device_id: &str, status: DeviceStatus) {
        enum Step {
            Notify,
            Describe,
            Ignore,
        }

        let step = {
            let mut state = self.state.lock();
            let Some(record) = state.find_mut(instance) else {
                return;
            };
            match record.devices.get_mut(device_id) {
                Some(entry) if entry.status == status => Step::Ignore,
                Some(_) if status == DeviceStatus::NotPresent => {
                    record.devices.remove(device_id);
                    Step::Notify
                }
                Some(entry) => {
                    entry.status = status;
                    Step::Notify
                }
                None if status == DeviceStatus::NotPresent => {
                    log::warn!("{}: removal of unknown device {}", instance, device_id);
                    Step::Ignore
                }
                None => Step::Describe,
            }
        };

        match step {
            Step::Ignore => return,
            Step::Notify => {}
            Step::Describe => {
                let Some(interface) = self.interface(instance) else {
                    return;
                };
                let entry = match Self::describe(interface.as_ref(), device_id, status) {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("{}: unable to add device {}: {}", instance, device_id, e);
                        return;
                    }
                };
                let mut state = self.state.lock();
                match state.find_mut(instance) {
                    Some(record) => {
                        record.devices.insert(device_id.to_string(), entry);
                    }
                    None => return,
                }
                log::info!("{}: device {} added", instance, device_id);
            }
        }

        self.notify(|l| l.on_device_status_changed(device_id, status));
    }

    /// Remove a dead backend instance.
    ///
    /// Every device it reported becomes `NotPresent`, then a generation of
    /// the same name that was waiting is initialized. `instance` may also be
    /// a plain backend name, which selects its initialized instance.
    pub fn remove_backend(&self, instance: &str) {
        let (removed, pending) = {
            let mut state = self.state.lock();
            let idx = state
                .records
                .iter()
                .position(|r| r.instance == instance)
                .or_else(|| {
                    state
                        .records
                        .iter()
                        .position(|r| r.name == instance && r.initialized)
                });
            let Some(idx) = idx else {
                log::debug!("removal of unknown backend {}", instance);
                return;
            };
            let removed = state.records.remove(idx);
            let pending = state
                .records
                .iter()
                .find(|r| r.name == removed.name && !r.initialized)
                .map(|r| r.instance.clone());
            (removed, pending)
        };

        if let Some(sink) = removed.sink.as_ref() {
            sink.close();
        }
        log::info!(
            "backend {} removed with {} devices",
            removed.instance,
            removed.devices.len()
        );

        for id in removed.devices.keys() {
            self.notify(|l| l.on_device_status_changed(id, DeviceStatus::NotPresent));
        }
        self.notify(|l| l.on_backend_removed(&removed.instance));

        if let Some(pending) = pending {
            log::info!("initializing waiting generation {}", pending);
            if let Err(e) = self.try_initialize(&pending) {
                log::warn!("waiting generation {} failed: {}", pending, e);
            }
        }
    }

    /// The live interface of `instance`, re-acquired if held lazily.
    fn interface(&self, instance: &str) -> Option<Arc<dyn CameraBackend>> {
        let (name, sink) = {
            let state = self.state.lock();
            let record = state.find(instance)?;
            match &record.interface {
                Interface::Strong(iface) => return Some(Arc::clone(iface)),
                Interface::Lazy(weak) => {
                    if let Some(iface) = weak.upgrade() {
                        return Some(iface);
                    }
                }
                Interface::Unbound => return None,
            }
            (record.name.clone(), record.sink.clone())
        };

        let iface = self.directory.try_get(&name)?;
        log::debug!("re-acquired interface of {}", instance);
        if let Some(sink) = sink {
            if let Err(e) = iface.set_callback(sink) {
                log::warn!("unable to re-register callback of {}: {}", instance, e);
                return None;
            }
        }
        if let Some(record) = self.state.lock().find_mut(instance) {
            record.interface = Interface::Lazy(Arc::downgrade(&iface));
        }
        Some(iface)
    }

    fn device_owner(&self, device_id: &str) -> Result<(String, DeviceEntry), Error> {
        let state = self.state.lock();
        state
            .owner_of(device_id)
            .and_then(|r| {
                r.devices
                    .get(device_id)
                    .map(|d| (r.instance.clone(), d.clone()))
            })
            .ok_or_else(|| {
                Error::IllegalArgument(format!("no backend reports device {}", device_id))
            })
    }

    pub fn device_cost(&self, device_id: &str) -> Result<DeviceCost, Error> {
        self.device_owner(device_id).map(|(_, d)| d.cost)
    }

    pub fn has_flash_unit(&self, device_id: &str) -> bool {
        self.device_owner(device_id)
            .map(|(_, d)| d.has_flash_unit)
            .unwrap_or(false)
    }

    pub fn physical_ids(&self, device_id: &str) -> Vec<DeviceId> {
        self.device_owner(device_id)
            .map(|(_, d)| d.physical_ids)
            .unwrap_or_default()
    }

    /// Every device currently reported by an initialized backend.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .filter(|r| r.initialized)
            .flat_map(|r| r.devices.keys().cloned())
            .collect()
    }

    /// Instance name of the backend owning `device_id`.
    pub fn backend_of(&self, device_id: &str) -> Option<String> {
        self.device_owner(device_id).ok().map(|(i, _)| i)
    }

    /// Open a session on the backend owning `device_id`. No registry lock
    /// is held during the backend call.
    pub fn open_session(
        &self,
        device_id: &str,
        callback: Arc<dyn SessionCallback>,
    ) -> Result<Box<dyn DeviceSession>, Error> {
        let (instance, _) = self
            .device_owner(device_id)
            .map_err(|_| Error::Disconnected(format!("device {} has no backend", device_id)))?;
        let interface = self.interface(&instance).ok_or_else(|| {
            Error::Disconnected(format!(
                "backend {} of device {} is unreachable",
                instance, device_id
            ))
        })?;
        interface.open_session(device_id, callback)
    }

    /// Forward a physical device state change to every backend.
    pub fn notify_device_state(&self, device_state: u64) {
        let instances: Vec<String> = {
            let mut state = self.state.lock();
            state.device_state = device_state;
            state
                .records
                .iter()
                .filter(|r| r.initialized)
                .map(|r| r.instance.clone())
                .collect()
        };
        for instance in instances {
            if let Some(iface) = self.interface(&instance) {
                iface.notify_device_state(device_state);
            }
        }
    }

    /// Wait until every event queued so far, and everything those events
    /// caused (such as a waiting generation replaying its events), has been
    /// applied.
    ///
    /// Must not be called from a listener callback.
    pub fn flush_events(&self) {
        loop {
            let before = self.applied.load(Ordering::SeqCst);
            let senders: Vec<_> = {
                let state = self.state.lock();
                state
                    .records
                    .iter()
                    .filter_map(|r| r.sink.as_ref().and_then(|s| s.flush_sender()))
                    .collect()
            };
            for tx in senders {
                let (ack_tx, ack_rx) = channel::bounded(1);
                if tx.send(Envelope::Flush(ack_tx)).is_ok() {
                    let _ = ack_rx.recv();
                }
            }
            drop(self.in_flight.write());
            if self.applied.load(Ordering::SeqCst) == before {
                break;
            }
        }
    }

    /// Sink of the initialized instance named `name`, used by tests and by
    /// backends that restart their callback.
    pub fn sink_of(&self, name: &str) -> Option<BackendEventSink> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .find(|r| (r.name == name || r.instance == name) && r.initialized)
            .and_then(|r| r.sink.clone())
    }

    pub fn summaries(&self) -> Vec<BackendSummary> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .map(|r| BackendSummary {
                instance: r.instance.clone(),
                name: r.name.clone(),
                generation: r.generation,
                initialized: r.initialized,
                devices: r.devices.keys().cloned().collect(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Stop event delivery and join the drain threads.
    pub fn shutdown(&self) {
        let sinks: Vec<BackendEventSink> = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.records.drain(..).filter_map(|r| r.sink).collect()
        };
        for sink in sinks {
            sink.close();
        }
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.drains.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("backend event drain thread panicked");
            }
        }
    }

    fn notify<F>(&self, f: F)
    where
        F: FnOnce(&dyn DeviceEventListener),
    {
        let listener = self.listener.lock().as_ref().and_then(|w| w.upgrade());
        if let Some(listener) = listener {
            f(listener.as_ref());
        }
    }

    #[cfg(test)]
    fn owns_sink(&self, instance: &str, sink: &BackendEventSink) -> bool {
        self.state
            .lock()
            .find(instance)
            .and_then(|r| r.sink.as_ref())
            .map_or(false, |s| s.same_as(sink))
    }
}

impl BackendRecord {
    fn is_bound_to(&self, iface: &Arc<dyn CameraBackend>) -> bool {
        let bound = match &self.interface {
            Interface::Strong(bound) => Some(Arc::clone(bound)),
            Interface::Lazy(weak) => weak.upgrade(),
            Interface::Unbound => None,
        };
        bound.map_or(false, |bound| same_backend(&bound, iface))
    }

    fn pending(name: &str, generation: u32, instance: &str) -> Self {
        BackendRecord {
            name: name.to_string(),
            generation,
            instance: instance.to_string(),
            initialized: false,
            interface: Interface::Unbound,
            sink: None,
            devices: BTreeMap::new(),
        }
    }
}

// Data pointers only; vtables of one type may differ between codegen units.
fn same_backend(a: &Arc<dyn CameraBackend>, b: &Arc<dyn CameraBackend>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for record in state.records.drain(..) {
            if let Some(sink) = record.sink {
                sink.close();
            }
        }
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("lazy", &self.lazy)
            .field("queue_depth", &self.queue_depth)
            .field("backends", &self.summaries())
            .finish()
    }
}
