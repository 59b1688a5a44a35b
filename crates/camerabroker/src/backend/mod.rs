// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Hardware backends and the hot-plug backend registry.
//!
//! A backend is a pluggable module that enumerates devices and opens device
//! sessions. Backends are found through a [`BackendDirectory`], which lists
//! the backend names present at startup and pushes a notification whenever a
//! backend (re)registers.
//!
//! # Event delivery
//!
//! Each backend instance gets its own [`BackendEventSink`], backed by a
//! bounded channel and a dedicated drain thread, so events of one backend are
//! applied strictly in order and no backend call is ever made while a broker
//! lock is held. Events sent before the instance finished initializing are
//! cached and replayed once it has, so the status a backend reports from
//! inside [`CameraBackend::set_callback`] is never lost.
//!
//! # Example
//!
//! ```no_run
//! use camerabroker::backend::{VirtualBackend, VirtualDevice};
//! use camerabroker::DeviceStatus;
//!
//! let backend = VirtualBackend::new("usb");
//! backend.plug(VirtualDevice::new("10").with_cost(50).with_flash(true));
//! backend.set_device_status("10", DeviceStatus::NotPresent);
//! ```

mod registry;
mod virtual_backend;

pub use registry::{BackendRegistry, BackendSummary, Registration, RegistrationNotifier};
pub use virtual_backend::{CloseGate, VirtualBackend, VirtualDevice, VirtualDirectory};

use crate::status::{DeviceCost, DeviceStatus, TorchStatus};
use crate::{DeviceId, Error};
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Interface of a hardware backend.
pub trait CameraBackend: Send + Sync {
    /// Install the sink the backend reports events to. The backend may
    /// report events from inside this call.
    fn set_callback(&self, sink: BackendEventSink) -> Result<(), Error>;

    fn enumerate_devices(&self) -> Result<Vec<DeviceId>, Error>;

    fn static_cost(&self, device_id: &str) -> Result<DeviceCost, Error>;

    fn has_flash_unit(&self, _device_id: &str) -> bool {
        false
    }

    /// Physical sub-devices of a logical device.
    fn physical_device_ids(&self, _device_id: &str) -> Vec<DeviceId> {
        Vec::new()
    }

    fn open_session(
        &self,
        device_id: &str,
        callback: Arc<dyn SessionCallback>,
    ) -> Result<Box<dyn DeviceSession>, Error>;

    /// The physical device state (fold state and similar) changed.
    fn notify_device_state(&self, _state: u64) {}
}

/// Events a device session reports back to the broker.
pub trait SessionCallback: Send + Sync {
    fn on_device_error(&self, device_id: &str, message: &str);
}

/// An open device session, owned by the broker's client session.
pub trait DeviceSession: Send + Sync {
    /// Close the session. May block until in-flight work is drained.
    fn close(&self);

    fn supports_camera_mute(&self) -> bool {
        false
    }

    fn set_camera_mute(&self, _muted: bool) -> Result<(), Error> {
        Err(Error::InvalidOperation(
            "camera mute is not supported by this device".to_string(),
        ))
    }

    fn set_rotate_and_crop(&self, _mode: u8) -> Result<(), Error> {
        Ok(())
    }

    /// Parameters of a legacy session, cached on the device record.
    fn legacy_parameters(&self) -> Option<Vec<u8>> {
        None
    }

    /// Hand the in-flight work of this session to a new offline session.
    fn switch_to_offline(&self) -> Result<Box<dyn DeviceSession>, Error> {
        Err(Error::InvalidOperation(
            "offline processing is not supported by this device".to_string(),
        ))
    }
}

/// Locates backends by name.
pub trait BackendDirectory: Send + Sync {
    /// Names of the backends currently declared.
    fn list(&self) -> Vec<String>;

    /// The backend's interface, if it is running. Does not wait.
    fn try_get(&self, name: &str) -> Option<Arc<dyn CameraBackend>>;

    /// Subscribe to backend registration notifications.
    fn register_for_notifications(&self, notifier: RegistrationNotifier) -> Result<(), Error>;
}

/// Event reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    DeviceStatus {
        device_id: DeviceId,
        status: DeviceStatus,
    },
    PhysicalDeviceStatus {
        device_id: DeviceId,
        physical_id: DeviceId,
        status: DeviceStatus,
    },
    TorchStatus {
        device_id: DeviceId,
        status: TorchStatus,
    },
    /// The backend instance is gone.
    Died,
}

pub(crate) enum Envelope {
    Event(BackendEvent),
    Flush(Sender<()>),
}

// How long a producer waits on a full queue before re-checking for removal.
const SEND_RETRY: Duration = Duration::from_millis(50);

#[derive(Default)]
struct SinkState {
    initialized: bool,
    cached: Vec<BackendEvent>,
    tx: Option<Sender<Envelope>>,
    drain: Option<ThreadId>,
    // Events the drain thread reported to itself from inside a backend call.
    reentrant: Vec<BackendEvent>,
}

struct SinkShared {
    closed: AtomicBool,
    state: Mutex<SinkState>,
}

/// Where a backend instance sends its events.
///
/// The sink lock is only held to pick the route of an event; a producer
/// waiting on a full queue holds nothing, and gives up once the instance
/// is removed.
#[derive(Clone)]
pub struct BackendEventSink {
    instance: Arc<str>,
    shared: Arc<SinkShared>,
}

impl BackendEventSink {
    pub(crate) fn new(instance: &str) -> Self {
        BackendEventSink {
            instance: Arc::from(instance),
            shared: Arc::new(SinkShared {
                closed: AtomicBool::new(false),
                state: Mutex::new(SinkState::default()),
            }),
        }
    }

    /// Instance name this sink belongs to.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Queue `event`. Returns false if the instance is already gone.
    pub fn send(&self, event: BackendEvent) -> bool {
        let tx = {
            let mut state = self.shared.state.lock();
            if self.is_closed() {
                log::debug!("{}: dropping {:?} after removal", self.instance, event);
                return false;
            }
            if !state.initialized {
                log::trace!("{}: caching {:?} until initialized", self.instance, event);
                state.cached.push(event);
                return true;
            }
            if state.drain == Some(thread::current().id()) {
                // The drain thread must never wait on its own queue.
                state.reentrant.push(event);
                return true;
            }
            match state.tx.clone() {
                Some(tx) => tx,
                None => return false,
            }
        };

        let mut envelope = Envelope::Event(event);
        loop {
            match tx.send_timeout(envelope, SEND_RETRY) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.is_closed() {
                        log::debug!("{}: dropping queued event after removal", self.instance);
                        return false;
                    }
                    envelope = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    pub fn device_status_changed(&self, device_id: &str, status: DeviceStatus) -> bool {
        self.send(BackendEvent::DeviceStatus {
            device_id: device_id.to_string(),
            status,
        })
    }

    pub fn physical_device_status_changed(
        &self,
        device_id: &str,
        physical_id: &str,
        status: DeviceStatus,
    ) -> bool {
        self.send(BackendEvent::PhysicalDeviceStatus {
            device_id: device_id.to_string(),
            physical_id: physical_id.to_string(),
            status,
        })
    }

    pub fn torch_status_changed(&self, device_id: &str, status: TorchStatus) -> bool {
        self.send(BackendEvent::TorchStatus {
            device_id: device_id.to_string(),
            status,
        })
    }

    /// Report that the backend instance died.
    pub fn died(&self) -> bool {
        self.send(BackendEvent::Died)
    }

    /// Start delivering: replay the cache into a fresh queue of `depth`
    /// slots beyond the replay, and forward from now on.
    pub(crate) fn open(&self, depth: usize) -> Receiver<Envelope> {
        let mut state = self.shared.state.lock();
        let cached = std::mem::take(&mut state.cached);
        let (tx, rx) = channel::bounded(depth.max(1) + cached.len());
        if self.is_closed() {
            return rx;
        }
        if !cached.is_empty() {
            log::debug!(
                "{}: replaying {} events cached during initialization",
                self.instance,
                cached.len()
            );
        }
        for event in cached {
            // The queue was sized for the replay, so this never waits.
            if tx.try_send(Envelope::Event(event)).is_err() {
                break;
            }
        }
        state.tx = Some(tx);
        state.initialized = true;
        rx
    }

    /// Mark the calling thread as the one draining this sink.
    pub(crate) fn attach_drain(&self) {
        self.shared.state.lock().drain = Some(thread::current().id());
    }

    /// Events the drain thread sent to itself, in order.
    pub(crate) fn take_reentrant(&self) -> Vec<BackendEvent> {
        std::mem::take(&mut self.shared.state.lock().reentrant)
    }

    /// Stop delivering. Dropping the sender lets the drain thread exit once
    /// producers still holding a clone have given up.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let mut state = self.shared.state.lock();
        state.cached.clear();
        state.reentrant.clear();
        state.tx = None;
    }

    pub(crate) fn flush_sender(&self) -> Option<Sender<Envelope>> {
        self.shared.state.lock().tx.clone()
    }

    pub(crate) fn same_as(&self, other: &BackendEventSink) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for BackendEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BackendEventSink")
            .field("instance", &self.instance)
            .field("initialized", &state.initialized)
            .field("closed", &self.is_closed())
            .field("cached", &state.cached.len())
            .finish()
    }
}

/// Receiver of device events after the backend registry has applied them.
pub trait DeviceEventListener: Send + Sync {
    fn on_device_status_changed(&self, device_id: &str, status: DeviceStatus);

    fn on_physical_device_status_changed(
        &self,
        device_id: &str,
        physical_id: &str,
        status: DeviceStatus,
    );

    fn on_torch_status_changed(&self, device_id: &str, status: TorchStatus);

    /// A backend finished initializing; its devices can be enumerated.
    fn on_new_backend_registered(&self, instance: &str);

    /// A backend instance is gone. Its devices were already reported
    /// `NotPresent`.
    fn on_backend_removed(&self, instance: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(rx: &Receiver<Envelope>) -> Vec<BackendEvent> {
        rx.try_iter()
            .filter_map(|e| match e {
                Envelope::Event(ev) => Some(ev),
                Envelope::Flush(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_sink_caches_until_open() {
        let sink = BackendEventSink::new("virtual-1");
        assert!(sink.device_status_changed("0", DeviceStatus::Present));
        assert!(sink.torch_status_changed("0", TorchStatus::AvailableOff));

        let rx = sink.open(1);
        assert!(sink.device_status_changed("1", DeviceStatus::Present));

        let received = received(&rx);
        assert_eq!(received.len(), 3);
        assert_eq!(
            received[0],
            BackendEvent::DeviceStatus {
                device_id: "0".into(),
                status: DeviceStatus::Present
            }
        );
        assert_eq!(
            received[2],
            BackendEvent::DeviceStatus {
                device_id: "1".into(),
                status: DeviceStatus::Present
            }
        );
    }

    #[test]
    fn test_closed_sink_drops_events() {
        let sink = BackendEventSink::new("virtual-1");
        let rx = sink.open(8);
        sink.close();
        assert!(sink.is_closed());
        assert!(!sink.died());
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.instance(), "virtual-1");
    }

    #[test]
    fn test_close_releases_blocked_producer() {
        let sink = BackendEventSink::new("virtual-1");
        let _rx = sink.open(1);
        assert!(sink.torch_status_changed("0", TorchStatus::AvailableOn));

        let producer = {
            let sink = sink.clone();
            thread::spawn(move || sink.torch_status_changed("0", TorchStatus::AvailableOff))
        };
        thread::sleep(Duration::from_millis(100));
        sink.close();
        assert!(!producer.join().unwrap());
    }

    #[test]
    fn test_drain_thread_sends_to_itself_without_waiting() {
        let sink = BackendEventSink::new("virtual-1");
        let rx = sink.open(1);
        assert!(sink.torch_status_changed("0", TorchStatus::AvailableOn));

        sink.attach_drain();
        assert!(sink.device_status_changed("0", DeviceStatus::NotPresent));
        assert!(sink.device_status_changed("0", DeviceStatus::Present));

        assert_eq!(received(&rx).len(), 1);
        assert_eq!(
            sink.take_reentrant(),
            vec![
                BackendEvent::DeviceStatus {
                    device_id: "0".into(),
                    status: DeviceStatus::NotPresent
                },
                BackendEvent::DeviceStatus {
                    device_id: "0".into(),
                    status: DeviceStatus::Present
                },
            ]
        );
        assert!(sink.take_reentrant().is_empty());
    }
}
