// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Status listener fan-out.
//!
//! Listeners are held weakly; an entry whose listener has been dropped is
//! pruned on the next fan-out. Callbacks run with the listener lock held, so
//! a listener must not register or unregister listeners from inside a
//! callback.

use crate::status::{DeviceStatus, TorchStatus};
use crate::Error;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Observer of device status, torch status, and open/close events.
pub trait StatusListener: Send + Sync {
    fn on_status_changed(&self, device_id: &str, status: DeviceStatus);

    fn on_physical_status_changed(
        &self,
        _device_id: &str,
        _physical_id: &str,
        _status: DeviceStatus,
    ) {
    }

    fn on_torch_status_changed(&self, _device_id: &str, _status: TorchStatus) {}

    /// Only delivered to listeners registered for open/close events.
    fn on_device_opened(&self, _device_id: &str, _owner_label: &str) {}

    /// Only delivered to listeners registered for open/close events.
    fn on_device_closed(&self, _device_id: &str) {}

    fn on_access_priorities_changed(&self) {}
}

/// Identifier handed out for each registration.
pub type ListenerId = u64;

struct Registration {
    id: ListenerId,
    addr: usize,
    listener: Weak<dyn StatusListener>,
    owner: i32,
    privileged: bool,
    wants_open_close: bool,
}

/// List of registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

fn addr_of(listener: &Arc<dyn StatusListener>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry::default()
    }

    /// Register `listener`. Registering the same listener twice fails with
    /// [`Error::AlreadyExists`].
    pub fn add(
        &self,
        listener: &Arc<dyn StatusListener>,
        owner: i32,
        privileged: bool,
        wants_open_close: bool,
    ) -> Result<ListenerId, Error> {
        let addr = addr_of(listener);
        let mut entries = self.entries.lock();
        entries.retain(|e| e.listener.strong_count() > 0);
        if entries.iter().any(|e| e.addr == addr) {
            return Err(Error::AlreadyExists(format!(
                "status listener of pid {} is already registered",
                owner
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        entries.push(Registration {
            id,
            addr,
            listener: Arc::downgrade(listener),
            owner,
            privileged,
            wants_open_close,
        });
        log::debug!(
            "added status listener {} for pid {} (open/close events: {})",
            id,
            owner,
            wants_open_close
        );
        Ok(id)
    }

    /// Unregister `listener`. Unknown listeners fail with
    /// [`Error::IllegalArgument`].
    pub fn remove(&self, listener: &Arc<dyn StatusListener>) -> Result<(), Error> {
        let addr = addr_of(listener);
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.addr == addr) {
            Some(idx) => {
                let entry = entries.remove(idx);
                log::debug!("removed status listener {} of pid {}", entry.id, entry.owner);
                Ok(())
            }
            None => Err(Error::IllegalArgument(
                "unregistered status listener was never registered".to_string(),
            )),
        }
    }

    /// Drop a registration after its owner died.
    pub fn remove_by_id(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        before != entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.listener.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` on every live listener.
    pub fn for_each<F>(&self, f: F)
    where
        F: Fn(&dyn StatusListener),
    {
        self.fan_out(|_| true, f);
    }

    /// Call `f` on every live listener registered for open/close events.
    pub fn for_each_open_close<F>(&self, f: F)
    where
        F: Fn(&dyn StatusListener),
    {
        self.fan_out(|e| e.wants_open_close, f);
    }

    fn fan_out<P, F>(&self, filter: P, f: F)
    where
        P: Fn(&Registration) -> bool,
        F: Fn(&dyn StatusListener),
    {
        let mut entries = self.entries.lock();
        entries.retain(|e| {
            let alive = e.listener.strong_count() > 0;
            if !alive {
                log::debug!("pruning dead status listener {} of pid {}", e.id, e.owner);
            }
            alive
        });
        for entry in entries.iter().filter(|e| filter(e)) {
            if let Some(listener) = entry.listener.upgrade() {
                f(listener.as_ref());
            }
        }
    }

    /// Registration summaries for dumps: `(id, owner, privileged, open/close)`.
    pub fn describe(&self) -> Vec<(ListenerId, i32, bool, bool)> {
        self.entries
            .lock()
            .iter()
            .map(|e| (e.id, e.owner, e.privileged, e.wants_open_close))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl StatusListener for Recorder {
        fn on_status_changed(&self, device_id: &str, status: DeviceStatus) {
            self.events.lock().push(format!("{}:{}", device_id, status));
        }

        fn on_device_opened(&self, device_id: &str, owner_label: &str) {
            self.events
                .lock()
                .push(format!("open {} by {}", device_id, owner_label));
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let reg = ListenerRegistry::new();
        let l: Arc<dyn StatusListener> = Arc::new(Recorder::default());
        reg.add(&l, 1, false, false).unwrap();
        assert!(matches!(
            reg.add(&l, 1, false, false),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_illegal_argument() {
        let reg = ListenerRegistry::new();
        let l: Arc<dyn StatusListener> = Arc::new(Recorder::default());
        assert!(matches!(reg.remove(&l), Err(Error::IllegalArgument(_))));
        reg.add(&l, 1, false, false).unwrap();
        reg.remove(&l).unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let reg = ListenerRegistry::new();
        {
            let l: Arc<dyn StatusListener> = Arc::new(Recorder::default());
            reg.add(&l, 1, false, false).unwrap();
        }
        assert_eq!(reg.len(), 0);
        reg.for_each(|_| panic!("no listener should be called"));
        assert!(reg.describe().is_empty());
    }

    #[test]
    fn test_open_close_only_to_subscribers() {
        let reg = ListenerRegistry::new();
        let plain = Arc::new(Recorder::default());
        let privileged = Arc::new(Recorder::default());
        let plain_dyn: Arc<dyn StatusListener> = plain.clone();
        let privileged_dyn: Arc<dyn StatusListener> = privileged.clone();
        reg.add(&plain_dyn, 1, false, false).unwrap();
        reg.add(&privileged_dyn, 2, true, true).unwrap();

        reg.for_each(|l| l.on_status_changed("0", DeviceStatus::Present));
        reg.for_each_open_close(|l| l.on_device_opened("0", "com.example"));

        assert_eq!(*plain.events.lock(), vec!["0:PRESENT".to_string()]);
        assert_eq!(
            *privileged.events.lock(),
            vec!["0:PRESENT".to_string(), "open 0 by com.example".to_string()]
        );
    }

    #[test]
    fn test_remove_by_id() {
        let reg = ListenerRegistry::new();
        let a: Arc<dyn StatusListener> = Arc::new(Recorder::default());
        let b: Arc<dyn StatusListener> = Arc::new(Recorder::default());
        let id = reg.add(&a, 7, false, false).unwrap();
        reg.add(&b, 8, false, false).unwrap();
        assert!(reg.remove_by_id(id));
        assert!(!reg.remove_by_id(id));
        assert_eq!(reg.describe(), vec![(2, 8, false, false)]);
    }
}
