// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Per-device status tracking.
//!
//! Every device id reported by a backend owns one [`DeviceStatusRecord`]
//! guarded by its own lock. Status changes go through a validated transition
//! function:
//!
//! | From | Allowed targets |
//! |------|-----------------|
//! | `NotPresent` | `Present`, `Enumerating` |
//! | `Unknown` | `NotPresent` |
//! | anything else | anything, `Unknown` only through [`DeviceStatusTracker::report_error`] |
//!
//! A transition to the current status is a no-op. Callers may also pass a
//! guard set: if the current status is in it the transition is dropped. The
//! close path uses this so a device that was unplugged while leased is not
//! flipped back to `Present`.
//!
//! Rejections are internal race outcomes and are only logged.
//!
//! The callback passed with a transition runs exactly once per accepted
//! transition, synchronously, with the record lock still held. It may take
//! the listener lock but must never call back into the supervisor.

use crate::DeviceId;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    NotPresent,
    Present,
    Enumerating,
    NotAvailable,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::NotPresent => "NOT_PRESENT",
            DeviceStatus::Present => "PRESENT",
            DeviceStatus::Enumerating => "ENUMERATING",
            DeviceStatus::NotAvailable => "NOT_AVAILABLE",
            DeviceStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether a device in this status can be opened.
    pub fn is_usable(&self) -> bool {
        matches!(self, DeviceStatus::Present | DeviceStatus::NotAvailable)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a device's flash unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorchStatus {
    NotAvailable,
    AvailableOff,
    AvailableOn,
}

impl TorchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TorchStatus::NotAvailable => "NOT_AVAILABLE",
            TorchStatus::AvailableOff => "AVAILABLE_OFF",
            TorchStatus::AvailableOn => "AVAILABLE_ON",
        }
    }
}

impl fmt::Display for TorchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a status transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed and the callback ran.
    Accepted { from: DeviceStatus },
    /// The device already had the requested status.
    Unchanged,
    /// The transition was invalid or hit the guard set.
    Rejected { current: DeviceStatus },
    /// No record exists for the device.
    UnknownDevice,
}

impl Transition {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Transition::Accepted { .. })
    }
}

/// Static resource declaration of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceCost {
    pub cost: i32,
    pub conflicting: BTreeSet<DeviceId>,
}

impl DeviceCost {
    pub fn new(cost: i32) -> Self {
        DeviceCost {
            cost,
            conflicting: BTreeSet::new(),
        }
    }

    pub fn with_conflicts<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<DeviceId>,
    {
        self.conflicting = ids.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug)]
struct RecordState {
    status: DeviceStatus,
    unavailable_physical: BTreeSet<DeviceId>,
    shim_params: Option<Vec<u8>>,
}

/// Status record of one device.
#[derive(Debug)]
pub struct DeviceStatusRecord {
    id: DeviceId,
    cost: DeviceCost,
    has_flash_unit: bool,
    state: Mutex<RecordState>,
}

impl DeviceStatusRecord {
    fn new(id: DeviceId, cost: DeviceCost, has_flash_unit: bool) -> Self {
        DeviceStatusRecord {
            id,
            cost,
            has_flash_unit,
            state: Mutex::new(RecordState {
                status: DeviceStatus::NotPresent,
                unavailable_physical: BTreeSet::new(),
                shim_params: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cost(&self) -> &DeviceCost {
        &self.cost
    }

    pub fn has_flash_unit(&self) -> bool {
        self.has_flash_unit
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.lock().status
    }

    /// Request a transition to `status` unless the current status is in `reject`.
    pub fn update_status<F>(
        &self,
        status: DeviceStatus,
        reject: &[DeviceStatus],
        on_accepted: F,
    ) -> Transition
    where
        F: FnOnce(&str, DeviceStatus, DeviceStatus),
    {
        self.transition(status, reject, false, on_accepted)
    }

    fn transition<F>(
        &self,
        status: DeviceStatus,
        reject: &[DeviceStatus],
        from_backend_error: bool,
        on_accepted: F,
    ) -> Transition
    where
        F: FnOnce(&str, DeviceStatus, DeviceStatus),
    {
        let mut state = self.state.lock();
        let current = state.status;

        if current == status {
            return Transition::Unchanged;
        }

        let valid = match (current, status) {
            (DeviceStatus::NotPresent, DeviceStatus::Present | DeviceStatus::Enumerating) => true,
            (DeviceStatus::NotPresent, _) => false,
            (DeviceStatus::Unknown, target) => target == DeviceStatus::NotPresent,
            (_, DeviceStatus::Unknown) => from_backend_error,
            _ => true,
        };
        if !valid {
            log::trace!(
                "device {}: invalid transition {} -> {} ignored",
                self.id,
                current,
                status
            );
            return Transition::Rejected { current };
        }
        if reject.contains(&current) {
            log::trace!(
                "device {}: transition {} -> {} rejected while {}",
                self.id,
                current,
                status,
                current
            );
            return Transition::Rejected { current };
        }

        state.status = status;
        log::debug!("device {}: status {} -> {}", self.id, current, status);
        on_accepted(&self.id, current, status);
        Transition::Accepted { from: current }
    }

    /// Mark a physical sub-device unavailable. Returns false if it already was.
    pub fn add_unavailable_physical_id(&self, physical_id: &str) -> bool {
        self.state
            .lock()
            .unavailable_physical
            .insert(physical_id.to_string())
    }

    /// Mark a physical sub-device available again. Returns false if it already was.
    pub fn remove_unavailable_physical_id(&self, physical_id: &str) -> bool {
        self.state.lock().unavailable_physical.remove(physical_id)
    }

    pub fn unavailable_physical_ids(&self) -> Vec<DeviceId> {
        self.state
            .lock()
            .unavailable_physical
            .iter()
            .cloned()
            .collect()
    }

    pub fn set_shim_params(&self, params: Option<Vec<u8>>) {
        self.state.lock().shim_params = params;
    }

    pub fn shim_params(&self) -> Option<Vec<u8>> {
        self.state.lock().shim_params.clone()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let state = self.state.lock();
        DeviceSnapshot {
            device_id: self.id.clone(),
            status: state.status,
            unavailable_physical_ids: state.unavailable_physical.iter().cloned().collect(),
        }
    }
}

/// Point-in-time view of a device, as handed to new listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub status: DeviceStatus,
    pub unavailable_physical_ids: Vec<DeviceId>,
}

/// All device status records, keyed by id.
#[derive(Debug, Default)]
pub struct DeviceStatusTracker {
    records: Mutex<BTreeMap<DeviceId, Arc<DeviceStatusRecord>>>,
}

impl DeviceStatusTracker {
    pub fn new() -> Self {
        DeviceStatusTracker::default()
    }

    /// Create the record for `id` in `NotPresent`, or return the existing one.
    pub fn add_device(
        &self,
        id: &str,
        cost: DeviceCost,
        has_flash_unit: bool,
    ) -> Arc<DeviceStatusRecord> {
        let mut records = self.records.lock();
        records
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(DeviceStatusRecord::new(id.to_string(), cost, has_flash_unit))
            })
            .clone()
    }

    pub fn remove_device(&self, id: &str) -> Option<Arc<DeviceStatusRecord>> {
        self.records.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<DeviceStatusRecord>> {
        self.records.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.lock().contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<DeviceStatus> {
        self.get(id).map(|r| r.status())
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.records.lock().keys().cloned().collect()
    }

    pub fn records(&self) -> Vec<Arc<DeviceStatusRecord>> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Transition `id` to `status`. Only the per-record lock is held while
    /// `on_accepted` runs.
    pub fn update_status<F>(
        &self,
        id: &str,
        status: DeviceStatus,
        reject: &[DeviceStatus],
        on_accepted: F,
    ) -> Transition
    where
        F: FnOnce(&str, DeviceStatus, DeviceStatus),
    {
        match self.get(id) {
            Some(record) => record.update_status(status, reject, on_accepted),
            None => {
                log::debug!("status update for unknown device {} ignored", id);
                Transition::UnknownDevice
            }
        }
    }

    /// Move `id` to `Unknown` after the backend reported an error for it.
    pub fn report_error<F>(&self, id: &str, on_accepted: F) -> Transition
    where
        F: FnOnce(&str, DeviceStatus, DeviceStatus),
    {
        match self.get(id) {
            Some(record) => record.transition(DeviceStatus::Unknown, &[], true, on_accepted),
            None => Transition::UnknownDevice,
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.records().iter().map(|r| r.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn tracker_with(id: &str, status: DeviceStatus) -> DeviceStatusTracker {
        let tracker = DeviceStatusTracker::new();
        tracker.add_device(id, DeviceCost::new(100), false);
        if status != DeviceStatus::NotPresent {
            let _ = tracker.update_status(id, DeviceStatus::Present, &[], |_, _, _| {});
            let _ = tracker.update_status(id, status, &[], |_, _, _| {});
        }
        tracker
    }

    #[test]
    fn test_new_record_is_not_present() {
        let tracker = DeviceStatusTracker::new();
        let rec = tracker.add_device("0", DeviceCost::new(100), true);
        assert_eq!(rec.status(), DeviceStatus::NotPresent);
        assert!(rec.has_flash_unit());
        // Adding again returns the same record.
        let again = tracker.add_device("0", DeviceCost::new(1), false);
        assert!(Arc::ptr_eq(&rec, &again));
    }

    #[test]
    fn test_not_present_to_not_available_rejected() {
        let tracker = tracker_with("0", DeviceStatus::NotPresent);
        let called = Cell::new(false);
        let t = tracker.update_status("0", DeviceStatus::NotAvailable, &[], |_, _, _| {
            called.set(true)
        });
        assert_eq!(
            t,
            Transition::Rejected {
                current: DeviceStatus::NotPresent
            }
        );
        assert!(!called.get());
        assert_eq!(tracker.status("0"), Some(DeviceStatus::NotPresent));
    }

    #[test]
    fn test_self_transition_skips_callback() {
        for status in [
            DeviceStatus::NotPresent,
            DeviceStatus::Present,
            DeviceStatus::NotAvailable,
        ] {
            let tracker = tracker_with("0", status);
            let called = Cell::new(false);
            let t = tracker.update_status("0", status, &[], |_, _, _| called.set(true));
            assert_eq!(t, Transition::Unchanged);
            assert!(!called.get());
        }
    }

    #[test]
    fn test_callback_runs_once_with_from_and_to() {
        let tracker = tracker_with("0", DeviceStatus::Present);
        let calls = Cell::new(0);
        let t = tracker.update_status("0", DeviceStatus::NotAvailable, &[], |id, from, to| {
            assert_eq!(id, "0");
            assert_eq!(from, DeviceStatus::Present);
            assert_eq!(to, DeviceStatus::NotAvailable);
            calls.set(calls.get() + 1);
        });
        assert!(t.is_accepted());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_guard_set_blocks_close_path() {
        let tracker = tracker_with("0", DeviceStatus::NotAvailable);
        tracker.update_status("0", DeviceStatus::NotPresent, &[], |_, _, _| {});

        let guard = [
            DeviceStatus::Present,
            DeviceStatus::Enumerating,
            DeviceStatus::NotPresent,
        ];
        let t = tracker.update_status("0", DeviceStatus::Present, &guard, |_, _, _| {
            panic!("callback must not run")
        });
        assert!(!t.is_accepted());
        assert_eq!(tracker.status("0"), Some(DeviceStatus::NotPresent));
    }

    #[test]
    fn test_unknown_only_via_error_and_only_to_not_present() {
        let tracker = tracker_with("0", DeviceStatus::Present);
        let t = tracker.update_status("0", DeviceStatus::Unknown, &[], |_, _, _| {});
        assert!(!t.is_accepted());

        assert!(tracker.report_error("0", |_, _, _| {}).is_accepted());
        assert_eq!(tracker.status("0"), Some(DeviceStatus::Unknown));

        assert!(!tracker
            .update_status("0", DeviceStatus::Present, &[], |_, _, _| {})
            .is_accepted());
        assert!(tracker
            .update_status("0", DeviceStatus::NotPresent, &[], |_, _, _| {})
            .is_accepted());
    }

    #[test]
    fn test_enumerating_flow() {
        let tracker = DeviceStatusTracker::new();
        tracker.add_device("7", DeviceCost::new(50), false);
        assert!(tracker
            .update_status("7", DeviceStatus::Enumerating, &[], |_, _, _| {})
            .is_accepted());
        assert!(!tracker.status("7").unwrap().is_usable());
        assert!(tracker
            .update_status("7", DeviceStatus::Present, &[], |_, _, _| {})
            .is_accepted());
        assert!(tracker.status("7").unwrap().is_usable());
    }

    #[test]
    fn test_unknown_device() {
        let tracker = DeviceStatusTracker::new();
        assert_eq!(
            tracker.update_status("x", DeviceStatus::Present, &[], |_, _, _| {}),
            Transition::UnknownDevice
        );
        assert_eq!(tracker.status("x"), None);
    }

    #[test]
    fn test_physical_ids_are_idempotent() {
        let tracker = tracker_with("0", DeviceStatus::Present);
        let rec = tracker.get("0").unwrap();
        assert!(rec.add_unavailable_physical_id("2"));
        assert!(!rec.add_unavailable_physical_id("2"));
        assert_eq!(rec.unavailable_physical_ids(), vec!["2".to_string()]);
        assert!(rec.remove_unavailable_physical_id("2"));
        assert!(!rec.remove_unavailable_physical_id("2"));
        assert_eq!(rec.status(), DeviceStatus::Present);
    }

    #[test]
    fn test_snapshot_and_shim_params() {
        let tracker = tracker_with("1", DeviceStatus::Present);
        let rec = tracker.get("1").unwrap();
        rec.set_shim_params(Some(b"preview-size=640x480".to_vec()));
        rec.add_unavailable_physical_id("1a");

        let snap = tracker.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].status, DeviceStatus::Present);
        assert_eq!(snap[0].unavailable_physical_ids, vec!["1a".to_string()]);
        assert_eq!(rec.shim_params().as_deref(), Some(&b"preview-size=640x480"[..]));
    }
}
