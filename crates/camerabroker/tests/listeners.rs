// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Status listener registration and fan-out.

mod common;

use camerabroker::backend::{VirtualBackend, VirtualDevice, VirtualDirectory};
use camerabroker::context::{ArbitrationContext, Collaborators};
use camerabroker::priority::process_state;
use camerabroker::session::{CallerCredentials, SessionProtocol};
use camerabroker::supervisor::PermissionPolicy;
use camerabroker::{DeviceStatus, Error};
use common::{app, system, test_config, Fixture, RecordingClient, RecordingListener};
use std::sync::Arc;

/// Hides one device from untrusted callers.
struct HiddenDevice(&'static str);

impl PermissionPolicy for HiddenDevice {
    fn can_use_camera(&self, _client: &CallerCredentials, _device_id: &str) -> bool {
        true
    }

    fn can_observe_open_close(&self, caller: &CallerCredentials) -> bool {
        caller.trusted
    }

    fn can_see_device(&self, caller: &CallerCredentials, device_id: &str) -> bool {
        caller.trusted || device_id != self.0
    }
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn test_registration_returns_current_devices() {
    let fx = Fixture::new(vec![VirtualDevice::new("0"), VirtualDevice::new("1")]);
    let sup = fx.ctx.supervisor();
    let _session = sup
        .connect("1", app(1), SessionProtocol::Modern, RecordingClient::new().as_callbacks())
        .unwrap();

    let listener = RecordingListener::new();
    let (_, devices) = sup.add_listener(&listener.as_listener(), &app(50)).unwrap();
    let statuses: Vec<(String, DeviceStatus)> = devices
        .into_iter()
        .map(|d| (d.device_id, d.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("0".to_string(), DeviceStatus::Present),
            ("1".to_string(), DeviceStatus::NotAvailable),
        ]
    );
}

#[test]
fn test_duplicate_and_unknown_registrations() {
    let fx = Fixture::new(vec![VirtualDevice::new("0")]);
    let sup = fx.ctx.supervisor();
    let listener = RecordingListener::new().as_listener();

    sup.add_listener(&listener, &app(50)).unwrap();
    let err = sup.add_listener(&listener, &app(50)).unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)), "{}", err);

    sup.remove_listener(&listener).unwrap();
    let err = sup.remove_listener(&listener).unwrap_err();
    assert!(matches!(err, Error::IllegalArgument(_)), "{}", err);

    // A removed listener may register again.
    assert!(sup.add_listener(&listener, &app(50)).is_ok());
}

#[test]
fn test_dropped_listener_is_pruned() {
    let fx = Fixture::new(vec![VirtualDevice::new("0")]);
    let sup = fx.ctx.supervisor();
    let listener = RecordingListener::new();
    sup.add_listener(&listener.as_listener(), &app(50)).unwrap();
    assert_eq!(sup.dump_report().listeners.len(), 1);

    drop(listener);
    fx.backend.plug(VirtualDevice::new("1"));
    fx.ctx.flush_events();
    assert!(sup.dump_report().listeners.is_empty());
}

#[test]
fn test_listener_death_stops_delivery() {
    let fx = Fixture::new(vec![VirtualDevice::new("0")]);
    let sup = fx.ctx.supervisor();
    let listener = RecordingListener::new();
    let (id, _) = sup.add_listener(&listener.as_listener(), &app(50)).unwrap();

    sup.listener_died(id);
    let session = sup
        .connect("0", app(1), SessionProtocol::Modern, RecordingClient::new().as_callbacks())
        .unwrap();
    session.disconnect();
    assert!(listener.events().is_empty(), "{:?}", listener.events());
}

// =============================================================================
// Fan-out
// =============================================================================

#[test]
fn test_open_close_events_need_privilege() {
    let fx = Fixture::new(vec![VirtualDevice::new("0")]);
    let sup = fx.ctx.supervisor();
    let plain = RecordingListener::new();
    let privileged = RecordingListener::new();
    sup.add_listener(&plain.as_listener(), &app(50)).unwrap();
    sup.add_listener(&privileged.as_listener(), &system(60)).unwrap();

    let session = sup
        .connect("0", app(1), SessionProtocol::Modern, RecordingClient::new().as_callbacks())
        .unwrap();
    session.disconnect();

    assert_eq!(
        privileged.events(),
        vec![
            "status 0 NOT_AVAILABLE",
            "opened 0 com.example.app1",
            "status 0 PRESENT",
            "closed 0",
        ]
    );
    assert_eq!(
        plain.events(),
        vec!["status 0 NOT_AVAILABLE", "status 0 PRESENT"]
    );
}

#[test]
fn test_hidden_devices_are_filtered_from_snapshot() {
    let directory = Arc::new(VirtualDirectory::new());
    let backend = VirtualBackend::new("virtual");
    backend.plug(VirtualDevice::new("0").with_flash(true));
    backend.plug(VirtualDevice::new("1").with_flash(true));
    directory.publish(backend);
    let collaborators =
        Collaborators::permissive(directory).with_permissions(Arc::new(HiddenDevice("1")));
    let ctx = ArbitrationContext::start(test_config(), collaborators).unwrap();
    let sup = ctx.supervisor();

    let listener = RecordingListener::new();
    let (_, devices) = sup.add_listener(&listener.as_listener(), &app(50)).unwrap();
    let ids: Vec<String> = devices.into_iter().map(|d| d.device_id).collect();
    assert_eq!(ids, vec!["0".to_string()]);
    assert_eq!(listener.events(), vec!["torch 0 AVAILABLE_OFF"]);

    let trusted = RecordingListener::new();
    let (_, devices) = sup.add_listener(&trusted.as_listener(), &system(60)).unwrap();
    assert_eq!(devices.len(), 2);
    assert!(trusted.contains("torch 1 AVAILABLE_OFF"));
}

#[test]
fn test_priority_changes_of_monitored_uids() {
    let fx = Fixture::new(vec![VirtualDevice::new("0")]);
    let sup = fx.ctx.supervisor();
    let listener = RecordingListener::new();
    sup.add_listener(&listener.as_listener(), &app(50)).unwrap();

    // Not monitored until it holds a device.
    sup.on_uid_state_changed(10_001, process_state::BACKGROUND);
    assert!(!listener.contains("priorities"));

    let session = sup
        .connect("0", app(1), SessionProtocol::Modern, RecordingClient::new().as_callbacks())
        .unwrap();
    sup.on_uid_state_changed(10_001, process_state::BACKGROUND);
    sup.on_uid_state_changed(10_001, process_state::BACKGROUND);
    sup.on_uid_state_changed(10_002, process_state::TOP);
    assert_eq!(priority_events(&listener), 1);

    session.disconnect();
    sup.on_uid_state_changed(10_001, process_state::TOP);
    assert_eq!(priority_events(&listener), 1);
}

fn priority_events(listener: &RecordingListener) -> usize {
    listener
        .events()
        .iter()
        .filter(|e| e.as_str() == "priorities")
        .count()
}
