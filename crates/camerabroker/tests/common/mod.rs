// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use camerabroker::backend::{VirtualBackend, VirtualDevice, VirtualDirectory};
use camerabroker::config::BrokerConfig;
use camerabroker::context::{ArbitrationContext, Collaborators};
use camerabroker::listener::StatusListener;
use camerabroker::priority::{process_state, StaticProcessTable};
use camerabroker::session::{CallerCredentials, ClientCallbacks, DeathLink, DisconnectReason};
use camerabroker::{DeviceStatus, TorchStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_REMOTE: AtomicU64 = AtomicU64::new(1);

/// Client-side end of a session that records what the broker told it.
pub struct RecordingClient {
    remote: u64,
    pub disconnects: Mutex<Vec<(String, String)>>,
    pub errors: Mutex<Vec<(String, String)>>,
    pub link: Mutex<Option<DeathLink>>,
    pub dead: AtomicBool,
    pub unlinked: AtomicBool,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingClient {
            remote: NEXT_REMOTE.fetch_add(1, Ordering::SeqCst),
            disconnects: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            link: Mutex::new(None),
            dead: AtomicBool::new(false),
            unlinked: AtomicBool::new(false),
        })
    }

    /// A remote that is already dead when the broker links to it.
    pub fn dead() -> Arc<Self> {
        let client = Self::new();
        client.dead.store(true, Ordering::SeqCst);
        client
    }

    pub fn as_callbacks(self: &Arc<Self>) -> Arc<dyn ClientCallbacks> {
        self.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.lock().unwrap().len()
    }

    pub fn last_reason(&self) -> Option<String> {
        self.disconnects.lock().unwrap().last().map(|(_, r)| r.clone())
    }

    /// Simulate the remote process dying.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        let link = self.link.lock().unwrap().clone();
        if let Some(link) = link {
            link.fire();
        }
    }
}

impl ClientCallbacks for RecordingClient {
    fn remote_id(&self) -> u64 {
        self.remote
    }

    fn on_disconnected(&self, device_id: &str, reason: &DisconnectReason) {
        self.disconnects
            .lock()
            .unwrap()
            .push((device_id.to_string(), reason.to_string()));
    }

    fn on_device_error(&self, device_id: &str, message: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((device_id.to_string(), message.to_string()));
    }

    fn link_to_death(&self, link: DeathLink) -> bool {
        if self.dead.load(Ordering::SeqCst) {
            return false;
        }
        *self.link.lock().unwrap() = Some(link);
        true
    }

    fn unlink_to_death(&self) {
        self.unlinked.store(true, Ordering::SeqCst);
    }
}

/// Listener recording every event in arrival order.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingListener::default())
    }

    pub fn as_listener(self: &Arc<Self>) -> Arc<dyn StatusListener> {
        self.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| e == event)
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl StatusListener for RecordingListener {
    fn on_status_changed(&self, device_id: &str, status: DeviceStatus) {
        self.push(format!("status {} {}", device_id, status));
    }

    fn on_physical_status_changed(&self, device_id: &str, physical_id: &str, status: DeviceStatus) {
        self.push(format!("physical {} {} {}", device_id, physical_id, status));
    }

    fn on_torch_status_changed(&self, device_id: &str, status: TorchStatus) {
        self.push(format!("torch {} {}", device_id, status));
    }

    fn on_device_opened(&self, device_id: &str, owner: &str) {
        self.push(format!("opened {} {}", device_id, owner));
    }

    fn on_device_closed(&self, device_id: &str) {
        self.push(format!("closed {}", device_id));
    }

    fn on_access_priorities_changed(&self) {
        self.push("priorities".to_string());
    }
}

/// A running broker over one virtual backend named `virtual`.
pub struct Fixture {
    pub directory: Arc<VirtualDirectory>,
    pub backend: Arc<VirtualBackend>,
    pub processes: Arc<StaticProcessTable>,
    pub ctx: ArbitrationContext,
}

impl Fixture {
    pub fn new(devices: Vec<VirtualDevice>) -> Self {
        Self::with_config(devices, test_config())
    }

    pub fn with_config(devices: Vec<VirtualDevice>, config: BrokerConfig) -> Self {
        let directory = Arc::new(VirtualDirectory::new());
        let backend = VirtualBackend::new("virtual");
        for device in devices {
            backend.plug(device);
        }
        directory.publish(Arc::clone(&backend));
        let processes = Arc::new(StaticProcessTable::new());
        let collaborators = Collaborators::permissive(Arc::clone(&directory))
            .with_process_info(Arc::clone(&processes));
        let ctx = ArbitrationContext::start(config, collaborators).unwrap();
        Fixture {
            directory,
            backend,
            processes,
            ctx,
        }
    }

    /// Register `pid` with `score` in the foreground.
    pub fn process(&self, pid: i32, score: i32) {
        self.processes.set(pid, score, process_state::TOP);
    }
}

/// Short timeouts so failure paths finish quickly.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        disconnect_timeout_ms: 500,
        connect_timeout_ms: 2000,
        ..BrokerConfig::default()
    }
}

/// Credentials of an application process. The uid is derived from the pid.
pub fn app(pid: i32) -> CallerCredentials {
    CallerCredentials::new(pid, 10_000 + pid as u32, format!("com.example.app{}", pid))
}

/// Credentials of a trusted platform process.
pub fn system(pid: i32) -> CallerCredentials {
    CallerCredentials::new(pid, 1000, format!("system.service{}", pid)).trusted()
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_for<F>(timeout: Duration, cond: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
