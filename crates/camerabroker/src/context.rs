// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Explicit construction and teardown of the broker.
//!
//! There is no process-wide singleton: an [`ArbitrationContext`] owns the
//! status tracker, the backend registry and the supervisor, and wires the
//! backend registry's device events to the supervisor. Several contexts can
//! coexist, which is what the tests rely on.

use crate::activity::{ActivityMonitor, ActivityOracle, Clock, SystemClock};
use crate::backend::{BackendDirectory, BackendRegistry, DeviceEventListener};
use crate::config::BrokerConfig;
use crate::priority::{ProcessInfo, StaticProcessTable};
use crate::status::DeviceStatusTracker;
use crate::supervisor::{ConnectionSupervisor, PermissionPolicy, PermissivePolicy};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// External collaborators of the broker.
pub struct Collaborators {
    pub directory: Arc<dyn BackendDirectory>,
    pub process_info: Arc<dyn ProcessInfo>,
    pub activity_oracle: Option<Arc<dyn ActivityOracle>>,
    pub clock: Arc<dyn Clock>,
    pub permissions: Arc<dyn PermissionPolicy>,
}

impl Collaborators {
    /// Collaborators for `directory` that admit everyone: an empty process
    /// table, no activity oracle (every uid is active), the system clock and
    /// [`PermissivePolicy`].
    pub fn permissive<D>(directory: Arc<D>) -> Self
    where
        D: BackendDirectory + 'static,
    {
        Collaborators {
            directory,
            process_info: Arc::new(StaticProcessTable::new()),
            activity_oracle: None,
            clock: Arc::new(SystemClock),
            permissions: Arc::new(PermissivePolicy),
        }
    }

    pub fn with_process_info<P>(mut self, process_info: Arc<P>) -> Self
    where
        P: ProcessInfo + 'static,
    {
        self.process_info = process_info;
        self
    }

    pub fn with_activity_oracle<O>(mut self, oracle: Arc<O>) -> Self
    where
        O: ActivityOracle + 'static,
    {
        self.activity_oracle = Some(oracle);
        self
    }

    pub fn with_clock<C>(mut self, clock: Arc<C>) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = clock;
        self
    }

    pub fn with_permissions<P>(mut self, permissions: Arc<P>) -> Self
    where
        P: PermissionPolicy + 'static,
    {
        self.permissions = permissions;
        self
    }
}

/// A running broker.
///
/// Dropping the context shuts it down.
pub struct ArbitrationContext {
    config: BrokerConfig,
    tracker: Arc<DeviceStatusTracker>,
    backends: Arc<BackendRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    shut_down: AtomicBool,
}

impl ArbitrationContext {
    /// Validate `config`, build every component and attach the backends the
    /// directory already declares.
    ///
    /// Returns once every event the initial backends reported while
    /// initializing has been applied.
    pub fn start(config: BrokerConfig, collaborators: Collaborators) -> Result<Self, Error> {
        config.validate()?;
        let Collaborators {
            directory,
            process_info,
            activity_oracle,
            clock,
            permissions,
        } = collaborators;

        let tracker = Arc::new(DeviceStatusTracker::new());
        let backends = BackendRegistry::new(
            directory,
            config.lazy_backends,
            config.backend_event_queue,
        );
        let activity = ActivityMonitor::new(
            activity_oracle,
            clock,
            config.activity_poll_total(),
            config.activity_poll_interval(),
        );
        let supervisor = ConnectionSupervisor::new(
            config.clone(),
            Arc::clone(&tracker),
            Arc::clone(&backends),
            activity,
            process_info,
            permissions,
        );

        let listener: Weak<ConnectionSupervisor> = Arc::downgrade(&supervisor);
        let listener: Weak<dyn DeviceEventListener> = listener;
        if let Err(e) = backends.initialize(listener) {
            backends.shutdown();
            return Err(e);
        }
        backends.flush_events();

        log::info!(
            "camera broker started with {} backends and {} devices",
            backends.len(),
            tracker.len()
        );
        Ok(ArbitrationContext {
            config,
            tracker,
            backends,
            supervisor,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    pub fn tracker(&self) -> &Arc<DeviceStatusTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Wait until every backend event queued so far has been applied.
    pub fn flush_events(&self) {
        self.backends.flush_events();
    }

    /// Stop the backend drain threads, then disconnect every session.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.backends.shutdown();
        self.supervisor.shutdown();
        log::info!("camera broker stopped");
    }
}

impl Drop for ArbitrationContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ArbitrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitrationContext")
            .field("config", &self.config)
            .field("devices", &self.tracker.len())
            .field("backends", &self.backends.len())
            .finish()
    }
}
