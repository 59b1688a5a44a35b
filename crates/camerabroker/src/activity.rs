// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Process activity tracking.
//!
//! The [`ActivityMonitor`] answers "is this UID currently allowed to use a
//! camera" for the connection supervisor. It keeps a cache of UIDs the
//! platform reported active, a table of administrative overrides, and a
//! reference-counted set of UIDs whose process-state changes must be
//! forwarded to listeners as access-priority changes.
//!
//! When a UID is not known to be active the monitor polls the external
//! [`ActivityOracle`] for a bounded total duration before concluding that it
//! is inactive, so a process that was foregrounded a moment ago is not
//! rejected. The sleep goes through a [`Clock`] so tests can run the poll loop
//! without real delays.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// UIDs below this value belong to the platform and are always active.
pub const FIRST_APPLICATION_UID: u32 = 10_000;

/// Default total bound of the activity oracle poll.
pub const DEFAULT_POLL_TOTAL: Duration = Duration::from_millis(300);

/// Default interval between activity oracle polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Source of time for bounded polling.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A clock that only advances when slept on.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Total time slept so far.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }
}

/// External oracle reporting whether a UID is in an active state.
pub trait ActivityOracle: Send + Sync {
    fn is_uid_active(&self, uid: u32, package: &str) -> bool;
}

/// Oracle backed by a fixed set of active UIDs.
#[derive(Debug, Default)]
pub struct StaticActivityOracle {
    active: Mutex<HashSet<u32>>,
    queries: Mutex<usize>,
}

impl StaticActivityOracle {
    pub fn new() -> Self {
        StaticActivityOracle::default()
    }

    pub fn set_active(&self, uid: u32, active: bool) {
        let mut set = self.active.lock();
        if active {
            set.insert(uid);
        } else {
            set.remove(&uid);
        }
    }

    /// Number of times the oracle was consulted.
    pub fn queries(&self) -> usize {
        *self.queries.lock()
    }
}

impl ActivityOracle for StaticActivityOracle {
    fn is_uid_active(&self, uid: u32, _package: &str) -> bool {
        *self.queries.lock() += 1;
        self.active.lock().contains(&uid)
    }
}

/// Cached activity state of a UID, as seen by the administrative surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UidState {
    Active,
    Idle,
}

impl UidState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UidState::Active => "active",
            UidState::Idle => "idle",
        }
    }
}

#[derive(Debug, Default)]
struct ActivityState {
    active: HashSet<u32>,
    overrides: HashMap<u32, bool>,
    monitored: HashMap<u32, MonitoredUid>,
}

#[derive(Debug, Clone, Copy)]
struct MonitoredUid {
    proc_state: Option<i32>,
    refcount: usize,
}

impl ActivityState {
    fn resolve(&self, uid: u32) -> Option<bool> {
        if uid < FIRST_APPLICATION_UID {
            return Some(true);
        }
        if let Some(active) = self.overrides.get(&uid) {
            return Some(*active);
        }
        if self.active.contains(&uid) {
            return Some(true);
        }
        None
    }
}

/// Tracks UID activity, overrides, and monitored UIDs.
pub struct ActivityMonitor {
    oracle: Option<Arc<dyn ActivityOracle>>,
    clock: Arc<dyn Clock>,
    poll_total: Duration,
    poll_interval: Duration,
    state: Mutex<ActivityState>,
}

impl ActivityMonitor {
    /// Create a monitor. Without an oracle every UID is considered active.
    pub fn new(
        oracle: Option<Arc<dyn ActivityOracle>>,
        clock: Arc<dyn Clock>,
        poll_total: Duration,
        poll_interval: Duration,
    ) -> Self {
        ActivityMonitor {
            oracle,
            clock,
            poll_total,
            poll_interval,
            state: Mutex::new(ActivityState::default()),
        }
    }

    /// Whether `uid` may use a camera right now.
    ///
    /// Blocks for at most the configured poll total while the oracle is
    /// consulted. A positive oracle answer is cached.
    pub fn is_uid_active(&self, uid: u32, package: &str) -> bool {
        if let Some(known) = self.state.lock().resolve(uid) {
            return known;
        }
        let Some(oracle) = self.oracle.as_ref() else {
            self.state.lock().active.insert(uid);
            return true;
        };

        let deadline = self.clock.now() + self.poll_total;
        let mut active = oracle.is_uid_active(uid, package);
        while !active && self.clock.now() < deadline {
            self.clock.sleep(self.poll_interval);
            active = oracle.is_uid_active(uid, package);
        }

        if active {
            self.state.lock().active.insert(uid);
        } else {
            log::debug!("uid {} ({}) inactive after polling", uid, package);
        }
        active
    }

    pub fn on_uid_active(&self, uid: u32) {
        self.state.lock().active.insert(uid);
    }

    /// Record that `uid` went idle. Returns true when its sessions must be
    /// blocked, which is whenever no override keeps it active.
    pub fn on_uid_idle(&self, uid: u32) -> bool {
        let mut state = self.state.lock();
        state.active.remove(&uid);
        !state.overrides.contains_key(&uid)
    }

    /// Record a process-state change. Returns true when `uid` is monitored
    /// and its state actually changed.
    pub fn on_uid_state_changed(&self, uid: u32, proc_state: i32) -> bool {
        let mut state = self.state.lock();
        match state.monitored.get_mut(&uid) {
            Some(m) if m.proc_state != Some(proc_state) => {
                m.proc_state = Some(proc_state);
                true
            }
            _ => false,
        }
    }

    pub fn register_monitor_uid(&self, uid: u32) {
        let mut state = self.state.lock();
        state
            .monitored
            .entry(uid)
            .and_modify(|m| m.refcount += 1)
            .or_insert(MonitoredUid {
                proc_state: None,
                refcount: 1,
            });
    }

    pub fn unregister_monitor_uid(&self, uid: u32) {
        let mut state = self.state.lock();
        match state.monitored.get_mut(&uid) {
            Some(m) if m.refcount > 1 => m.refcount -= 1,
            Some(_) => {
                state.monitored.remove(&uid);
            }
            None => log::warn!("trying to unregister uid {} which is not monitored", uid),
        }
    }

    pub fn is_monitored(&self, uid: u32) -> bool {
        self.state.lock().monitored.contains_key(&uid)
    }

    /// Force the cached state of `uid`. Returns true when this made an
    /// active UID inactive, in which case its sessions must be blocked.
    pub fn set_override(&self, uid: u32, active: bool) -> bool {
        let mut state = self.state.lock();
        let was_active = state.resolve(uid).unwrap_or(false);
        state.overrides.insert(uid, active);
        was_active && !active
    }

    /// Drop the override for `uid`. Returns true when the UID is now
    /// inactive after having been active.
    pub fn reset_override(&self, uid: u32) -> bool {
        let mut state = self.state.lock();
        let was_active = state.resolve(uid).unwrap_or(false);
        state.overrides.remove(&uid);
        let now_active = state.resolve(uid).unwrap_or(false);
        was_active && !now_active
    }

    /// Cached state of `uid` without consulting the oracle.
    pub fn uid_state(&self, uid: u32) -> UidState {
        match self.state.lock().resolve(uid) {
            Some(true) => UidState::Active,
            _ => UidState::Idle,
        }
    }
}

impl std::fmt::Debug for ActivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityMonitor")
            .field("has_oracle", &self.oracle.is_some())
            .field("poll_total", &self.poll_total)
            .field("poll_interval", &self.poll_interval)
            .field("state", &*self.state.lock())
            .finish()
    }
}
