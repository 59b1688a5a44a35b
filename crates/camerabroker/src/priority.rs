// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Process priorities used for lease arbitration.
//!
//! A [`Priority`] combines a numeric importance score reported by the process
//! scoring oracle with a coarse lifecycle state. Larger values are more
//! important on both axes, and comparison is lexicographic by
//! `(score, lifecycle_state)`.
//!
//! Trusted sources (platform-internal callers) are pinned to a fixed priority
//! above anything an untrusted process can report, so an untrusted caller can
//! never outrank a trusted one.
//!
//! # Example
//!
//! ```
//! use camerabroker::priority::{Priority, process_state};
//!
//! let background = Priority::new(50, process_state::BACKGROUND);
//! let foreground = Priority::new(90, process_state::TOP);
//! assert!(foreground > background);
//! assert!(Priority::trusted() > Priority::new(i32::MAX, process_state::PERSISTENT));
//! ```

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Coarse process lifecycle states, most important last.
pub mod process_state {
    /// The process is not running.
    pub const NONEXISTENT: i32 = 0;
    /// Cached and not doing any work.
    pub const CACHED: i32 = 100;
    /// Running in the background.
    pub const BACKGROUND: i32 = 200;
    /// Running a bound or started service.
    pub const SERVICE: i32 = 300;
    /// Running a user-visible foreground service.
    pub const FOREGROUND_SERVICE: i32 = 400;
    /// Owns the top-most visible activity.
    pub const TOP: i32 = 500;
    /// Persistent system UI process.
    pub const PERSISTENT_UI: i32 = 600;
    /// Persistent system process.
    pub const PERSISTENT: i32 = 700;
}

/// Score assigned to processes the scoring oracle does not know about.
pub const UNKNOWN_PROCESS_SCORE: i32 = i32::MIN;

/// Comparable priority of a lease owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Priority {
    score: i32,
    state: i32,
    trusted: bool,
}

impl Priority {
    pub fn new(score: i32, state: i32) -> Self {
        Priority {
            score,
            state,
            trusted: false,
        }
    }

    /// The fixed priority of a trusted (platform-internal) caller.
    pub fn trusted() -> Self {
        Priority {
            score: i32::MAX,
            state: process_state::PERSISTENT,
            trusted: true,
        }
    }

    /// Priority for an owner, pinning trusted sources regardless of score.
    pub fn for_owner(score: i32, state: i32, trusted: bool) -> Self {
        if trusted {
            Priority::trusted()
        } else {
            Priority::new(score, state)
        }
    }

    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn state(&self) -> i32 {
        self.state
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.trusted
            .cmp(&other.trusted)
            .then(self.score.cmp(&other.score))
            .then(self.state.cmp(&other.state))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.trusted {
            write!(f, "Score: trusted, State: {}", self.state)
        } else {
            write!(f, "Score: {}, State: {}", self.score, self.state)
        }
    }
}

/// Score and lifecycle state reported for a single process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessPriority {
    pub score: i32,
    pub state: i32,
}

impl ProcessPriority {
    pub const NONEXISTENT: ProcessPriority = ProcessPriority {
        score: UNKNOWN_PROCESS_SCORE,
        state: process_state::NONEXISTENT,
    };
}

/// External process-scoring oracle.
///
/// Implementations return one entry per requested pid, in order. Processes
/// that are unknown to the oracle report [`ProcessPriority::NONEXISTENT`].
pub trait ProcessInfo: Send + Sync {
    fn process_priorities(&self, pids: &[i32]) -> Vec<ProcessPriority>;
}

/// Snapshot of owner priorities taken before an admission decision.
#[derive(Debug, Clone, Default)]
pub struct PriorityCatalog {
    entries: HashMap<i32, Priority>,
}

impl PriorityCatalog {
    pub fn new() -> Self {
        PriorityCatalog::default()
    }

    /// Query `info` for every owner and pin the trusted ones.
    ///
    /// `owners` pairs each pid with whether it is a trusted source.
    pub fn snapshot(info: &dyn ProcessInfo, owners: &[(i32, bool)]) -> Self {
        let pids: Vec<i32> = owners.iter().map(|(pid, _)| *pid).collect();
        let reported = info.process_priorities(&pids);
        let mut catalog = PriorityCatalog::new();
        for (i, (pid, trusted)) in owners.iter().enumerate() {
            let p = reported
                .get(i)
                .copied()
                .unwrap_or(ProcessPriority::NONEXISTENT);
            catalog.insert(*pid, Priority::for_owner(p.score, p.state, *trusted));
        }
        catalog
    }

    /// Record `priority` for `pid`. A trusted entry is never downgraded.
    pub fn insert(&mut self, pid: i32, priority: Priority) {
        match self.entries.get(&pid) {
            Some(existing) if existing.is_trusted() => {}
            _ => {
                self.entries.insert(pid, priority);
            }
        }
    }

    pub fn get(&self, pid: i32) -> Option<Priority> {
        self.entries.get(&pid).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, Priority)> + '_ {
        self.entries.iter().map(|(pid, p)| (*pid, *p))
    }
}

/// In-memory scoring oracle keyed by pid.
///
/// Used by the command-line front end and by tests; processes can be
/// re-scored at any time to simulate foreground/background changes.
#[derive(Debug, Default)]
pub struct StaticProcessTable {
    table: RwLock<HashMap<i32, ProcessPriority>>,
}

impl StaticProcessTable {
    pub fn new() -> Self {
        StaticProcessTable::default()
    }

    pub fn set(&self, pid: i32, score: i32, state: i32) {
        self.table
            .write()
            .insert(pid, ProcessPriority { score, state });
    }

    pub fn remove(&self, pid: i32) {
        self.table.write().remove(&pid);
    }
}

impl ProcessInfo for StaticProcessTable {
    fn process_priorities(&self, pids: &[i32]) -> Vec<ProcessPriority> {
        let table = self.table.read();
        pids.iter()
            .map(|pid| {
                table
                    .get(pid)
                    .copied()
                    .unwrap_or(ProcessPriority::NONEXISTENT)
            })
            .collect()
    }
}
