// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Recent broker events and the on-disk diagnostic snapshot.
//!
//! The [`EventLog`] is a bounded ring buffer of timestamped one-line entries.
//! Once full, the oldest entry is dropped for each new one and the dump marks
//! the truncation with `...`.
//!
//! Neither the log nor the snapshot is needed for correctness after a
//! restart.

use crate::Error;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Default number of retained entries.
pub const DEFAULT_EVENT_LOG_LENGTH: usize = 100;

#[derive(Debug)]
struct Ring {
    entries: VecDeque<String>,
    wrapped: bool,
}

/// Bounded log of recent events.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        EventLog {
            capacity: capacity.max(1),
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity.max(1)),
                wrapped: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a timestamped entry.
    pub fn record(&self, message: impl AsRef<str>) {
        let line = format!(
            "{} : {}",
            Local::now().format("%m-%d %H:%M:%S%.3f"),
            message.as_ref()
        );
        let mut ring = self.ring.lock();
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
            ring.wrapped = true;
        }
        ring.entries.push_back(line);
    }

    pub fn connect(&self, device_id: &str, package: &str, pid: i32) {
        self.record(format!(
            "CONNECT device {} client for package {} (PID {})",
            device_id, package, pid
        ));
    }

    pub fn disconnect(&self, device_id: &str, package: &str, pid: i32) {
        self.record(format!(
            "DISCONNECT device {} client for package {} (PID {})",
            device_id, package, pid
        ));
    }

    pub fn evict(&self, device_id: &str, package: &str, pid: i32, reason: &str) {
        self.record(format!(
            "EVICT device {} client held by package {} (PID {}). {}",
            device_id, package, pid, reason
        ));
    }

    pub fn rejected(&self, device_id: &str, package: &str, pid: i32, reason: &str) {
        self.record(format!(
            "REJECT device {} access for package {} (PID {}). {}",
            device_id, package, pid, reason
        ));
    }

    pub fn device_status(&self, device_id: &str, reason: &str) {
        self.record(format!("DEVICE {}: {}", device_id, reason));
    }

    pub fn backend(&self, instance: &str, what: &str) {
        self.record(format!("BACKEND {} {}", instance, what));
    }

    pub fn policy(&self, what: &str) {
        self.record(format!("POLICY {}", what));
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().entries.is_empty()
    }

    /// Entries, most recent first.
    pub fn entries(&self) -> Vec<String> {
        self.ring.lock().entries.iter().rev().cloned().collect()
    }

    /// Render the log, most recent first.
    pub fn dump(&self) -> String {
        let ring = self.ring.lock();
        let mut out = String::from("== Broker events log (most recent at top): ==\n");
        if ring.entries.is_empty() {
            out.push_str("  [no events yet]\n");
            return out;
        }
        for entry in ring.entries.iter().rev() {
            let _ = writeln!(out, "  {}", entry);
        }
        if ring.wrapped {
            out.push_str("  ...\n");
        }
        out
    }
}

/// Best-effort on-disk copy of the latest dump.
#[derive(Debug, Clone)]
pub struct DiagnosticSnapshot {
    path: Option<PathBuf>,
}

impl DiagnosticSnapshot {
    pub fn new(path: Option<PathBuf>) -> Self {
        DiagnosticSnapshot { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Truncate the snapshot file and write `contents`. A no-op when no path
    /// is configured.
    pub fn write(&self, contents: &str) -> Result<(), Error> {
        if let Some(path) = self.path.as_ref() {
            fs::write(path, contents)?;
            log::trace!("wrote diagnostic snapshot to {}", path.display());
        }
        Ok(())
    }
}
