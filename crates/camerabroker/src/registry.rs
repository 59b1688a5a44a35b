// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Lease admission and eviction.
//!
//! The [`ClientRegistry`] holds every granted [`ClientLease`]. For a candidate
//! request it computes which existing leases must be revoked, or decides that
//! the candidate itself loses and must be rejected.
//!
//! # Eviction rules
//!
//! Two leases conflict when they share a key, or when either lists the
//! other's device in its conflicting set. Walking the existing leases in
//! insertion order:
//!
//! | Existing lease | Outcome |
//! |----------------|---------|
//! | Same owner, same key | Existing lease is evicted (latest open wins) |
//! | Same owner, conflicting other key | Candidate is rejected |
//! | Conflicting, higher priority | Candidate is rejected |
//! | Conflicting, lower or equal priority | Existing lease is evicted |
//! | Pushes total cost over the ceiling, lower or equal priority | Existing lease is evicted |
//!
//! Leases of the highest-priority owner are never evicted for cost alone, and
//! a candidate whose owner is not the highest-priority owner is rejected when
//! the remaining cost still exceeds the ceiling.
//!
//! A rejection is signalled by [`ClientRegistry::would_evict`] returning the
//! candidate itself; [`ClientRegistry::admission`] turns that into an
//! [`Admission`] value.

use crate::priority::{Priority, PriorityCatalog};
use crate::DeviceId;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default resource-cost ceiling.
pub const DEFAULT_MAX_COST: i32 = 100;

/// Key of a lease. Online and offline leases of the same device are
/// independent and each single-owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeaseKey {
    Online(DeviceId),
    Offline(DeviceId),
}

impl LeaseKey {
    pub fn online(id: impl Into<DeviceId>) -> Self {
        LeaseKey::Online(id.into())
    }

    pub fn offline(id: impl Into<DeviceId>) -> Self {
        LeaseKey::Offline(id.into())
    }

    pub fn device_id(&self) -> &str {
        match self {
            LeaseKey::Online(id) | LeaseKey::Offline(id) => id,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, LeaseKey::Offline(_))
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseKey::Online(id) => write!(f, "{}", id),
            LeaseKey::Offline(id) => write!(f, "offline-{}", id),
        }
    }
}

/// Handle owned by a lease.
///
/// `disconnect` is called when the last reference to the lease is dropped and
/// may also be called explicitly beforehand; implementations must make
/// repeated calls no-ops.
pub trait LeaseHandle: Send + Sync {
    fn disconnect(&self);
}

/// A single process's right to use one device.
pub struct ClientLease<H: LeaseHandle> {
    key: LeaseKey,
    owner: i32,
    cost: i32,
    conflicting: BTreeSet<DeviceId>,
    priority: Mutex<Priority>,
    handle: Option<H>,
}

impl<H: LeaseHandle> ClientLease<H> {
    pub fn new(
        key: LeaseKey,
        owner: i32,
        cost: i32,
        conflicting: BTreeSet<DeviceId>,
        priority: Priority,
        handle: H,
    ) -> Arc<Self> {
        Arc::new(ClientLease {
            key,
            owner,
            cost,
            conflicting,
            priority: Mutex::new(priority),
            handle: Some(handle),
        })
    }

    /// A lease without a handle, used only to ask the registry a question.
    pub fn descriptor(
        key: LeaseKey,
        owner: i32,
        cost: i32,
        conflicting: BTreeSet<DeviceId>,
        priority: Priority,
    ) -> Arc<Self> {
        Arc::new(ClientLease {
            key,
            owner,
            cost,
            conflicting,
            priority: Mutex::new(priority),
            handle: None,
        })
    }

    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    pub fn device_id(&self) -> &str {
        self.key.device_id()
    }

    pub fn owner(&self) -> i32 {
        self.owner
    }

    pub fn cost(&self) -> i32 {
        self.cost
    }

    pub fn conflicting(&self) -> &BTreeSet<DeviceId> {
        &self.conflicting
    }

    pub fn priority(&self) -> Priority {
        *self.priority.lock()
    }

    pub fn set_priority(&self, priority: Priority) {
        *self.priority.lock() = priority;
    }

    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    /// Whether this lease lists `key`'s device as conflicting.
    pub fn conflicts_with(&self, key: &LeaseKey) -> bool {
        match key {
            LeaseKey::Online(id) => self.conflicting.contains(id),
            LeaseKey::Offline(_) => false,
        }
    }

    pub fn summary(&self) -> LeaseSummary {
        let p = self.priority();
        LeaseSummary {
            device_id: self.device_id().to_string(),
            offline: self.key.is_offline(),
            owner: self.owner,
            cost: self.cost,
            score: p.score(),
            state: p.state(),
            trusted: p.is_trusted(),
            conflicting: self.conflicting.iter().cloned().collect(),
        }
    }
}

impl<H: LeaseHandle> Drop for ClientLease<H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.as_ref() {
            handle.disconnect();
        }
    }
}

impl<H: LeaseHandle> fmt::Display for ClientLease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(Device ID: {}, Cost: {}, PID: {}, {}, Conflicting Devices: {{",
            self.key,
            self.cost,
            self.owner,
            self.priority()
        )?;
        for (i, id) in self.conflicting.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "}})")
    }
}

impl<H: LeaseHandle> fmt::Debug for ClientLease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLease")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("cost", &self.cost)
            .field("conflicting", &self.conflicting)
            .field("priority", &self.priority())
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

/// Serializable view of a lease for dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseSummary {
    pub device_id: String,
    pub offline: bool,
    pub owner: i32,
    pub cost: i32,
    pub score: i32,
    pub state: i32,
    pub trusted: bool,
    pub conflicting: Vec<String>,
}

/// Outcome of an admission check.
pub enum Admission<H: LeaseHandle> {
    /// The candidate may be inserted once these leases are gone.
    Admit(Vec<Arc<ClientLease<H>>>),
    /// The candidate loses against an existing lease.
    Reject,
}

/// Result of [`ClientRegistry::wait_until_removed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Removed,
    TimedOut,
}

/// Set of granted leases with priority-based eviction.
pub struct ClientRegistry<H: LeaseHandle> {
    max_cost: i32,
    leases: Mutex<Vec<Arc<ClientLease<H>>>>,
    removed: Condvar,
}

impl<H: LeaseHandle> ClientRegistry<H> {
    pub fn new(max_cost: i32) -> Self {
        ClientRegistry {
            max_cost,
            leases: Mutex::new(Vec::new()),
            removed: Condvar::new(),
        }
    }

    pub fn max_cost(&self) -> i32 {
        self.max_cost
    }

    /// Leases that must go for `candidate` to be admitted.
    ///
    /// If the candidate loses, the result contains only the candidate itself.
    /// Pure: no lease or priority is modified.
    pub fn would_evict(&self, candidate: &Arc<ClientLease<H>>) -> Vec<Arc<ClientLease<H>>> {
        let leases = self.leases.lock();
        self.would_evict_locked(&leases, candidate, false)
    }

    /// [`ClientRegistry::would_evict`] folded into an [`Admission`].
    pub fn admission(&self, candidate: &Arc<ClientLease<H>>) -> Admission<H> {
        let evicted = self.would_evict(candidate);
        if evicted.iter().any(|l| Arc::ptr_eq(l, candidate)) {
            Admission::Reject
        } else {
            Admission::Admit(evicted)
        }
    }

    /// Existing higher-priority leases standing in the candidate's way.
    ///
    /// Diagnostic only; used to build rejection messages.
    pub fn incompatible_clients(
        &self,
        candidate: &Arc<ClientLease<H>>,
    ) -> Vec<Arc<ClientLease<H>>> {
        let leases = self.leases.lock();
        self.would_evict_locked(&leases, candidate, true)
    }

    /// Insert `candidate`, removing every lease it evicts.
    ///
    /// Returns the removed leases so the caller can tear them down outside
    /// any lock.
    ///
    /// # Panics
    ///
    /// Panics if the candidate would be rejected. Callers must run an
    /// admission check first.
    pub fn add_and_evict(&self, candidate: Arc<ClientLease<H>>) -> Vec<Arc<ClientLease<H>>> {
        let mut leases = self.leases.lock();
        let evicted = self.would_evict_locked(&leases, &candidate, false);
        if evicted.iter().any(|l| Arc::ptr_eq(l, &candidate)) {
            panic!(
                "lease for device {} from pid {} was inserted without passing admission",
                candidate.key, candidate.owner
            );
        }
        leases.retain(|l| !evicted.iter().any(|e| Arc::ptr_eq(e, l)));
        leases.push(candidate);
        if !evicted.is_empty() {
            self.removed.notify_all();
        }
        evicted
    }

    /// Refresh the cached priority of every lease whose owner is in `catalog`.
    pub fn update_priorities(&self, catalog: &PriorityCatalog) {
        let leases = self.leases.lock();
        for lease in leases.iter() {
            if let Some(p) = catalog.get(lease.owner) {
                if lease.priority().is_trusted() {
                    continue;
                }
                lease.set_priority(p);
            }
        }
    }

    pub fn get(&self, key: &LeaseKey) -> Option<Arc<ClientLease<H>>> {
        self.leases.lock().iter().find(|l| &l.key == key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<ClientLease<H>>> {
        self.leases.lock().clone()
    }

    pub fn keys(&self) -> Vec<LeaseKey> {
        self.leases.lock().iter().map(|l| l.key.clone()).collect()
    }

    /// Distinct owners, in insertion order of their first lease.
    pub fn owners(&self) -> Vec<i32> {
        let mut owners = Vec::new();
        for lease in self.leases.lock().iter() {
            if !owners.contains(&lease.owner) {
                owners.push(lease.owner);
            }
        }
        owners
    }

    pub fn current_cost(&self) -> i32 {
        self.leases.lock().iter().map(|l| l.cost).sum()
    }

    pub fn len(&self) -> usize {
        self.leases.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.lock().is_empty()
    }

    pub fn remove(&self, key: &LeaseKey) -> Option<Arc<ClientLease<H>>> {
        let mut leases = self.leases.lock();
        let idx = leases.iter().position(|l| &l.key == key)?;
        let lease = leases.remove(idx);
        self.removed.notify_all();
        Some(lease)
    }

    /// Remove this exact lease if it is still present.
    pub fn remove_lease(&self, lease: &Arc<ClientLease<H>>) -> bool {
        let mut leases = self.leases.lock();
        match leases.iter().position(|l| Arc::ptr_eq(l, lease)) {
            Some(idx) => {
                // The caller still holds a reference, so this never drops the lease.
                leases.remove(idx);
                self.removed.notify_all();
                true
            }
            None => false,
        }
    }

    /// Remove every lease matching `pred` and return them.
    pub fn remove_matching<F>(&self, pred: F) -> Vec<Arc<ClientLease<H>>>
    where
        F: Fn(&ClientLease<H>) -> bool,
    {
        let mut leases = self.leases.lock();
        let mut removed = Vec::new();
        let mut i = 0;
        while i < leases.len() {
            if pred(&leases[i]) {
                removed.push(leases.remove(i));
            } else {
                i += 1;
            }
        }
        if !removed.is_empty() {
            self.removed.notify_all();
        }
        removed
    }

    pub fn remove_all(&self) -> Vec<Arc<ClientLease<H>>> {
        let mut leases = self.leases.lock();
        let removed = std::mem::take(&mut *leases);
        self.removed.notify_all();
        removed
    }

    /// Block until `lease` is no longer in the registry, or `timeout` passes.
    pub fn wait_until_removed(
        &self,
        lease: &Arc<ClientLease<H>>,
        timeout: Duration,
    ) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut leases = self.leases.lock();
        while leases.iter().any(|l| Arc::ptr_eq(l, lease)) {
            if self.removed.wait_until(&mut leases, deadline).timed_out() {
                if leases.iter().any(|l| Arc::ptr_eq(l, lease)) {
                    return WaitOutcome::TimedOut;
                }
                break;
            }
        }
        WaitOutcome::Removed
    }

    pub fn summaries(&self) -> Vec<LeaseSummary> {
        self.leases.lock().iter().map(|l| l.summary()).collect()
    }

    fn would_evict_locked(
        &self,
        leases: &[Arc<ClientLease<H>>],
        candidate: &Arc<ClientLease<H>>,
        incompatible_only: bool,
    ) -> Vec<Arc<ClientLease<H>>> {
        let mut evict = Vec::new();
        let key = &candidate.key;
        let owner = candidate.owner;
        let priority = candidate.priority();

        let mut total_cost: i32 = leases.iter().map(|l| l.cost).sum::<i32>() + candidate.cost;

        // Latest lease wins ties, and the candidate beats them all on a tie.
        let mut highest = priority;
        let mut highest_owner = owner;
        for lease in leases {
            let p = lease.priority();
            if p >= highest {
                highest = p;
                highest_owner = lease.owner;
            }
        }
        if highest == priority {
            highest_owner = owner;
        }

        for lease in leases {
            let cur_key = &lease.key;
            let cur_owner = lease.owner;
            let cur_priority = lease.priority();
            let cur_cost = lease.cost;

            let conflicting =
                cur_key == key || lease.conflicts_with(key) || candidate.conflicts_with(cur_key);

            if incompatible_only {
                if cur_priority > priority
                    && (conflicting || (total_cost > self.max_cost && cur_cost > 0))
                {
                    evict.push(Arc::clone(lease));
                }
                continue;
            }

            if conflicting && owner == cur_owner {
                if cur_key == key {
                    evict.push(Arc::clone(lease));
                    total_cost -= cur_cost;
                } else {
                    return vec![Arc::clone(candidate)];
                }
            } else if conflicting && cur_priority > priority {
                return vec![Arc::clone(candidate)];
            } else if conflicting
                || (total_cost > self.max_cost
                    && cur_cost > 0
                    && cur_priority <= priority
                    && !(highest_owner == owner && owner == cur_owner))
            {
                evict.push(Arc::clone(lease));
                total_cost -= cur_cost;
            }
        }

        if !incompatible_only && total_cost > self.max_cost && highest_owner != owner {
            return vec![Arc::clone(candidate)];
        }

        evict
    }
}

impl<H: LeaseHandle> fmt::Display for ClientRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leases = self.leases.lock();
        if leases.is_empty() {
            return writeln!(f, "[no active leases]");
        }
        for lease in leases.iter() {
            writeln!(f, "{}", lease)?;
        }
        Ok(())
    }
}

impl<H: LeaseHandle> fmt::Debug for ClientRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("max_cost", &self.max_cost)
            .field("leases", &*self.leases.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::process_state;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Clone, Default)]
    struct CountingHandle(Arc<AtomicUsize>);

    impl LeaseHandle for CountingHandle {
        fn disconnect(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    type Lease = ClientLease<CountingHandle>;

    fn conflicts(ids: &[&str]) -> BTreeSet<DeviceId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn lease(id: &str, owner: i32, cost: i32, conflicting: &[&str], score: i32) -> Arc<Lease> {
        ClientLease::new(
            LeaseKey::online(id),
            owner,
            cost,
            conflicts(conflicting),
            Priority::new(score, process_state::TOP),
            CountingHandle::default(),
        )
    }

    fn candidate(id: &str, owner: i32, cost: i32, conflicting: &[&str], p: Priority) -> Arc<Lease> {
        ClientLease::descriptor(LeaseKey::online(id), owner, cost, conflicts(conflicting), p)
    }

    fn fg(score: i32) -> Priority {
        Priority::new(score, process_state::TOP)
    }

    fn is_reject(result: &[Arc<Lease>], cand: &Arc<Lease>) -> bool {
        result.len() == 1 && Arc::ptr_eq(&result[0], cand)
    }

    #[test]
    fn test_empty_registry_admits() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        let cand = candidate("0", 1, 100, &[], fg(10));
        assert!(reg.would_evict(&cand).is_empty());
    }

    #[test]
    fn test_higher_priority_evicts_same_device() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        let p1 = lease("0", 100, 100, &[], 50);
        reg.add_and_evict(p1.clone());

        let cand = candidate("0", 200, 100, &[], fg(90));
        let evicted = reg.would_evict(&cand);
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &p1));
    }

    #[test]
    fn test_lower_priority_is_rejected() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 100, &[], 90));

        let cand = candidate("0", 200, 100, &[], fg(50));
        assert!(is_reject(&reg.would_evict(&cand), &cand));
        assert!(matches!(reg.admission(&cand), Admission::Reject));
    }

    #[test]
    fn test_conflict_set_is_symmetric() {
        let reg = ClientRegistry::new(1000);
        let a = lease("0", 100, 50, &["1"], 10);
        reg.add_and_evict(a.clone());

        // Candidate does not list "0" but the existing lease lists "1".
        let cand = candidate("1", 200, 50, &[], fg(20));
        let evicted = reg.would_evict(&cand);
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &a));

        // And the other way round.
        let reg = ClientRegistry::new(1000);
        let b = lease("2", 100, 50, &[], 10);
        reg.add_and_evict(b.clone());
        let cand = candidate("3", 200, 50, &["2"], fg(20));
        assert!(Arc::ptr_eq(&reg.would_evict(&cand)[0], &b));
    }

    #[test]
    fn test_same_owner_same_device_replaces() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        let old = lease("0", 100, 100, &[], 90);
        reg.add_and_evict(old.clone());

        // Even at a lower score the same owner reopening wins.
        let cand = candidate("0", 100, 100, &[], fg(10));
        let evicted = reg.would_evict(&cand);
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &old));
    }

    #[test]
    fn test_same_owner_conflicting_device_rejected() {
        let reg = ClientRegistry::new(1000);
        reg.add_and_evict(lease("0", 100, 50, &["1"], 10));
        let cand = candidate("1", 100, 50, &[], fg(90));
        assert!(is_reject(&reg.would_evict(&cand), &cand));
    }

    #[test]
    fn test_equal_priority_newest_wins() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        let old = lease("0", 100, 100, &[], 50);
        reg.add_and_evict(old.clone());
        let cand = candidate("0", 200, 100, &[], fg(50));
        assert!(Arc::ptr_eq(&reg.would_evict(&cand)[0], &old));
    }

    #[test]
    fn test_same_owner_over_cost_is_admitted() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("2", 100, 100, &[], 50));
        let cand = candidate("3", 100, 100, &[], fg(50));
        assert!(reg.would_evict(&cand).is_empty());
    }

    #[test]
    fn test_cost_ceiling_evicts_lower_priority() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        let low = lease("0", 100, 60, &[], 10);
        reg.add_and_evict(low.clone());

        let cand = candidate("1", 200, 60, &[], fg(90));
        let evicted = reg.would_evict(&cand);
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &low));
    }

    #[test]
    fn test_cost_ceiling_rejects_lower_priority_candidate() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 60, &[], 90));

        let cand = candidate("1", 200, 60, &[], fg(10));
        assert!(is_reject(&reg.would_evict(&cand), &cand));
        // Different device, so the caller reports a system-wide limit.
        assert!(reg.get(&LeaseKey::online("1")).is_none());
    }

    #[test]
    fn test_trusted_candidate_beats_all_scores() {
        let reg = ClientRegistry::new(1000);
        let a = lease("0", 100, 50, &[], 10);
        let b = lease("1", 101, 50, &[], 20);
        reg.add_and_evict(a.clone());
        reg.add_and_evict(b.clone());

        let cand = candidate("2", 300, 50, &["0", "1"], Priority::for_owner(5, 0, true));
        let evicted = reg.would_evict(&cand);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().any(|l| Arc::ptr_eq(l, &a)));
        assert!(evicted.iter().any(|l| Arc::ptr_eq(l, &b)));
    }

    #[test]
    fn test_trusted_lease_never_evicted_by_untrusted() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        let trusted = ClientLease::new(
            LeaseKey::online("0"),
            100,
            100,
            BTreeSet::new(),
            Priority::trusted(),
            CountingHandle::default(),
        );
        reg.add_and_evict(trusted);
        let cand = candidate("0", 200, 100, &[], fg(i32::MAX));
        assert!(is_reject(&reg.would_evict(&cand), &cand));
    }

    #[test]
    fn test_would_evict_is_idempotent() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 50, &["1"], 10));
        reg.add_and_evict(lease("2", 101, 50, &[], 30));

        let cand = candidate("1", 200, 50, &[], fg(20));
        let first: Vec<_> = reg.would_evict(&cand).iter().map(|l| l.key().clone()).collect();
        let second: Vec<_> = reg.would_evict(&cand).iter().map(|l| l.key().clone()).collect();
        assert_eq!(first, second);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_add_then_remove_restores_state() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 50, &["1"], 10));
        let before = reg.summaries();

        reg.add_and_evict(lease("5", 101, 10, &[], 30));
        assert_eq!(reg.current_cost(), 60);
        assert_eq!(reg.owners(), vec![100, 101]);
        assert_eq!(reg.keys(), vec![LeaseKey::online("0"), LeaseKey::online("5")]);
        let removed = reg.remove(&LeaseKey::online("5"));
        assert!(removed.is_some());
        assert_eq!(reg.summaries(), before);
    }

    #[test]
    #[should_panic(expected = "without passing admission")]
    fn test_add_and_evict_rejected_candidate_panics() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 100, &[], 90));
        reg.add_and_evict(lease("0", 200, 100, &[], 10));
    }

    #[test]
    fn test_update_priorities_changes_outcome() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 100, &[], 90));
        let cand = candidate("0", 200, 100, &[], fg(50));
        assert!(is_reject(&reg.would_evict(&cand), &cand));

        let mut catalog = PriorityCatalog::new();
        catalog.insert(100, Priority::new(10, process_state::CACHED));
        reg.update_priorities(&catalog);
        assert_eq!(reg.would_evict(&cand).len(), 1);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_incompatible_clients() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 50, &["1"], 90));
        reg.add_and_evict(lease("3", 101, 10, &[], 5));

        let cand = candidate("1", 200, 50, &[], fg(50));
        let blocking = reg.incompatible_clients(&cand);
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].device_id(), "0");
    }

    #[test]
    fn test_offline_key_is_independent() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        reg.add_and_evict(lease("0", 100, 100, &[], 90));
        let offline = ClientLease::descriptor(
            LeaseKey::offline("0"),
            100,
            0,
            BTreeSet::new(),
            fg(90),
        );
        assert!(reg.would_evict(&offline).is_empty());
        assert_eq!(LeaseKey::offline("0").to_string(), "offline-0");
    }

    #[test]
    fn test_drop_disconnects_once() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let reg = ClientRegistry::new(DEFAULT_MAX_COST);
            let l = ClientLease::new(
                LeaseKey::online("0"),
                1,
                100,
                BTreeSet::new(),
                fg(1),
                CountingHandle(count.clone()),
            );
            reg.add_and_evict(l);
            let removed = reg.remove(&LeaseKey::online("0"));
            assert_eq!(count.load(Ordering::SeqCst), 0);
            drop(removed);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_until_removed_times_out() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        let l = lease("0", 1, 100, &[], 1);
        reg.add_and_evict(l.clone());
        assert_eq!(
            reg.wait_until_removed(&l, Duration::from_millis(20)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn test_wait_until_removed_wakes_on_removal() {
        let reg = Arc::new(ClientRegistry::new(DEFAULT_MAX_COST));
        let l = lease("0", 1, 100, &[], 1);
        reg.add_and_evict(l.clone());

        let remover = {
            let reg = reg.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                reg.remove(&LeaseKey::online("0"))
            })
        };
        assert_eq!(
            reg.wait_until_removed(&l, Duration::from_secs(5)),
            WaitOutcome::Removed
        );
        assert!(remover.join().unwrap().is_some());
    }

    #[test]
    fn test_display_dump() {
        let reg = ClientRegistry::new(DEFAULT_MAX_COST);
        assert_eq!(reg.to_string(), "[no active leases]\n");
        reg.add_and_evict(lease("0", 100, 100, &["1", "2"], 50));
        let dump = reg.to_string();
        assert!(dump.contains("Device ID: 0"));
        assert!(dump.contains("PID: 100"));
        assert!(dump.contains("Conflicting Devices: {1, 2}"));
    }
}
