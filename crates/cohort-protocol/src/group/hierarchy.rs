/// HierarchyLedger: the parent groups a group is stacked on, plus the
/// split counter used to name subgroups `<group>_<counter>`.
use serde::{Deserialize, Serialize};

use crate::types::GroupName;

/// Wire form of a ledger, sent to members that (re)join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub parents: Vec<GroupName>,
    pub split_counter: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchyLedger {
    parents: Vec<GroupName>,
    split_counter: u32,
}

impl HierarchyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `name` was already a parent.
    pub fn add_parent(&mut self, name: GroupName) -> bool {
        if self.parents.contains(&name) {
            return false;
        }
        self.parents.push(name);
        true
    }

    /// Returns `false` if `name` was not a parent.
    pub fn remove_parent(&mut self, name: &GroupName) -> bool {
        let before = self.parents.len();
        self.parents.retain(|p| p != name);
        self.parents.len() != before
    }

    pub fn list_parents(&self) -> &[GroupName] {
        &self.parents
    }

    pub fn has_parent(&self, name: &GroupName) -> bool {
        self.parents.contains(name)
    }

    /// Advance the counter by one and return the new value.
    pub fn increment_split_counter(&mut self) -> u32 {
        self.split_counter = self.split_counter.saturating_add(1);
        self.split_counter
    }

    /// Adopt a counter value seen from the supervisor; never moves backwards.
    pub fn observe_split_counter(&mut self, value: u32) -> bool {
        if value > self.split_counter {
            self.split_counter = value;
            true
        } else {
            false
        }
    }

    pub fn split_counter(&self) -> u32 {
        self.split_counter
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            parents: self.parents.clone(),
            split_counter: self.split_counter,
        }
    }

    /// Merge a snapshot from the supervisor: union of parents, max counter.
    pub fn apply_snapshot(&mut self, snapshot: LedgerSnapshot) {
        for parent in snapshot.parents {
            self.add_parent(parent);
        }
        self.observe_split_counter(snapshot.split_counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_are_unique_and_ordered() {
        let mut ledger = HierarchyLedger::new();
        assert!(ledger.add_parent("P".into()));
        assert!(ledger.add_parent("Q".into()));
        assert!(!ledger.add_parent("P".into()));
        assert_eq!(ledger.list_parents(), &[GroupName::from("P"), GroupName::from("Q")]);
    }

    #[test]
    fn remove_absent_parent_is_noop() {
        let mut ledger = HierarchyLedger::new();
        ledger.add_parent("P".into());
        assert!(!ledger.remove_parent(&"Z".into()));
        assert!(ledger.remove_parent(&"P".into()));
        assert!(!ledger.remove_parent(&"P".into()));
        assert!(ledger.list_parents().is_empty());
    }

    #[test]
    fn split_counter_never_decreases() {
        let mut ledger = HierarchyLedger::new();
        assert_eq!(ledger.increment_split_counter(), 1);
        assert_eq!(ledger.increment_split_counter(), 2);
        assert!(!ledger.observe_split_counter(1));
        assert_eq!(ledger.split_counter(), 2);
        assert!(ledger.observe_split_counter(5));
        assert_eq!(ledger.split_counter(), 5);
    }

    #[test]
    fn snapshot_apply_merges() {
        let mut supervisor = HierarchyLedger::new();
        supervisor.add_parent("P".into());
        supervisor.increment_split_counter();
        supervisor.increment_split_counter();

        let mut joiner = HierarchyLedger::new();
        joiner.add_parent("Q".into());
        joiner.apply_snapshot(supervisor.snapshot());

        assert!(joiner.has_parent(&"P".into()));
        assert!(joiner.has_parent(&"Q".into()));
        assert_eq!(joiner.split_counter(), 2);
    }
}
