//! Per-writer vector clocks and last-writer-wins resolution.

use crate::identity::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from writer to a monotonically non-decreasing version.
/// Absent entries are implicitly zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ClientId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock with a single entry.
    pub fn single(client: &str, version: u64) -> Self {
        let mut clock = Self::new();
        clock.set(client, version);
        clock
    }

    pub fn get(&self, client: &str) -> u64 {
        self.0.get(client).copied().unwrap_or(0)
    }

    pub fn set(&mut self, client: &str, version: u64) {
        self.0.insert(client.to_owned(), version);
    }

    /// Largest version across all writers.
    pub fn max_version(&self) -> u64 {
        self.0.values().copied().max().unwrap_or(0)
    }

    pub fn sum(&self) -> u64 {
        self.0.values().sum()
    }

    /// True when every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other.0.iter().all(|(client, version)| self.get(client) >= *version)
    }

    /// Element-wise max of the two clocks.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        for (client, version) in &other.0 {
            let entry = out.0.entry(client.clone()).or_insert(0);
            *entry = (*entry).max(*version);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.0.iter()
    }
}

/// Resolves a conflict between the current state of a node and a proposed
/// mutation.
///
/// Dominance wins outright; concurrent clocks fall back to the greater
/// version sum, and full ties go to the lexicographically smaller owner.
/// Returns the winning clock together with the winning owner.
pub fn resolve_conflict<'a>(
    current: &'a VectorClock,
    proposed: &'a VectorClock,
    current_owner: &'a str,
    proposed_owner: &'a str,
) -> (&'a VectorClock, &'a str) {
    let current_dominates = current.dominates(proposed);
    let proposed_dominates = proposed.dominates(current);

    if proposed_dominates && !current_dominates {
        return (proposed, proposed_owner);
    }
    if current_dominates && !proposed_dominates {
        return (current, current_owner);
    }
    if !current_dominates && !proposed_dominates {
        let (current_sum, proposed_sum) = (current.sum(), proposed.sum());
        if proposed_sum > current_sum {
            return (proposed, proposed_owner);
        }
        if current_sum > proposed_sum {
            return (current, current_owner);
        }
    }
    if proposed_owner < current_owner {
        (proposed, proposed_owner)
    } else {
        (current, current_owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_entries_are_zero() {
        let clock = VectorClock::single("a", 3);
        assert_eq!(clock.get("a"), 3);
        assert_eq!(clock.get("b"), 0);
    }

    #[test]
    fn dominance_is_entrywise() {
        let mut a = VectorClock::single("a", 2);
        a.set("b", 1);
        let b = VectorClock::single("a", 1);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));

        let c = VectorClock::single("c", 1);
        assert!(!a.dominates(&c));
        assert!(!c.dominates(&a));
    }

    #[test]
    fn merged_takes_entrywise_max() {
        let mut a = VectorClock::single("a", 2);
        a.set("b", 1);
        let mut b = VectorClock::single("a", 1);
        b.set("c", 4);
        let merged = a.merged(&b);
        assert_eq!(merged.get("a"), 2);
        assert_eq!(merged.get("b"), 1);
        assert_eq!(merged.get("c"), 4);
    }

    #[test]
    fn dominant_proposal_wins() {
        let current = VectorClock::single("a", 1);
        let proposed = VectorClock::single("a", 2);
        let (clock, owner) = resolve_conflict(&current, &proposed, "a", "a");
        assert_eq!(clock, &proposed);
        assert_eq!(owner, "a");
    }

    #[test]
    fn concurrent_clocks_fall_back_to_sum() {
        let current = VectorClock::single("a", 1);
        let proposed = VectorClock::single("b", 2);
        let (clock, owner) = resolve_conflict(&current, &proposed, "a", "b");
        assert_eq!(clock, &proposed);
        assert_eq!(owner, "b");
    }

    #[test]
    fn sum_tie_goes_to_smaller_owner() {
        let current = VectorClock::single("bbb", 2);
        let proposed = VectorClock::single("aaa", 2);
        let (clock, owner) = resolve_conflict(&current, &proposed, "bbb", "aaa");
        assert_eq!(clock, &proposed);
        assert_eq!(owner, "aaa");

        let (clock, owner) = resolve_conflict(&proposed, &current, "aaa", "bbb");
        assert_eq!(clock, &proposed);
        assert_eq!(owner, "aaa");
    }

    #[test]
    fn equal_clocks_keep_the_smaller_owner() {
        let current = VectorClock::single("a", 1);
        let proposed = VectorClock::single("a", 1);
        let (_, owner) = resolve_conflict(&current, &proposed, "aaa", "bbb");
        assert_eq!(owner, "aaa");
    }
}
