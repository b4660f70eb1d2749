//! Fault injection: a per-driver table of scripted failures.
//!
//! A [FaultTable] holds, for each instrumented instance, a set of rows that
//! say "the next N times this instance is consulted while in state S (or in
//! any state, for a wildcard row), return an injected failure." The
//! transport consults the table around interruptible calls via
//! [FaultTable::consult]; test code populates it via [FaultTable::inject_break].

use crate::err::INJECTED_ERROR;
use std::collections::HashMap;

/// A fault row's key: either a specific state id, or the wildcard row that
/// matches regardless of the instance's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Key {
    State(u32),
    Wildcard,
}

/// A table of `(instance, state-or-wildcard) -> remaining-failure-count`,
/// scoped to one driver.
#[derive(Debug, Default)]
pub struct FaultTable {
    instances: HashMap<u64, HashMap<Key, u32>>,
}

impl FaultTable {
    /// Creates an empty fault table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` to the remaining-failure counter for `instance` in
    /// `state` (or the wildcard row if `state` is `None`), creating the row
    /// if it did not already exist. A call with `count == 0` is a no-op.
    pub fn inject_break(&mut self, instance: u64, count: u32, state: Option<u32>) {
        if count == 0 {
            return;
        }
        let key = state.map_or(Key::Wildcard, Key::State);
        let row = self.instances.entry(instance).or_default();
        *row.entry(key).or_insert(0) += count;
    }

    /// Consults the table on behalf of `pre_fail`/`post_fail`: given
    /// `instance`'s current state (if any has been reported), decrements
    /// and returns the injected failure for the matching row, preferring a
    /// specific-state row over the wildcard row. Returns `0` if no row
    /// matches. A row's entry is removed once its counter reaches zero;
    /// once an instance's last row is gone, its entry is removed too.
    pub fn consult(&mut self, instance: u64, current_state: Option<u32>) -> i32 {
        let Some(row) = self.instances.get_mut(&instance) else {
            return 0;
        };
        let specific = current_state.map(Key::State);
        let chosen = match specific {
            Some(k) if row.contains_key(&k) => Some(k),
            _ if row.contains_key(&Key::Wildcard) => Some(Key::Wildcard),
            _ => None,
        };
        let result = match chosen {
            None => 0,
            Some(key) => {
                let remaining = row.get_mut(&key).expect("chosen key just checked present");
                *remaining -= 1;
                if *remaining == 0 {
                    row.remove(&key);
                }
                INJECTED_ERROR
            }
        };
        if row.is_empty() {
            self.instances.remove(&instance);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_rows_returns_zero() {
        let mut t = FaultTable::new();
        assert_eq!(0, t.consult(1, Some(5)));
        assert_eq!(0, t.consult(1, None));
    }

    #[test]
    fn specific_state_counter_exhausts() {
        let mut t = FaultTable::new();
        t.inject_break(1, 2, Some(5));
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(5)));
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(5)));
        assert_eq!(0, t.consult(1, Some(5)));
    }

    #[test]
    fn wildcard_matches_any_state() {
        let mut t = FaultTable::new();
        t.inject_break(1, 1, None);
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(99)));
        assert_eq!(0, t.consult(1, Some(99)));
    }

    #[test]
    fn specific_state_consulted_before_wildcard() {
        let mut t = FaultTable::new();
        t.inject_break(1, 1, Some(5));
        t.inject_break(1, 1, None);
        // The specific-state row should be drained first.
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(5)));
        // Wildcard row is untouched, and still applies to any state.
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(7)));
        assert_eq!(0, t.consult(1, Some(5)));
    }

    #[test]
    fn repeated_inject_break_adds_to_existing_counter() {
        let mut t = FaultTable::new();
        t.inject_break(1, 2, Some(5));
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(5)));
        t.inject_break(1, 1, Some(5));
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(5)));
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(5)));
        assert_eq!(0, t.consult(1, Some(5)));
    }

    #[test]
    fn other_instances_are_unaffected() {
        let mut t = FaultTable::new();
        t.inject_break(1, 1, Some(5));
        assert_eq!(0, t.consult(2, Some(5)));
        assert_eq!(INJECTED_ERROR, t.consult(1, Some(5)));
    }

    #[test]
    fn instance_entry_removed_once_last_row_drained() {
        let mut t = FaultTable::new();
        t.inject_break(1, 1, Some(5));
        assert!(t.instances.contains_key(&1));
        t.consult(1, Some(5));
        assert!(!t.instances.contains_key(&1));
    }
}
