//! The "wait for all N parties" synchronization set.
//!
//! A [`CountDown`] tracks the members that have not yet arrived.
//! The same primitive serves three purposes in the orchestrator:
//! resolving DAG dependencies (members are predecessor classes),
//! barrier-synchronizing worker acknowledgements (members are the
//! class's flow nodes), and tracking flow completion (members are the
//! flow's classes). The dual use is intentional; do not specialize it.

use std::collections::HashSet;
use std::hash::Hash;

/// A mutable set of not-yet-arrived members.
#[derive(Debug, Clone, Default)]
pub struct CountDown<T> {
    remaining: HashSet<T>,
}

impl<T: Eq + Hash + Clone> CountDown<T> {
    /// Creates an empty countdown.
    pub fn new() -> Self {
        Self {
            remaining: HashSet::new(),
        }
    }

    /// Registers the arrival of `member`, removing it from the set.
    ///
    /// Returns `true` exactly when the set is empty after the removal.
    /// Arriving with a member that is not outstanding is an invariant
    /// violation.
    pub fn arrive(&mut self, member: &T) -> bool {
        assert!(
            self.remaining.remove(member),
            "member was not part of countdown"
        );
        self.remaining.is_empty()
    }

    /// Probes for emptiness without registering an arrival.
    ///
    /// Used when seeding dependency countdowns: a class with no
    /// predecessors is immediately eligible.
    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Repopulates the set from a reference source.
    ///
    /// Idempotent: resetting twice from the same source yields the same
    /// membership.
    pub fn reset_from<I>(&mut self, members: I)
    where
        I: IntoIterator<Item = T>,
    {
        self.remaining.clear();
        self.remaining.extend(members);
    }

    /// The members that have not yet arrived.
    pub fn remaining(&self) -> &HashSet<T> {
        &self.remaining
    }

    /// The number of members that have not yet arrived.
    pub fn len(&self) -> usize {
        self.remaining.len()
    }
}
