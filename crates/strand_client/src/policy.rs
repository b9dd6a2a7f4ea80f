//! Entry filters, terminal checkers and the exception policy.

use std::collections::HashSet;

use crate::entry::ResultEntry;

/// Per-entry admission predicate applied between the reply handler and the
/// subscribers of an async result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Filter {
    /// Successful entries only, terminal acks dropped.
    #[default]
    Positive,
    /// Failed entries only.
    Negative,
    /// Everything except terminal acks.
    All,
    /// Everything, acks included.
    AllWithAck,
    /// Final replies of every transaction, whatever their status.
    AllFinal,
}

impl Filter {
    pub fn admits(self, entry: &ResultEntry) -> bool {
        match self {
            Filter::Positive => entry.status() == 0 && !entry.is_ack(),
            Filter::Negative => entry.status() != 0,
            Filter::All => !entry.is_ack(),
            Filter::AllWithAck => true,
            Filter::AllFinal => entry.is_final(),
        }
    }
}

/// Terminal success predicate over the set of delivered entries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Checker {
    /// Terminal outcome is whatever the transport produced.
    NoCheck,
    /// At least one entry succeeded.
    #[default]
    AtLeastOne,
    /// Every group produced at least one success.
    All,
    /// More than half of the groups produced a success.
    Quorum,
}

impl Checker {
    /// Decide the aggregate outcome from per-group success observations.
    pub fn satisfied(self, success_groups: &HashSet<u32>, total_groups: usize) -> bool {
        match self {
            Checker::NoCheck => true,
            Checker::AtLeastOne => !success_groups.is_empty(),
            Checker::All => success_groups.len() >= total_groups.max(1),
            Checker::Quorum => success_groups.len() * 2 > total_groups,
        }
    }
}

/// Bitset gating where a failed terminal outcome is raised as an error.
/// Pure async observers never see a raised error regardless of this set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionSet(pub u32);

impl ExceptionSet {
    pub const AT_START: u32 = 1 << 0;
    pub const AT_WAIT: u32 = 1 << 1;
    pub const AT_GET: u32 = 1 << 2;
    pub const AT_ITERATOR_END: u32 = 1 << 3;

    pub const NO_EXCEPTIONS: ExceptionSet = ExceptionSet(0);
    pub const DEFAULT: ExceptionSet =
        ExceptionSet(Self::AT_START | Self::AT_WAIT | Self::AT_GET | Self::AT_ITERATOR_END);

    pub fn at_wait(self) -> bool {
        self.0 & Self::AT_WAIT != 0
    }

    pub fn at_get(self) -> bool {
        self.0 & Self::AT_GET != 0
    }

    pub fn at_iterator_end(self) -> bool {
        self.0 & Self::AT_ITERATOR_END != 0
    }
}

impl Default for ExceptionSet {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Result policy captured from the session when a dispatch is created.
#[derive(Clone, Debug, Default)]
pub struct Policy {
    pub filter: Filter,
    pub checker: Checker,
    pub exceptions: ExceptionSet,
    /// Group population the checker judges against.
    pub total_groups: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checker_quorum_is_strict_majority() {
        let mut groups = HashSet::new();
        groups.insert(1);
        assert!(!Checker::Quorum.satisfied(&groups, 2));
        assert!(!Checker::Quorum.satisfied(&groups, 3));
        groups.insert(2);
        assert!(Checker::Quorum.satisfied(&groups, 3));
        assert!(Checker::All.satisfied(&groups, 2));
        assert!(!Checker::All.satisfied(&groups, 3));
    }

    #[test]
    fn no_check_passes_empty() {
        assert!(Checker::NoCheck.satisfied(&HashSet::new(), 3));
        assert!(!Checker::AtLeastOne.satisfied(&HashSet::new(), 3));
    }
}
