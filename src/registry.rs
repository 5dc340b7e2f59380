//! Registry root identifiers.
//!
//! The segment header carries one root slot per [`RootId`], used by
//! higher-level collaborators to bootstrap their shared structures. The set
//! is closed: adding an identifier grows the header table and therefore
//! requires a segment format version bump.

use serde::{Deserialize, Serialize};

/// Identifier of a registry root slot.
///
/// The registry stores opaque handles; it never interprets the structures
/// they point to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum RootId {
    /// Root of the named-object table.
    NamedObjects = 0,
    /// Root of the file-lock table.
    FileLocks = 1,
}

impl RootId {
    pub(crate) const COUNT: usize = 2;

    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_dense() {
        let ids = [RootId::NamedObjects, RootId::FileLocks];
        assert_eq!(ids.len(), RootId::COUNT);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(id.slot(), i);
        }
    }
}
