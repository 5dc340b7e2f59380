//! Position-independent block handles.
//!
//! A [`ShmPtr`] is the only reference type that may cross a process
//! boundary: a segment-relative offset, meaningless until the owning
//! [`SharedArena`](crate::SharedArena) resolves it against its own mapping
//! base. The type deliberately exposes no arithmetic and no raw offset —
//! leaking a process-local address into shared memory is the central bug
//! this design exists to prevent.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Handle to a block inside a shared segment.
///
/// Produced by [`SharedArena::alloc`](crate::SharedArena::alloc),
/// invalidated by [`SharedArena::free`](crate::SharedArena::free). The same
/// handle resolves to a different virtual address in every attached
/// process. Dereferencing a freed handle is undefined behavior.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ShmPtr(u64);

impl ShmPtr {
    /// The reserved null handle. Offset 0 always falls inside the segment
    /// header, so no live block can collide with it.
    pub const NULL: ShmPtr = ShmPtr(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn from_offset(offset: u64) -> Self {
        Self(offset)
    }

    pub(crate) fn offset(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ShmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ShmPtr(NULL)")
        } else {
            write!(f, "ShmPtr({:#x})", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sentinel() {
        assert!(ShmPtr::NULL.is_null());
        assert!(ShmPtr::default().is_null());
        assert!(!ShmPtr::from_offset(0x400).is_null());
    }

    #[test]
    fn test_serde_round_trip() {
        // Handles serialize as their raw offset so collaborators can embed
        // them in control messages.
        let ptr = ShmPtr::from_offset(0x1234);
        let json = serde_json::to_string(&ptr).unwrap();
        assert_eq!(json, "4660");
        let back: ShmPtr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ptr);
    }
}
