//! String duplication helpers.
//!
//! Convenience wrappers that allocate a block and copy text into it,
//! terminator included, so collaborators can hang names off their shared
//! structures without repeating the copy boilerplate. Both propagate the
//! arena's `None` on heap exhaustion, and both follow the same calling
//! convention as [`SharedArena::alloc`](crate::SharedArena::alloc): the
//! segment lock must be held.

use crate::ptr::ShmPtr;
use crate::segment::SharedArena;

impl SharedArena {
    /// Copies `text` plus a NUL terminator into a fresh block and returns
    /// its handle, or `None` on exhaustion.
    ///
    /// Caller must hold the segment lock.
    pub fn str_dup(&self, text: &str) -> Option<ShmPtr> {
        let bytes = text.as_bytes();
        let ptr = self.alloc(bytes.len() + 1)?;
        let dst = self.resolve(ptr)?;
        // SAFETY: the block holds len + 1 bytes and cannot overlap `text`,
        // which lives outside the freshly allocated payload.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            dst.as_ptr().add(bytes.len()).write(0);
        }
        Some(ptr)
    }

    /// Wide-character variant of [`SharedArena::str_dup`]: copies `text`
    /// plus a NUL code unit. Payloads are at least pointer-aligned, so the
    /// destination is always properly aligned for `u16`.
    ///
    /// Caller must hold the segment lock.
    pub fn wstr_dup(&self, text: &[u16]) -> Option<ShmPtr> {
        let ptr = self.alloc((text.len() + 1) * size_of::<u16>())?;
        let dst = self.resolve(ptr)?.cast::<u16>();
        // SAFETY: the block holds len + 1 code units, aligned for u16, and
        // cannot overlap `text`.
        unsafe {
            std::ptr::copy_nonoverlapping(text.as_ptr(), dst.as_ptr(), text.len());
            dst.as_ptr().add(text.len()).write(0);
        }
        Some(ptr)
    }
}
