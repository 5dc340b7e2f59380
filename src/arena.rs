//! Free-list heap inside the mapped segment.
//!
//! First-fit allocation over a singly linked list of free blocks threaded
//! through the heap by offset, with block splitting on allocation and
//! physical-adjacency coalescing on free. The list is in no particular
//! order (freed blocks are pushed at the head); contention is expected to
//! be bootstrap-scale, so simplicity wins over fragmentation optimality.
//!
//! Every operation here must run with the segment lock held. That is a
//! calling convention, not a runtime-checked invariant — the public API on
//! [`SharedArena`](crate::SharedArena) documents it the same way.
//!
//! List links are offsets, never pointers, and each link is validated
//! against the segment bounds before it is dereferenced, so a corrupted
//! list degrades into allocation failure instead of a wild read.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::layout::{ALLOC_ALIGN, BLOCK_HDR, FreeBlock, HEAP_START, MIN_BLOCK, SegmentHeader};
use crate::ptr::ShmPtr;

/// Allocator view over a mapped segment.
pub(crate) struct Heap<'a> {
    base: NonNull<u8>,
    header: &'a SegmentHeader,
}

impl<'a> Heap<'a> {
    pub fn new(base: NonNull<u8>, header: &'a SegmentHeader) -> Self {
        Self { base, header }
    }

    /// Initializes the free list as a single block spanning the whole heap.
    /// Called once, by the creating process, before the segment is
    /// published.
    pub fn format(&self) {
        let size = self.segment_size() - HEAP_START;
        // SAFETY: HEAP_START is in bounds (the lifecycle manager enforces a
        // minimum segment size) and nothing else references the heap yet.
        unsafe {
            let block = self.free_block(HEAP_START);
            (*block).size = size;
            (*block).next = 0;
        }
        self.header.free_head.store(HEAP_START, Ordering::Relaxed);
    }

    /// Allocates `size` bytes, rounded up to [`ALLOC_ALIGN`], and returns a
    /// handle to the payload. Returns `None` when no free block is large
    /// enough — the segment never grows, so exhaustion is an expected,
    /// recoverable outcome for the caller.
    pub fn alloc(&self, size: usize) -> Option<ShmPtr> {
        let payload = (size.max(1) as u64).checked_add(ALLOC_ALIGN - 1)? & !(ALLOC_ALIGN - 1);
        let need = payload.checked_add(BLOCK_HDR)?;

        let mut prev = 0u64;
        let mut cur = self.header.free_head.load(Ordering::Relaxed);
        while cur != 0 {
            if !self.valid_block_offset(cur) {
                tracing::error!(offset = cur, "free list link out of segment bounds");
                break;
            }
            // SAFETY: offset validated against segment bounds above.
            let (cur_size, cur_next) = unsafe {
                let block = self.free_block(cur);
                ((*block).size, (*block).next)
            };
            if cur_size >= need {
                let remainder = cur_size - need;
                if remainder >= MIN_BLOCK {
                    // Split: the tail of the block goes back on the list in
                    // the position the original occupied.
                    let rest = cur + need;
                    // SAFETY: rest + remainder == cur + cur_size, which was
                    // a valid in-bounds block.
                    unsafe {
                        let block = self.free_block(rest);
                        (*block).size = remainder;
                        (*block).next = cur_next;
                        (*self.free_block(cur)).size = need;
                    }
                    self.set_next(prev, rest);
                } else {
                    self.set_next(prev, cur_next);
                }
                return Some(ShmPtr::from_offset(cur + BLOCK_HDR));
            }
            prev = cur;
            cur = cur_next;
        }

        tracing::debug!(request = size, "shared heap exhausted");
        None
    }

    /// Returns a block to the free list, merging it with any physically
    /// adjacent free neighbors. Freeing NULL is a no-op; freeing an already
    /// freed or foreign handle is undefined (only cheap bounds checks stand
    /// between the caller and corruption).
    pub fn free(&self, ptr: ShmPtr) {
        if ptr.is_null() {
            return;
        }
        let offset = ptr.offset().wrapping_sub(BLOCK_HDR);
        if !self.valid_block_offset(offset) {
            tracing::error!(?ptr, "free of a handle outside the heap, ignored");
            return;
        }
        // SAFETY: offset validated above; the size field is present in both
        // allocated and free blocks.
        let mut size = unsafe { (*self.free_block(offset)).size };
        let mut start = offset;
        if !self.valid_extent(start, size) {
            tracing::error!(?ptr, size, "free of a block with a corrupt size, ignored");
            return;
        }

        // A freed block can touch at most one free predecessor and one free
        // successor; each pass unlinks one of them.
        while let Some((adj_off, adj_size)) = self.take_adjacent(start, size) {
            start = start.min(adj_off);
            size += adj_size;
        }

        // SAFETY: [start, start + size) is the union of in-bounds blocks.
        unsafe {
            let block = self.free_block(start);
            (*block).size = size;
            (*block).next = self.header.free_head.load(Ordering::Relaxed);
        }
        self.header.free_head.store(start, Ordering::Relaxed);
    }

    /// Finds, unlinks and returns a free block physically adjacent to
    /// `[start, start + size)`, if any.
    fn take_adjacent(&self, start: u64, size: u64) -> Option<(u64, u64)> {
        let end = start + size;
        let mut prev = 0u64;
        let mut cur = self.header.free_head.load(Ordering::Relaxed);
        while cur != 0 {
            if !self.valid_block_offset(cur) {
                tracing::error!(offset = cur, "free list link out of segment bounds");
                return None;
            }
            // SAFETY: offset validated against segment bounds above.
            let (cur_size, cur_next) = unsafe {
                let block = self.free_block(cur);
                ((*block).size, (*block).next)
            };
            if cur + cur_size == start || cur == end {
                self.set_next(prev, cur_next);
                return Some((cur, cur_size));
            }
            prev = cur;
            cur = cur_next;
        }
        None
    }

    /// Repoints the list link that leads to `prev`'s successor; `prev == 0`
    /// means the list head.
    fn set_next(&self, prev: u64, next: u64) {
        if prev == 0 {
            self.header.free_head.store(next, Ordering::Relaxed);
        } else {
            // SAFETY: `prev` was bounds-validated by the caller's walk.
            unsafe {
                (*self.free_block(prev)).next = next;
            }
        }
    }

    fn segment_size(&self) -> u64 {
        self.header.segment_size
    }

    fn valid_block_offset(&self, offset: u64) -> bool {
        offset >= HEAP_START
            && offset % ALLOC_ALIGN == 0
            && offset.checked_add(MIN_BLOCK).is_some_and(|end| end <= self.segment_size())
    }

    fn valid_extent(&self, offset: u64, size: u64) -> bool {
        size >= MIN_BLOCK
            && size % ALLOC_ALIGN == 0
            && offset.checked_add(size).is_some_and(|end| end <= self.segment_size())
    }

    /// # Safety
    ///
    /// `offset` must satisfy [`Heap::valid_block_offset`].
    unsafe fn free_block(&self, offset: u64) -> *mut FreeBlock {
        // SAFETY: caller guarantees offset + MIN_BLOCK is within the
        // mapping, and ALLOC_ALIGN satisfies FreeBlock's alignment.
        unsafe { self.base.as_ptr().add(offset as usize).cast::<FreeBlock>() }
    }
}
