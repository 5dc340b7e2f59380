//! In-segment data layout.
//!
//! The shared segment is a fixed [`SegmentHeader`] at offset 0 followed by
//! the heap. Every structure here is `#[repr(C)]` so that independently
//! compiled processes agree on the layout, and every field mutated after
//! segment creation is an atomic: the segment lock provides the
//! happens-before edges, relaxed atomics keep the accesses themselves
//! race-free.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ SegmentHeader (64-byte aligned)              │
//! │   magic, version, segment_size               │
//! │   init marker                                │
//! │   SegmentMutex (futex word, owner, depth)    │
//! │   free list head                             │
//! │   registry root slots                        │
//! │   process registration table                 │
//! ├──────────────────────────────────────────────┤
//! │ Heap: allocated and free blocks              │
//! │   free block:      [size][next][...]         │
//! │   allocated block: [size][payload...]        │
//! └──────────────────────────────────────────────┘
//! ```

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::mutex::SegmentMutex;
use crate::registry::RootId;

/// Magic bytes identifying an arena segment.
pub(crate) const MAGIC: [u8; 8] = *b"SHMARENA";

/// Segment format version. Bumped whenever the header layout changes,
/// including any extension of the registry slot array.
pub(crate) const FORMAT_VERSION: u32 = 1;

const INIT_MAGIC: u64 = 0x4152_4E41_494E_4954; // "ARNAINIT" in ASCII

/// Allocation granularity: payload sizes and block offsets are multiples of
/// the platform pointer alignment.
pub(crate) const ALLOC_ALIGN: u64 = size_of::<u64>() as u64;

/// Bytes of block header preceding an allocated payload (the `size` field).
pub(crate) const BLOCK_HDR: u64 = size_of::<u64>() as u64;

/// Smallest block the heap will track: enough for a full free-block header.
pub(crate) const MIN_BLOCK: u64 = size_of::<FreeBlock>() as u64;

/// Capacity of the process registration table.
pub(crate) const MAX_ATTACHED: usize = 64;

/// Segment size used by [`crate::SharedArena::attach`].
pub(crate) const DEFAULT_SEGMENT_SIZE: usize = 256 * 1024;

/// First heap offset. Offset 0 is always inside the header, which is what
/// makes the NULL handle unambiguous.
pub(crate) const HEAP_START: u64 = size_of::<SegmentHeader>() as u64;

/// Header at offset 0 of every segment.
///
/// `magic`, `version` and `segment_size` are written once during creation,
/// before the `init` marker is published, and are read-only afterwards.
/// Everything else is mutated only while the segment lock is held.
#[repr(C, align(64))]
pub(crate) struct SegmentHeader {
    pub magic: [u8; 8],
    pub version: u32,
    _reserved: u32,
    /// Total segment size in bytes, header included.
    pub segment_size: u64,
    /// Publication marker: holds [`INIT_MAGIC`] once the creator has
    /// finished initializing the segment.
    init: AtomicU64,
    /// The cross-process lock serializing all segment mutation.
    pub lock: SegmentMutex,
    /// Offset of the first free block, 0 when the heap is fully allocated.
    pub free_head: AtomicU64,
    /// Registry root slots, one per [`RootId`]. 0 is the NULL handle.
    pub roots: [AtomicU64; RootId::COUNT],
    /// One pid per attachment, 0 marks an empty slot.
    pub procs: [AtomicU32; MAX_ATTACHED],
}

// The header must keep the heap aligned, and offset 0 must stay inside it.
const _: () = assert!(size_of::<SegmentHeader>() == 384);
const _: () = assert!(HEAP_START % ALLOC_ALIGN == 0 && HEAP_START > 0);

/// Header of a block on the free list.
///
/// `size` counts header and payload and is always a multiple of
/// [`ALLOC_ALIGN`]. An *allocated* block keeps only the `size` field; its
/// payload starts where `next` is, which is why [`MIN_BLOCK`] is the
/// allocation floor.
#[repr(C)]
pub(crate) struct FreeBlock {
    pub size: u64,
    pub next: u64,
}

const _: () = assert!(size_of::<FreeBlock>() as u64 == 2 * BLOCK_HDR);

/// Reasons a mapped header fails validation, reported by [`SegmentHeader::validate`].
pub(crate) enum HeaderIssue {
    BadMagic,
    Version { found: u32 },
    Size { header: u64 },
}

impl SegmentHeader {
    /// Writes a fresh header into zero-filled, newly created segment memory.
    ///
    /// Only the non-zero fields are written: the lock, free list, registry
    /// slots and registration table all start as zeroes, and `ftruncate`
    /// guarantees the backing store is zero-filled. The `init` marker stays
    /// unset until [`SegmentHeader::publish`].
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - `base` points to at least `len` bytes of zero-filled, 64-byte
    ///   aligned memory with no other live references
    /// - `len` is at least `HEAP_START + MIN_BLOCK`
    pub unsafe fn init_at(base: NonNull<u8>, len: usize) {
        let header = base.as_ptr().cast::<SegmentHeader>();
        unsafe {
            std::ptr::addr_of_mut!((*header).magic).write(MAGIC);
            std::ptr::addr_of_mut!((*header).version).write(FORMAT_VERSION);
            std::ptr::addr_of_mut!((*header).segment_size).write(len as u64);
        }
    }

    /// Marks initialization complete. Release store pairs with the acquire
    /// load in [`SegmentHeader::is_initialized`] so joining processes see a
    /// fully built header and heap.
    pub fn publish(&self) {
        self.init.store(INIT_MAGIC, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.init.load(Ordering::Acquire) == INIT_MAGIC
    }

    /// Checks a freshly mapped, initialized header against this process's
    /// expectations before the segment is used.
    pub fn validate(&self, mapped_len: usize) -> Result<(), HeaderIssue> {
        if self.magic != MAGIC {
            return Err(HeaderIssue::BadMagic);
        }
        if self.version != FORMAT_VERSION {
            return Err(HeaderIssue::Version {
                found: self.version,
            });
        }
        if self.segment_size != mapped_len as u64 {
            return Err(HeaderIssue::Size {
                header: self.segment_size,
            });
        }
        Ok(())
    }
}
