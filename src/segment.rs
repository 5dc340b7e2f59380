//! Segment lifecycle and the public arena surface.
//!
//! [`SharedArena`] is the handle one process holds on the shared segment:
//! attaching creates the backing store if this process is first (decided by
//! exclusive-create semantics on the store's name) or maps the existing
//! store and registers, and detaching deregisters and destroys the store
//! when the last registration disappears.
//!
//! # Example
//!
//! ```no_run
//! use shmarena::{RootId, SharedArena, ShmPath};
//!
//! let path = ShmPath::new("/my-arena")?;
//! let arena = SharedArena::attach(&path)?;
//!
//! arena.lock();
//! if let Some(block) = arena.alloc(64) {
//!     arena.set_root(RootId::NamedObjects, block);
//! }
//! arena.unlock();
//!
//! arena.detach();
//! # Ok::<(), shmarena::ShmError>(())
//! ```
//!
//! # Calling convention
//!
//! Every mutation of the segment — allocation, free, registry writes, and
//! by convention registry reads — must happen between [`SharedArena::lock`]
//! and [`SharedArena::unlock`]. The arena does not self-enforce this; the
//! narrow API mirrors the coarse-grained design it implements.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::Duration;

use minstant::Instant;

use crate::arena::Heap;
use crate::layout::{DEFAULT_SEGMENT_SIZE, HEAP_START, HeaderIssue, MIN_BLOCK, SegmentHeader};
use crate::mutex::current_ids;
use crate::ptr::ShmPtr;
use crate::registry::RootId;
use crate::shm::{self, Mapping, Result, ShmError, ShmPath};

/// Bound on how long attach waits for a concurrent creator to size and
/// initialize the segment.
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

const PAGE_SIZE: usize = 4096;

/// One process's attachment to a shared arena segment.
///
/// Dropping the arena performs the same best-effort cleanup as
/// [`SharedArena::detach`].
pub struct SharedArena {
    map: Mapping,
    path: ShmPath,
    detached: bool,
}

impl SharedArena {
    /// Attaches to the segment named by `path`, creating it with the
    /// default size if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails when the backing store cannot be created or mapped, when an
    /// existing segment has an incompatible format or version, when its
    /// creator does not finish initialization within the attach timeout, or
    /// when the registration table is full. Failure leaves nothing mapped
    /// or registered.
    pub fn attach(path: &ShmPath) -> Result<Self> {
        Self::attach_with_size(path, DEFAULT_SEGMENT_SIZE)
    }

    /// Attaches like [`SharedArena::attach`], creating the segment with the
    /// given size (rounded up to a whole page) if this process is first.
    /// The size is fixed for the segment's lifetime; if the segment already
    /// exists, its recorded size wins and `size` is ignored.
    pub fn attach_with_size(path: &ShmPath, size: usize) -> Result<Self> {
        let size = size
            .max(HEAP_START as usize + MIN_BLOCK as usize)
            .next_multiple_of(PAGE_SIZE);

        let start = Instant::now();
        loop {
            if let Some(map) = shm::create_exclusive(path, size)? {
                return Self::first_attach(map, path);
            }
            if let Some(map) = shm::open_existing(path)? {
                return Self::join_attach(map, path, start);
            }
            // The name vanished (or is not yet sized) between the exclusive
            // create losing and the open: a creator is mid-initialization
            // or a last detacher just unlinked. Retry within the deadline.
            if start.elapsed() >= INIT_TIMEOUT {
                return Err(ShmError::InitTimeout {
                    path: path.to_string(),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// This process won the creation race: build the header and heap, take
    /// registration slot 0, then publish.
    fn first_attach(map: Mapping, path: &ShmPath) -> Result<Self> {
        // SAFETY: a freshly created mapping is exclusive (the object cannot
        // be observed initialized before `publish`), zero-filled by
        // ftruncate, page aligned, and at least a page long.
        unsafe { SegmentHeader::init_at(map.base(), map.len()) };
        let arena = Self {
            map,
            path: path.clone(),
            detached: false,
        };
        let header = arena.header();
        arena.heap().format();
        header.procs[0].store(current_ids().0, Ordering::Relaxed);
        header.publish();
        tracing::info!(path = %path, size = arena.map.len(), "created shared arena segment");
        Ok(arena)
    }

    /// The segment already existed: wait out the creator, validate, and
    /// register under the lock.
    fn join_attach(map: Mapping, path: &ShmPath, start: Instant) -> Result<Self> {
        // SAFETY: the mapping covers at least the header (segment sizes are
        // page-rounded) and the header type is valid for any bit pattern
        // we can observe before the init marker.
        let header = unsafe { &*map.base().as_ptr().cast::<SegmentHeader>() };

        while !header.is_initialized() {
            if start.elapsed() >= INIT_TIMEOUT {
                return Err(ShmError::InitTimeout {
                    path: path.to_string(),
                });
            }
            std::hint::spin_loop();
        }

        header.validate(map.len()).map_err(|issue| match issue {
            HeaderIssue::BadMagic => ShmError::BadMagic {
                path: path.to_string(),
            },
            HeaderIssue::Version { found } => ShmError::Version {
                path: path.to_string(),
                expected: crate::layout::FORMAT_VERSION,
                found,
            },
            HeaderIssue::Size { header } => ShmError::SizeMismatch {
                path: path.to_string(),
                header,
                mapped: map.len(),
            },
        })?;

        let pid = current_ids().0;
        header.lock.acquire();
        let slot = header
            .procs
            .iter()
            .find(|slot| slot.load(Ordering::Relaxed) == 0);
        if let Some(slot) = slot {
            slot.store(pid, Ordering::Relaxed);
        }
        header.lock.release();

        if slot.is_none() {
            // The error drops `map`, which only unmaps: nothing to undo.
            return Err(ShmError::ProcessTableFull {
                path: path.to_string(),
            });
        }
        tracing::debug!(path = %path, pid, "registered with shared arena segment");
        Ok(Self {
            map,
            path: path.clone(),
            detached: false,
        })
    }

    /// Detaches from the segment: removes this attachment's registration
    /// and, if it was the last one, destroys the backing store. Returns
    /// whether this attachment was the last.
    pub fn detach(mut self) -> bool {
        self.detached = true;
        self.release_registration()
    }

    fn release_registration(&self) -> bool {
        let header = self.header();
        let pid = current_ids().0;

        header.lock.acquire();
        let mine = header
            .procs
            .iter()
            .find(|slot| slot.load(Ordering::Relaxed) == pid);
        if let Some(slot) = mine {
            slot.store(0, Ordering::Relaxed);
        }
        let last = !header
            .procs
            .iter()
            .any(|slot| slot.load(Ordering::Relaxed) != 0);
        header.lock.release();

        if last {
            shm::unlink(&self.path);
            tracing::info!(path = %self.path, "destroyed shared arena segment");
        } else {
            tracing::debug!(path = %self.path, pid, "deregistered from shared arena segment");
        }
        last
    }

    /// Acquires the segment lock; blocks indefinitely while another thread
    /// of any attached process holds it. Recursive within the calling
    /// thread. Returns the new lock count.
    pub fn lock(&self) -> u32 {
        self.header().lock.acquire()
    }

    /// Releases one level of the segment lock and returns the remaining
    /// count. Calling without holding the lock is a contract violation.
    pub fn unlock(&self) -> u32 {
        self.header().lock.release()
    }

    /// Allocates a block and returns its handle, or `None` when no free
    /// block is large enough. The segment never grows; exhaustion is
    /// recoverable by freeing other blocks.
    ///
    /// Caller must hold the segment lock.
    pub fn alloc(&self, size: usize) -> Option<ShmPtr> {
        self.heap().alloc(size)
    }

    /// Frees a block. `ShmPtr::NULL` is a no-op. The handle (and every copy
    /// of it in any process) is invalid afterwards; double frees are
    /// undefined.
    ///
    /// Caller must hold the segment lock.
    pub fn free(&self, ptr: ShmPtr) {
        self.heap().free(ptr)
    }

    /// Resolves a handle to an address in this process's mapping. NULL
    /// resolves to `None`; so does anything outside the segment bounds.
    /// The same handle resolves to a different address in every process.
    pub fn resolve(&self, ptr: ShmPtr) -> Option<NonNull<u8>> {
        if ptr.is_null() || ptr.offset() >= self.map.len() as u64 {
            return None;
        }
        // SAFETY: offset is within the mapping and base is non-null.
        Some(unsafe { NonNull::new_unchecked(self.map.base().as_ptr().add(ptr.offset() as usize)) })
    }

    /// Inverse of [`SharedArena::resolve`] for addresses inside this
    /// process's mapping of the segment.
    pub(crate) fn handle_of(&self, addr: NonNull<u8>) -> Option<ShmPtr> {
        let offset = (addr.as_ptr() as usize).checked_sub(self.map.base().as_ptr() as usize)?;
        (offset < self.map.len()).then(|| ShmPtr::from_offset(offset as u64))
    }

    /// Reads a registry root slot.
    ///
    /// By convention the caller holds the segment lock, so the read is
    /// consistent with any bootstrap sequence that sets the root.
    pub fn root(&self, id: RootId) -> ShmPtr {
        ShmPtr::from_offset(self.header().roots[id.slot()].load(Ordering::Relaxed))
    }

    /// Writes a registry root slot and returns the previous handle. Slots
    /// are pre-allocated in the header, so this cannot fail.
    ///
    /// Caller must hold the segment lock.
    pub fn set_root(&self, id: RootId, ptr: ShmPtr) -> ShmPtr {
        ShmPtr::from_offset(self.header().roots[id.slot()].swap(ptr.offset(), Ordering::Relaxed))
    }

    /// Total heap bytes managed by the arena (excluding the header).
    /// The largest single allocation is one block header smaller.
    pub fn heap_capacity(&self) -> usize {
        self.map.len() - HEAP_START as usize
    }

    pub fn path(&self) -> &ShmPath {
        &self.path
    }

    fn header(&self) -> &SegmentHeader {
        // SAFETY: attach validated (or created) a header at offset 0, and
        // the mapping outlives `self`.
        unsafe { &*self.map.base().as_ptr().cast::<SegmentHeader>() }
    }

    fn heap(&self) -> Heap<'_> {
        Heap::new(self.map.base(), self.header())
    }
}

impl Drop for SharedArena {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.release_registration();
        }
    }
}
