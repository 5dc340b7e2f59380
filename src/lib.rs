//! Cross-process shared memory arena.
//!
//! A single POSIX shared memory segment, mapped by any number of otherwise
//! unrelated processes, hosting a heap of relocatable blocks addressed by
//! position-independent [`ShmPtr`] handles. On top of the heap sit a small
//! registry of named root handles — the bootstrap points for higher-level
//! shared structures such as named-object and file-lock tables — and a
//! recursive cross-process lock serializing all mutation.
//!
//! # Overview
//!
//! - [`SharedArena`] — attach/detach lifecycle, allocation, translation,
//!   locking and the root registry
//! - [`ShmPtr`] — segment-relative block handle, the only reference type
//!   that is valid across process boundaries
//! - [`RootId`] — the closed set of registry root identifiers
//! - [`ShmPath`] — validated POSIX shared memory object name
//!
//! # Basic usage
//!
//! ```no_run
//! use shmarena::{RootId, SharedArena, ShmPath};
//!
//! let path = ShmPath::new("/registry-arena")?;
//!
//! // Process A: first attach creates and formats the segment.
//! let arena = SharedArena::attach(&path)?;
//! arena.lock();
//! let root = arena.str_dup("bootstrap").expect("heap exhausted");
//! arena.set_root(RootId::NamedObjects, root);
//! arena.unlock();
//!
//! // Process B: maps the same segment; the handle read from the registry
//! // is identical, the address it resolves to is not.
//! let other = SharedArena::attach(&path)?;
//! other.lock();
//! let same_root = other.root(RootId::NamedObjects);
//! assert_eq!(same_root, root);
//! other.unlock();
//! # Ok::<(), shmarena::ShmError>(())
//! ```
//!
//! # Calling convention
//!
//! Heap and registry operations must run with the segment lock held
//! ([`SharedArena::lock`] / [`SharedArena::unlock`]). This is a documented
//! convention, not a runtime-checked invariant.
//!
//! # Accepted limitations
//!
//! Operators should know about two failure modes this design does not
//! repair:
//!
//! - A process that exits while holding the segment lock blocks every
//!   other participant indefinitely; there is no lock timeout.
//! - A process that exits without detaching leaves its registration slot
//!   and its allocations behind; the segment is kept alive until an
//!   external watchdog intervenes.

mod arena;
mod layout;
mod mutex;
mod ptr;
mod registry;
mod segment;
mod shm;
mod strings;

pub use ptr::ShmPtr;
pub use registry::RootId;
pub use segment::SharedArena;
pub use shm::{Result, ShmError, ShmPath};
