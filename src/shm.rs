//! POSIX shared memory mapping service.
//!
//! Thin wrapper over `shm_open`/`mmap` used by the segment lifecycle
//! manager. Unlike a creator-owns-cleanup scheme, segment teardown here is
//! decided by the registration table in the header (last detacher
//! unlinks), so creating and opening are separate entry points and
//! [`unlink`] is an explicit operation rather than a `Drop` side effect —
//! [`Mapping`] only ever unmaps.

use std::fmt;
use std::ptr::{NonNull, null_mut};

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

/// Result alias for segment operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Errors surfaced while attaching to or tearing down a segment.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `shm_open`, `ftruncate`, `mmap`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Os {
        op: &'static str,
        path: String,
        source: io::Errno,
    },

    /// The mapped object is not an arena segment.
    #[error("`{path}` is not an arena segment")]
    BadMagic { path: String },

    /// The segment was created by an incompatible crate version.
    #[error("`{path}` has segment format version {found}, expected {expected}")]
    Version {
        path: String,
        expected: u32,
        found: u32,
    },

    /// The header's recorded size disagrees with the mapped size.
    #[error("`{path}` header records {header} bytes but the mapping is {mapped}")]
    SizeMismatch {
        path: String,
        header: u64,
        mapped: usize,
    },

    /// The creating process did not finish initialization in time.
    #[error("timed out waiting for `{path}` to be initialized")]
    InitTimeout { path: String },

    /// Every registration slot in the segment is taken.
    #[error("process registration table of `{path}` is full")]
    ProcessTableFull { path: String },
}

impl ShmError {
    pub(crate) fn os(op: &'static str, path: &ShmPath, source: io::Errno) -> Self {
        Self::Os {
            op,
            path: path.to_string(),
            source,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// Validated POSIX shared memory object name.
///
/// For portable `shm_open` use the name must start with `/`, contain no
/// further slashes, and stay within NAME_MAX bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let reason = if !path.starts_with('/') {
            Some("path must start with '/'")
        } else if path[1..].contains('/') {
            Some("path must not contain additional '/' characters")
        } else if path.len() > POSIX_NAME_MAX {
            Some("path length must be <= 255 bytes")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ShmError::InvalidPath { path, reason }),
            None => Ok(Self(path)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShmPath({})", self.0)
    }
}

/// A mapped view of a shared memory object.
///
/// Unmaps on drop; never unlinks. The same object mapped twice (even within
/// one process) yields distinct, non-overlapping base addresses, which is
/// what makes offset handles the only portable reference.
pub(crate) struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the pointer refers to a shared mapping, not thread-local state,
// and all mutation of its contents goes through atomics or is serialized by
// the segment lock.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(fd: &impl rustix::fd::AsFd, len: usize, path: &ShmPath) -> Result<Self> {
        // SAFETY: fresh mapping of a valid fd; mmap returns page-aligned
        // addresses not overlapping any existing Rust object.
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }
        .map_err(|err| ShmError::os("mmap", path, err))?;

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };
        Ok(Self { ptr, len })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the region mapped in `map`.
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Creates the backing object with exclusive-create semantics and maps it.
///
/// Returns `Ok(None)` when the object already exists — the caller loses the
/// creation race and should open instead. The `O_EXCL` flag is what makes
/// the "is this the first attach" decision atomic across processes. On any
/// later failure the half-created object is unlinked before returning.
pub(crate) fn create_exclusive(path: &ShmPath, size: usize) -> Result<Option<Mapping>> {
    let fd = match shm::open(
        path.as_str(),
        shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
        Mode::RUSR | Mode::WUSR,
    ) {
        Ok(fd) => fd,
        Err(err) if err == io::Errno::EXIST => return Ok(None),
        Err(err) => return Err(ShmError::os("shm_open", path, err)),
    };

    if let Err(err) = ftruncate(&fd, size as u64) {
        drop(fd);
        let _ = shm::unlink(path.as_str());
        return Err(ShmError::os("ftruncate", path, err));
    }

    match Mapping::map(&fd, size, path) {
        Ok(map) => Ok(Some(map)),
        Err(err) => {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            Err(err)
        }
    }
}

/// Opens and maps an existing backing object at its recorded size.
///
/// Returns `Ok(None)` when the object does not exist yet, or exists but has
/// not been sized by its creator — both are transient states during a
/// concurrent first attach, and the caller retries within its deadline.
pub(crate) fn open_existing(path: &ShmPath) -> Result<Option<Mapping>> {
    let fd = match shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty()) {
        Ok(fd) => fd,
        Err(err) if err == io::Errno::NOENT => return Ok(None),
        Err(err) => return Err(ShmError::os("shm_open", path, err)),
    };

    let stat = fstat(&fd).map_err(|err| ShmError::os("fstat", path, err))?;
    if stat.st_size <= 0 {
        return Ok(None);
    }

    Mapping::map(&fd, stat.st_size as usize, path).map(Some)
}

/// Removes the backing object's name. Later attaches will create a fresh
/// segment; existing mappings stay valid until unmapped.
pub(crate) fn unlink(path: &ShmPath) {
    let _ = shm::unlink(path.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_accepts_valid_names() {
        assert!(ShmPath::new("/valid").is_ok());
        assert!(ShmPath::new("/valid-name_123").is_ok());
    }

    #[test]
    fn test_path_rejects_missing_leading_slash() {
        assert!(matches!(
            ShmPath::new("no-slash"),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_path_rejects_inner_slash() {
        assert!(matches!(
            ShmPath::new("/a/b"),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_path_rejects_overlong_names() {
        let long = format!("/{}", "x".repeat(POSIX_NAME_MAX));
        assert!(matches!(
            ShmPath::new(long),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_open_missing_object_is_none() {
        let path = ShmPath::new(format!("/shmarena-missing-{}", std::process::id())).unwrap();
        let _ = shm::unlink(path.as_str());
        match open_existing(&path) {
            Ok(mapping) => assert!(mapping.is_none()),
            Err(ShmError::Os { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("skipping: no shared memory access in this environment");
            }
            Err(err) => panic!("open failed: {err}"),
        }
    }
}
