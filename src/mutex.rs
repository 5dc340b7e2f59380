//! Cross-process recursive lock.
//!
//! [`SegmentMutex`] lives inside the segment header and serializes every
//! mutation of the header, the registry and the heap across all attached
//! processes. It is a three-state futex lock (unlocked / locked /
//! contended) with recursion keyed on the calling thread of the calling
//! process: re-acquisition by the holder bumps a depth counter without
//! touching the futex, while any other thread — including another thread of
//! the holding process — blocks.
//!
//! There is no timeout and no cancellation. A holder that terminates
//! without releasing blocks every other participant forever; that is an
//! accepted property of the coarse-grained design and is documented on the
//! crate root rather than papered over with retries.

use std::sync::atomic::{AtomicU32, Ordering};

use rustix::thread::futex;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
/// Locked with at least one (possible) sleeper on the futex.
const CONTENDED: u32 = 2;

/// Returns the (pid, tid) pair identifying the current thread of the
/// current process, the granularity at which lock recursion is scoped.
pub(crate) fn current_ids() -> (u32, u32) {
    let pid = rustix::process::getpid().as_raw_nonzero().get() as u32;
    let tid = rustix::thread::gettid().as_raw_nonzero().get() as u32;
    (pid, tid)
}

/// Recursive cross-process mutex embedded in the segment header.
///
/// All-zero bytes are a valid unlocked state, so a freshly `ftruncate`d
/// segment needs no explicit lock initialization.
#[repr(C)]
pub(crate) struct SegmentMutex {
    word: AtomicU32,
    owner_pid: AtomicU32,
    owner_tid: AtomicU32,
    depth: AtomicU32,
}

impl SegmentMutex {
    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
            owner_pid: AtomicU32::new(0),
            owner_tid: AtomicU32::new(0),
            depth: AtomicU32::new(0),
        }
    }

    /// Acquires the lock, blocking indefinitely if another thread of any
    /// process holds it. Returns the new recursion depth (1 on first
    /// entry).
    pub fn acquire(&self) -> u32 {
        let (pid, tid) = current_ids();

        // Only the thread that stored these values can observe both equal
        // to its own ids, so a racy read is sufficient for the recursion
        // check.
        if self.owner_pid.load(Ordering::Relaxed) == pid
            && self.owner_tid.load(Ordering::Relaxed) == tid
        {
            let depth = self.depth.load(Ordering::Relaxed) + 1;
            self.depth.store(depth, Ordering::Relaxed);
            return depth;
        }

        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Slow path: announce a sleeper by forcing the word to
            // CONTENDED, then wait until the swap observes UNLOCKED. The
            // wait returns EAGAIN when the word changed before the kernel
            // queued us and EINTR on signals; both just mean re-check.
            while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
                let _ = futex::wait(&self.word, futex::Flags::empty(), CONTENDED, None);
            }
        }

        self.owner_pid.store(pid, Ordering::Relaxed);
        self.owner_tid.store(tid, Ordering::Relaxed);
        self.depth.store(1, Ordering::Relaxed);
        1
    }

    /// Releases one level of the lock and returns the remaining depth. The
    /// underlying futex is released, and one waiter woken, only when the
    /// depth reaches 0.
    ///
    /// Calling this without holding the lock is a caller contract
    /// violation; it is not detected in release builds.
    pub fn release(&self) -> u32 {
        debug_assert!(
            self.held_by_current_thread(),
            "segment lock released by a non-holder"
        );

        let depth = self.depth.load(Ordering::Relaxed).saturating_sub(1);
        self.depth.store(depth, Ordering::Relaxed);
        if depth > 0 {
            return depth;
        }

        self.owner_pid.store(0, Ordering::Relaxed);
        self.owner_tid.store(0, Ordering::Relaxed);
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            let _ = futex::wake(&self.word, futex::Flags::empty(), 1);
        }
        0
    }

    pub fn held_by_current_thread(&self) -> bool {
        let (pid, tid) = current_ids();
        self.depth.load(Ordering::Relaxed) > 0
            && self.owner_pid.load(Ordering::Relaxed) == pid
            && self.owner_tid.load(Ordering::Relaxed) == tid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_recursion_depth_counts() {
        let mutex = SegmentMutex::new();
        assert_eq!(mutex.acquire(), 1);
        assert_eq!(mutex.acquire(), 2);
        assert_eq!(mutex.release(), 1);
        assert!(mutex.held_by_current_thread());
        assert_eq!(mutex.release(), 0);
        assert!(!mutex.held_by_current_thread());
    }

    #[test]
    fn test_other_thread_blocks_until_depth_zero() {
        let mutex = Arc::new(SegmentMutex::new());
        assert_eq!(mutex.acquire(), 1);
        assert_eq!(mutex.acquire(), 2);

        let (ready_tx, ready_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        let contender = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                ready_tx.send(()).unwrap();
                let start = Instant::now();
                let depth = mutex.acquire();
                let waited = start.elapsed();
                mutex.release();
                tx.send((depth, waited)).unwrap();
            })
        };

        // The contender must still be blocked after the first release: the
        // holder's depth is 1, not 0.
        ready_rx.recv().unwrap();
        assert_eq!(mutex.release(), 1);
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        assert_eq!(mutex.release(), 0);
        let (depth, waited) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        contender.join().unwrap();
        assert_eq!(depth, 1);
        assert!(waited >= Duration::from_millis(40));
    }
}
