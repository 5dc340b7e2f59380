//! End-to-end tests over the public arena surface.
//!
//! Cross-process behavior is exercised the way a second process would see
//! it: by attaching to the same segment twice. Two attachments map the
//! object at different base addresses, so handle translation, registry
//! visibility and lock exclusion all take the same paths a real second
//! process would take.
//!
//! Run with tracing output:
//! ```bash
//! RUST_LOG=shmarena=debug cargo test -- --nocapture
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use shmarena::{RootId, SharedArena, ShmError, ShmPath, ShmPtr};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shmarena=info")),
            )
            .try_init();
    });
}

fn unique_path(suffix: &str) -> ShmPath {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    ShmPath::new(format!(
        "/shmarena-test-{}-{}-{}",
        std::process::id(),
        suffix,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
    .unwrap()
}

/// Skip (rather than fail) on hosts where POSIX shared memory is denied.
fn attach_or_skip(path: &ShmPath) -> Option<SharedArena> {
    init_test_tracing();
    match SharedArena::attach(path) {
        Ok(arena) => Some(arena),
        Err(ShmError::Os { source, .. }) if source == rustix::io::Errno::ACCESS => {
            eprintln!("skipping: no shared memory access in this environment");
            None
        }
        Err(err) => panic!("attach failed: {err}"),
    }
}

#[test]
fn test_translation_round_trip_across_attachments() {
    let path = unique_path("xlate");
    let Some(creator) = attach_or_skip(&path) else {
        return;
    };
    let opener = SharedArena::attach(&path).expect("second attach");

    creator.lock();
    let handle = creator.alloc(64).expect("alloc");
    let local = creator.resolve(handle).expect("resolve in creator");
    unsafe {
        local.as_ptr().copy_from_nonoverlapping(b"ping".as_ptr(), 4);
    }
    creator.unlock();

    let remote = opener.resolve(handle).expect("resolve in opener");
    // Two live mappings of the same object cannot overlap, so the same
    // handle must land at a different local address.
    assert_ne!(local.as_ptr(), remote.as_ptr());
    let seen = unsafe { std::slice::from_raw_parts(remote.as_ptr(), 4) };
    assert_eq!(seen, b"ping");

    creator.lock();
    creator.free(handle);
    creator.unlock();
    assert!(!creator.detach());
    assert!(opener.detach());
}

#[test]
fn test_registry_survives_creator_detach() {
    // The creator/opener scenario: P creates, stores a root, detaches
    // while Q is attached; Q reads the identical handle P stored.
    let path = unique_path("registry");
    let Some(p) = attach_or_skip(&path) else {
        return;
    };

    p.lock();
    let root = p.str_dup("named-objects-root").expect("dup");
    let previous = p.set_root(RootId::NamedObjects, root);
    assert!(previous.is_null());
    p.unlock();

    let q = SharedArena::attach(&path).expect("Q attach");
    assert!(!p.detach(), "Q still attached");

    q.lock();
    let seen = q.root(RootId::NamedObjects);
    q.unlock();
    assert_eq!(seen, root);

    let text = q.resolve(seen).expect("resolve root");
    let bytes = unsafe { std::slice::from_raw_parts(text.as_ptr(), 19) };
    assert_eq!(&bytes[..18], b"named-objects-root");
    assert_eq!(bytes[18], 0);

    // The other registry slot is untouched.
    q.lock();
    assert!(q.root(RootId::FileLocks).is_null());
    q.unlock();
    assert!(q.detach());
}

#[test]
fn test_lock_counts_and_cross_thread_exclusion() {
    let path = unique_path("lock");
    let Some(arena) = attach_or_skip(&path) else {
        return;
    };
    let arena = Arc::new(arena);

    assert_eq!(arena.lock(), 1);
    assert_eq!(arena.lock(), 2);
    assert_eq!(arena.unlock(), 1);

    let (ready_tx, ready_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    let contender = {
        let arena = Arc::clone(&arena);
        thread::spawn(move || {
            ready_tx.send(()).unwrap();
            let start = Instant::now();
            let count = arena.lock();
            let waited = start.elapsed();
            arena.unlock();
            tx.send((count, waited)).unwrap();
        })
    };

    // Recursion is per-thread: the second thread must stay blocked until
    // this thread's count reaches zero.
    ready_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());
    assert_eq!(arena.unlock(), 0);

    let (count, waited) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    contender.join().unwrap();
    assert_eq!(count, 1);
    assert!(waited >= Duration::from_millis(40));

    Arc::try_unwrap(arena).ok().expect("sole owner").detach();
}

#[test]
fn test_exhaustion_and_reuse_at_capacity() {
    let path = unique_path("capacity");
    let Some(arena) = ({
        init_test_tracing();
        match SharedArena::attach_with_size(&path, 4096) {
            Ok(arena) => Some(arena),
            Err(ShmError::Os { .. }) => None,
            Err(err) => panic!("attach failed: {err}"),
        }
    }) else {
        return;
    };

    // One block can cover the whole heap minus its own header.
    let capacity = arena.heap_capacity() - 8;

    arena.lock();
    let block = arena.alloc(capacity).expect("fill the heap");
    assert!(arena.alloc(1).is_none(), "heap must be exhausted");
    arena.free(block);
    let again = arena.alloc(capacity).expect("reclaimed after free");
    assert_eq!(again, block);
    arena.free(again);
    arena.unlock();
    arena.detach();
}

#[test]
fn test_free_null_is_noop_via_public_api() {
    let path = unique_path("freenull");
    let Some(arena) = attach_or_skip(&path) else {
        return;
    };
    arena.lock();
    arena.free(ShmPtr::NULL);
    // The heap is still fully intact after the no-op.
    let block = arena.alloc(arena.heap_capacity() - 8).expect("full alloc");
    arena.free(block);
    arena.unlock();
    arena.detach();
}

#[test]
fn test_live_handles_never_alias() {
    let path = unique_path("alias");
    let Some(arena) = attach_or_skip(&path) else {
        return;
    };
    arena.lock();
    let mut live = Vec::new();
    for _ in 0..32 {
        let ptr = arena.alloc(48).expect("alloc");
        assert!(!live.contains(&ptr), "handle aliased while live");
        live.push(ptr);
    }
    for ptr in live {
        arena.free(ptr);
    }
    arena.unlock();
    arena.detach();
}

#[test]
fn test_string_helpers_round_trip() {
    let path = unique_path("strings");
    let Some(arena) = attach_or_skip(&path) else {
        return;
    };
    arena.lock();

    let narrow = arena.str_dup("lock-table").expect("str_dup");
    let bytes = arena.resolve(narrow).expect("resolve");
    let seen = unsafe { std::slice::from_raw_parts(bytes.as_ptr(), 11) };
    assert_eq!(seen, b"lock-table\0");

    let wide: Vec<u16> = "lock-table".encode_utf16().collect();
    let handle = arena.wstr_dup(&wide).expect("wstr_dup");
    let units = arena.resolve(handle).expect("resolve").cast::<u16>();
    let seen = unsafe { std::slice::from_raw_parts(units.as_ptr(), wide.len() + 1) };
    assert_eq!(&seen[..wide.len()], wide.as_slice());
    assert_eq!(seen[wide.len()], 0);

    arena.free(narrow);
    arena.free(handle);
    arena.unlock();
    arena.detach();
}

#[test]
fn test_string_dup_propagates_exhaustion() {
    let path = unique_path("strfail");
    init_test_tracing();
    let Ok(arena) = SharedArena::attach_with_size(&path, 4096) else {
        return;
    };
    let oversized = "x".repeat(arena.heap_capacity() * 2);
    arena.lock();
    assert!(arena.str_dup(&oversized).is_none());
    arena.unlock();
    arena.detach();
}
