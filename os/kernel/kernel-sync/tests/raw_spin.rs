use kernel_sync::RawSpin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn try_lock_semantics() {
    let l = RawSpin::new();
    assert!(!l.is_locked());

    // first try_lock should succeed, the second must fail while held
    assert!(l.try_lock());
    assert!(l.is_locked());
    assert!(!l.try_lock());

    unsafe { l.unlock() };
    assert!(!l.is_locked());
    assert!(l.try_lock());
    unsafe { l.unlock() };
}

#[test]
fn contended_sections_are_exclusive() {
    let threads = 8; // keep small for determinism
    let iters = 5_000;

    let lock = Arc::new(RawSpin::new());
    let in_cs = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let total = Arc::clone(&total);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.lock();
                let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                assert_eq!(prev, 0, "mutual exclusion violated");
                total.fetch_add(1, Ordering::Relaxed);
                in_cs.fetch_sub(1, Ordering::SeqCst);
                unsafe { lock.unlock() };

                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(total.load(Ordering::SeqCst), threads * iters);
    assert!(!lock.is_locked());
}
