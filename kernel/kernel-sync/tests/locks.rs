use kernel_sync::{IrqLock, SpinLock};
use std::panic;

#[derive(Default)]
struct Counters {
    allocated: u32,
    freed: u32,
}

#[test]
fn guard_releases_on_drop() {
    let lock = SpinLock::new(Counters::default());

    {
        let mut guard = lock.lock();
        guard.allocated = 3;
    }
    // The previous guard must have released; otherwise this would spin
    // forever.
    let mut guard = lock.lock();
    guard.freed = 3;
    assert_eq!(guard.allocated, guard.freed);
}

#[test]
fn try_lock_fails_only_while_held() {
    let lock = SpinLock::new(0u8);

    let held = lock.try_lock().expect("uncontended try_lock");
    assert!(lock.try_lock().is_none(), "second acquisition while held");
    drop(held);
    assert!(lock.try_lock().is_some());
}

#[test]
fn with_lock_returns_the_closure_value() {
    let lock = SpinLock::new(Counters::default());
    let outstanding = lock.with_lock(|c| {
        c.allocated += 5;
        c.freed += 2;
        c.allocated - c.freed
    });
    assert_eq!(outstanding, 3);
    assert_eq!(lock.with_lock(|c| c.allocated), 5);
}

#[test]
fn contended_counting_loses_nothing() {
    use std::sync::{Arc, Barrier};
    use std::thread;

    let threads = 4;
    let rounds = 2_000;

    let lock = Arc::new(SpinLock::new(Counters::default()));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..rounds {
                    lock.with_lock(|c| c.allocated += 1);
                    thread::yield_now();
                    lock.with_lock(|c| c.freed += 1);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (allocated, freed) = lock.with_lock(|c| (c.allocated, c.freed));
    assert_eq!(allocated as usize, threads * rounds);
    assert_eq!(allocated, freed);
}

#[test]
fn poisoning_free_lock_survives_panics() {
    let lock = SpinLock::new(7u32);

    let caught = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        lock.with_lock(|v| {
            *v = 11;
            panic!("interrupted mid-update");
        });
    }));
    assert!(caught.is_err());

    // No poisoning: the guard's drop released the lock during unwinding and
    // the partial update stays visible, as it would in the kernel.
    assert_eq!(lock.with_lock(|v| *v), 11);
}

#[test]
fn irq_lock_round_trip() {
    // Hosted, the interrupt mask is a no-op; the exclusion and the release
    // on drop still have to hold.
    let lock = IrqLock::new(Counters::default());
    lock.with_lock(|c| c.allocated = 1);
    assert_eq!(lock.lock().allocated, 1);

    let mut owned = IrqLock::new(0u32);
    *owned.get_mut() += 9;
    assert_eq!(owned.with_lock(|v| *v), 9);
}
