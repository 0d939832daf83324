use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use boreas::TimerId;

mod util;

use self::util::{init_with_event_loop, run_for, run_until, TIMEOUT_MARGIN};

#[test]
fn one_shot_timer() {
    let mut event_loop = init_with_event_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    let start = Instant::now();
    drop(event_loop.run_after(Duration::from_millis(20), move || {
        drop(count.fetch_add(1, Ordering::SeqCst));
    }));

    assert!(run_until(&mut event_loop, Duration::from_secs(1),
        || fired.load(Ordering::SeqCst) == 1));
    assert!(start.elapsed() >= Duration::from_millis(20) - TIMEOUT_MARGIN);

    // One-shot means exactly once.
    run_for(&mut event_loop, Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn same_deadline_fires_in_insertion_order() {
    let mut event_loop = init_with_event_loop();
    let order = Arc::new(Mutex::new(Vec::new()));
    let when = Instant::now() + Duration::from_millis(20);

    let log = Arc::clone(&order);
    drop(event_loop.run_at(when, move || log.lock().unwrap().push(1)));
    let log = Arc::clone(&order);
    drop(event_loop.run_at(when, move || log.lock().unwrap().push(2)));

    assert!(run_until(&mut event_loop, Duration::from_secs(1),
        || order.lock().unwrap().len() == 2));
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn timer_ids_are_distinct() {
    let event_loop = init_with_event_loop();
    let when = Instant::now() + Duration::from_secs(10);
    let first = event_loop.run_at(when, || {});
    let second = event_loop.run_at(when, || {});
    assert_ne!(first, second);
    event_loop.cancel(first);
    event_loop.cancel(second);
}

#[test]
fn repeating_timer() {
    let mut event_loop = init_with_event_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    let id = event_loop.run_every(Duration::from_millis(20), move || {
        drop(count.fetch_add(1, Ordering::SeqCst));
    });

    assert!(run_until(&mut event_loop, Duration::from_secs(2),
        || fired.load(Ordering::SeqCst) >= 3));

    event_loop.cancel(id);
    let fired_at_cancel = fired.load(Ordering::SeqCst);
    run_for(&mut event_loop, Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), fired_at_cancel);
}

#[test]
fn cancel_before_firing() {
    let mut event_loop = init_with_event_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    let id = event_loop.run_after(Duration::from_millis(30), move || {
        drop(count.fetch_add(1, Ordering::SeqCst));
    });
    event_loop.cancel(id);

    run_for(&mut event_loop, Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_is_idempotent() {
    let mut event_loop = init_with_event_loop();
    let id = event_loop.run_after(Duration::from_millis(10), || {});

    event_loop.cancel(id);
    // Cancelling again, or after retirement, must be a silent no-op.
    event_loop.cancel(id);
    run_for(&mut event_loop, Duration::from_millis(30));
    event_loop.cancel(id);
}

#[test]
fn repeating_timer_cancelled_from_its_own_callback() {
    let mut event_loop = init_with_event_loop();
    let fired = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let handle = event_loop.handle();
    let count = Arc::clone(&fired);
    let slot = Arc::clone(&id_slot);
    let id = event_loop.run_every(Duration::from_millis(10), move || {
        drop(count.fetch_add(1, Ordering::SeqCst));
        if let Some(id) = *slot.lock().unwrap() {
            handle.cancel(id);
        }
    });
    *id_slot.lock().unwrap() = Some(id);

    assert!(run_until(&mut event_loop, Duration::from_secs(1),
        || fired.load(Ordering::SeqCst) >= 1));
    run_for(&mut event_loop, Duration::from_millis(60));
    // The callback cancelled its own timer on the first firing.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn deadline_in_the_past_fires_promptly() {
    let mut event_loop = init_with_event_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    drop(event_loop.run_at(Instant::now() - Duration::from_secs(1), move || {
        drop(count.fetch_add(1, Ordering::SeqCst));
    }));

    assert!(run_until(&mut event_loop, Duration::from_millis(500),
        || fired.load(Ordering::SeqCst) == 1));
}

#[test]
fn timer_scheduled_from_another_thread() {
    let mut event_loop = init_with_event_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let handle = event_loop.handle();
    let count = Arc::clone(&fired);
    let worker = thread::spawn(move || {
        drop(handle.run_after(Duration::from_millis(20), move || {
            drop(count.fetch_add(1, Ordering::SeqCst));
        }));
    });

    assert!(run_until(&mut event_loop, Duration::from_secs(1),
        || fired.load(Ordering::SeqCst) == 1));
    worker.join().unwrap();
}
