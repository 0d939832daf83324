use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

mod util;

use self::util::{init_with_event_loop, run_until};

#[test]
fn task_runs_immediately_on_loop_thread() {
    let event_loop = init_with_event_loop();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    event_loop.run_in_loop(move |event_loop| {
        assert!(event_loop.is_in_loop_thread());
        flag.store(true, Ordering::SeqCst);
    });
    // No cycle needed, the caller already is the loop thread.
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn task_from_other_thread_wakes_the_loop() {
    let mut event_loop = init_with_event_loop();
    let ran = Arc::new(AtomicBool::new(false));

    let handle = event_loop.handle();
    let flag = Arc::clone(&ran);
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.run_in_loop(move |event_loop| {
            assert!(event_loop.is_in_loop_thread());
            flag.store(true, Ordering::SeqCst);
        });
    });

    // A single long wait: only the wake up can end it early.
    let start = Instant::now();
    while !ran.load(Ordering::SeqCst) {
        event_loop.run_once(Some(Duration::from_secs(5)))
            .expect("unable to run event loop");
    }
    assert!(start.elapsed() < Duration::from_secs(5));
    worker.join().unwrap();
}

#[test]
fn tasks_run_in_submission_order() {
    let mut event_loop = init_with_event_loop();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handle = event_loop.handle();
    for n in 0..5 {
        let log = Arc::clone(&order);
        handle.run_in_loop(move |_| log.lock().unwrap().push(n));
    }

    assert!(run_until(&mut event_loop, Duration::from_secs(1),
        || order.lock().unwrap().len() == 5));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn quit_from_another_thread_stops_run() {
    let mut event_loop = init_with_event_loop();

    let handle = event_loop.handle();
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    let start = Instant::now();
    event_loop.run().expect("unable to run event loop");
    // `quit` must cut the readiness wait short, not wait out the poll
    // timeout.
    assert!(start.elapsed() < Duration::from_secs(5));
    worker.join().unwrap();
}

#[test]
fn quit_from_task_stops_run() {
    let mut event_loop = init_with_event_loop();

    let handle = event_loop.handle();
    handle.run_in_loop(|event_loop| event_loop.quit());

    event_loop.run().expect("unable to run event loop");
}

#[test]
fn cloned_handles_reach_the_same_loop() {
    let mut event_loop = init_with_event_loop();
    let counter = Arc::new(AtomicUsize::new(0));

    let handle = event_loop.handle();
    let workers: Vec<_> = (0..4).map(|_| {
        let handle = handle.clone();
        let count = Arc::clone(&counter);
        thread::spawn(move || {
            handle.run_in_loop(move |_| {
                drop(count.fetch_add(1, Ordering::SeqCst));
            });
        })
    }).collect();

    assert!(run_until(&mut event_loop, Duration::from_secs(1),
        || counter.load(Ordering::SeqCst) == 4));
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn is_in_loop_thread() {
    let event_loop = init_with_event_loop();
    assert!(event_loop.is_in_loop_thread());

    let handle = event_loop.handle();
    let checked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&checked);
    // Submitted from this thread, but it must still run on the loop thread.
    handle.run_in_loop(move |event_loop| {
        assert!(event_loop.is_in_loop_thread());
        flag.store(true, Ordering::SeqCst);
    });

    let mut event_loop = event_loop;
    assert!(run_until(&mut event_loop, Duration::from_secs(1),
        || checked.load(Ordering::SeqCst)));
}
