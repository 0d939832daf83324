//! Collection of testing utilities.

// Not all functions are used in all tests, causing warnings of unused functions
// while other tests are actually using them.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use boreas::EventLoop;

/// Allowed margin for deadlines to be overrun.
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(10);

/// Initialise the test setup, things like logging etc.
pub fn init() {
    let env = env_logger::Env::new().filter("LOG_LEVEL");
    // Logger could already be set, so we ignore the result.
    drop(env_logger::try_init_from_env(env));
}

/// Initialise the test setup (same as `init`) and create an `EventLoop`.
pub fn init_with_event_loop() -> EventLoop {
    init();
    EventLoop::new().expect("unable to create event loop")
}

/// Run `event_loop` cycles, with a small per cycle timeout, until `condition`
/// returns true or `duration` has passed. Returns whether the condition was
/// met.
pub fn run_until<F>(event_loop: &mut EventLoop, duration: Duration, mut condition: F) -> bool
    where F: FnMut() -> bool,
{
    let end = Instant::now() + duration;
    while !condition() {
        if Instant::now() >= end {
            return false;
        }
        event_loop.run_once(Some(Duration::from_millis(10)))
            .expect("unable to run event loop");
    }
    true
}

/// Run `event_loop` cycles for (at least) `duration`.
pub fn run_for(event_loop: &mut EventLoop, duration: Duration) {
    let end = Instant::now() + duration;
    while Instant::now() < end {
        event_loop.run_once(Some(Duration::from_millis(10)))
            .expect("unable to run event loop");
    }
}
