//! A single threaded, reactor style event loop library.
//!
//! The core of the library is the [`EventLoop`], which waits on a set of file
//! descriptors and dispatches their readiness to per-descriptor callbacks.
//! Around it sit a small number of building blocks:
//!
//!  * [`Channel`]: binds one file descriptor to its readiness callbacks.
//!  * [`Poller`]: the pluggable readiness backend, implemented by
//!    [`EpollPoller`] (the default) and [`SelectPoller`].
//!  * [`Acceptor`]: a listening socket which turns readiness into accepted
//!    connections.
//!  * timers: deadline based callbacks scheduled via [`EventLoop::run_at`]
//!    and friends, multiplexed onto a single OS timer.
//!  * [`LoopHandle`]: a cloneable, thread safe handle to marshal work onto
//!    the loop thread from other threads.
//!
//! An `EventLoop` is owned and driven by a single thread. Everything that
//! touches the loop's state must happen on that thread; other threads
//! interact with the loop exclusively through a [`LoopHandle`], which queues
//! a closure and wakes the loop so it runs promptly.
//!
//! [`EpollPoller`]: poller::EpollPoller
//! [`SelectPoller`]: poller::SelectPoller
//!
//! # Examples
//!
//! The example below runs a callback half a second in the future and then
//! stops the loop.
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use std::time::Duration;
//!
//! use boreas::EventLoop;
//!
//! let mut event_loop = EventLoop::new()?;
//!
//! let handle = event_loop.handle();
//! event_loop.run_after(Duration::from_millis(500), move || {
//!     println!("timer fired");
//!     handle.quit();
//! });
//!
//! // Blocks until `quit` is called.
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```

#![warn(anonymous_parameters,
        bare_trait_objects,
        missing_debug_implementations,
        missing_docs,
        trivial_casts,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
        unused_results,
        variant_size_differences,
)]

// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]

// Disallow warnings in examples, we want to set a good example after all.
#![doc(test(attr(deny(warnings))))]

mod acceptor;
mod channel;
mod event;
mod event_loop;
mod sys;
mod timer_queue;

pub mod poller;

pub use crate::acceptor::Acceptor;
pub use crate::channel::{Channel, LifeToken};
pub use crate::event::Ready;
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::timer_queue::TimerId;

#[doc(no_inline)]
pub use crate::poller::Poller;
