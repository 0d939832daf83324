//! Platform specific code.
//!
//! Provides the following to the rest of the crate:
//!
//! * `Awakener`: cross-thread wake primitive for the event loop.
//! * `EpollPoller` and `SelectPoller`: the `Poller` backends.
//! * `timer_fd`: OS-level timer integrated as a readable descriptor.
//! * listening socket operations used by `Acceptor`.

#[cfg(target_os = "linux")]
mod unix;

#[cfg(target_os = "linux")]
pub use self::unix::*;

// The timer integration is timerfd based and the default poller is epoll;
// a port starts with replacements for those in a new sys submodule.
#[cfg(not(target_os = "linux"))]
compile_error!("boreas only supports Linux");
