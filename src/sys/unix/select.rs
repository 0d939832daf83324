//! Readiness backend build on `select(2)`.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

use log::trace;

use crate::channel::Channel;
use crate::event::Ready;
use crate::poller::{ChannelMap, Poller};

/// Readiness selector backed by `select(2)`.
///
/// Alternative to the default [`EpollPoller`]. It rebuilds the descriptor
/// sets from the registered channels on every call, so it scales poorly and
/// caps descriptors at `FD_SETSIZE`.
///
/// [`EpollPoller`]: crate::poller::EpollPoller
#[derive(Debug, Default)]
pub struct SelectPoller {
    channels: ChannelMap,
}

impl SelectPoller {
    /// Create a new `select(2)` based poller.
    pub fn new() -> SelectPoller {
        SelectPoller {
            channels: ChannelMap::new(),
        }
    }
}

impl Poller for SelectPoller {
    fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<Channel>) -> io::Result<Instant> {
        let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { mem::zeroed() };
        let mut errorfds: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut errorfds);
        }

        let mut max_fd: RawFd = -1;
        for channel in self.channels.iter() {
            let interest = channel.interest();
            if interest.is_empty() {
                continue;
            }
            let fd = channel.fd();
            unsafe {
                if interest.is_readable() {
                    libc::FD_SET(fd, &mut readfds);
                }
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut writefds);
                }
                // Watch every active descriptor for error conditions.
                libc::FD_SET(fd, &mut errorfds);
            }
            if fd > max_fd {
                max_fd = fd;
            }
        }

        let mut timeval = timeout.map(|timeout| libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: libc::suseconds_t::from(timeout.subsec_micros()),
        });
        let timeval_ptr: *mut libc::timeval = match timeval.as_mut() {
            Some(timeval) => timeval,
            None => ptr::null_mut(),
        };

        let n_events = unsafe {
            libc::select(
                max_fd + 1,
                &mut readfds,
                &mut writefds,
                &mut errorfds,
                timeval_ptr,
            )
        };
        let now = Instant::now();
        match n_events {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    // Poll got interrupted by a signal, no events this cycle.
                    Ok(now)
                } else {
                    Err(err)
                }
            }
            0 => Ok(now),
            _ => {
                for channel in self.channels.iter() {
                    let fd = channel.fd();
                    let mut readiness = Ready::EMPTY;
                    unsafe {
                        if libc::FD_ISSET(fd, &mut readfds) {
                            readiness |= Ready::READABLE;
                        }
                        if libc::FD_ISSET(fd, &mut writefds) {
                            readiness |= Ready::WRITABLE;
                        }
                        if libc::FD_ISSET(fd, &mut errorfds) {
                            readiness |= Ready::ERROR;
                        }
                    }
                    if !readiness.is_empty() {
                        channel.set_received(readiness);
                        ready.push(channel.clone());
                    }
                }
                Ok(now)
            }
        }
    }

    fn update_channel(&mut self, channel: &Channel) -> io::Result<()> {
        trace!(
            "updating channel: fd={}, interest={:?}",
            channel.fd(),
            channel.interest()
        );
        if channel.fd() as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file descriptor exceeds FD_SETSIZE",
            ));
        }
        // The interest mask lives on the channel itself and the sets are
        // rebuilt each poll, registration is all that is needed here.
        self.channels.insert(channel);
        Ok(())
    }

    fn remove_channel(&mut self, channel: &Channel) {
        trace!("removing channel: fd={}", channel.fd());
        assert!(channel.is_idle(), "removing channel with live interest");
        self.channels.remove(channel);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains(channel)
    }
}
