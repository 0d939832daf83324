//! Readiness backend build on `epoll(7)`.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use std::{fmt, io, mem, ptr};

use log::{error, trace};

use crate::channel::Channel;
use crate::event::Ready;
use crate::poller::{ChannelMap, Poller};

use super::duration_to_millis;

/// Maximum number of events retrieved in a single poll.
const EVENTS_CAP: usize = 512;

/// Channel was never added to the epoll set.
const INDEX_NEW: i8 = -1;
/// Channel is in the epoll set.
const INDEX_ADDED: i8 = 1;
/// Channel was in the epoll set, but its interest dropped to empty.
const INDEX_DETACHED: i8 = 2;

/// Readiness selector backed by `epoll(7)`, level-triggered.
///
/// This is the default backend.
pub struct EpollPoller {
    epfd: RawFd,
    channels: ChannelMap,
}

impl EpollPoller {
    /// Create a new epoll instance.
    pub fn new() -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(EpollPoller {
                epfd,
                channels: ChannelMap::new(),
            })
        }
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) -> io::Result<()> {
        let mut epoll_event = libc::epoll_event {
            events: to_epoll_events(channel),
            u64: channel.fd() as u64,
        };
        let epoll_event: *mut libc::epoll_event = if op == libc::EPOLL_CTL_DEL {
            ptr::null_mut()
        } else {
            &mut epoll_event
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, channel.fd(), epoll_event) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<Channel>) -> io::Result<Instant> {
        let mut ep_events: [libc::epoll_event; EVENTS_CAP] = unsafe { mem::zeroed() };
        let timeout_ms = timeout.map(duration_to_millis).unwrap_or(-1);

        let n_events = unsafe {
            libc::epoll_wait(
                self.epfd,
                ep_events.as_mut_ptr(),
                EVENTS_CAP as libc::c_int,
                timeout_ms,
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
            n => {
                for ep_event in ep_events[..n as usize].iter() {
                    let fd = ep_event.u64 as RawFd;
                    match self.channels.get(fd) {
                        Some(channel) => {
                            channel.set_received(from_epoll_events(ep_event.events));
                            ready.push(channel.clone());
                        }
                        // Can happen when a channel is removed while its
                        // event is already queued in the kernel.
                        None => trace!("epoll returned unknown fd={}, ignoring", fd),
                    }
                }
                Ok(now)
            }
        }
    }

    fn update_channel(&mut self, channel: &Channel) -> io::Result<()> {
        let index = channel.index();
        trace!(
            "updating channel: fd={}, interest={:?}, index={}",
            channel.fd(),
            channel.interest(),
            index
        );
        match index {
            INDEX_NEW | INDEX_DETACHED => {
                if index == INDEX_NEW {
                    self.channels.insert(channel);
                }
                if channel.is_idle() {
                    channel.set_index(INDEX_DETACHED);
                    Ok(())
                } else {
                    self.ctl(libc::EPOLL_CTL_ADD, channel)?;
                    channel.set_index(INDEX_ADDED);
                    Ok(())
                }
            }
            INDEX_ADDED => {
                if channel.is_idle() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel)?;
                    channel.set_index(INDEX_DETACHED);
                    Ok(())
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel)
                }
            }
            index => unreachable!("invalid channel index: {}", index),
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        trace!("removing channel: fd={}", channel.fd());
        assert!(channel.is_idle(), "removing channel with live interest");
        if channel.index() == INDEX_ADDED {
            if let Err(err) = self.ctl(libc::EPOLL_CTL_DEL, channel) {
                error!("error removing fd={} from epoll: {}", channel.fd(), err);
            }
        }
        channel.set_index(INDEX_NEW);
        self.channels.remove(channel);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.contains(channel)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } == -1 {
            let err = io::Error::last_os_error();
            error!("error closing epoll instance: {}", err);
        }
    }
}

impl fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EpollPoller")
            .field("epfd", &self.epfd)
            .finish()
    }
}

fn to_epoll_events(channel: &Channel) -> u32 {
    let mut events = (libc::EPOLLPRI | libc::EPOLLRDHUP) as u32;
    let interest = channel.interest();
    if interest.is_readable() {
        events |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn from_epoll_events(epoll: u32) -> Ready {
    let mut readiness = Ready::EMPTY;
    if contains_flag(epoll, libc::EPOLLIN | libc::EPOLLPRI) {
        readiness |= Ready::READABLE;
    }
    if contains_flag(epoll, libc::EPOLLOUT) {
        readiness |= Ready::WRITABLE;
    }
    if contains_flag(epoll, libc::EPOLLERR) {
        readiness |= Ready::ERROR;
    }
    if contains_flag(epoll, libc::EPOLLRDHUP | libc::EPOLLHUP) {
        readiness |= Ready::CLOSED;
    }
    readiness
}

fn contains_flag(flags: u32, flag: libc::c_int) -> bool {
    (flags & flag as u32) != 0
}
