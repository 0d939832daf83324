//! The pluggable readiness backend.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::Channel;

pub use crate::sys::EpollPoller;
pub use crate::sys::SelectPoller;

/// A readiness backend, answering which registered [`Channel`]s are ready.
///
/// The [`EventLoop`] drives exactly one poller and is agnostic to which
/// implementation it is given: any backend satisfying this contract can be
/// plugged in via [`EventLoop::with_poller`]. Two implementations are
/// provided, [`EpollPoller`] (the default) and [`SelectPoller`]
/// (`select(2)` based).
///
/// All methods are loop-thread-only; a `Poller` lives inside the loop's
/// internals which are not `Send`, so cross-thread calls are impossible by
/// construction.
///
/// [`EventLoop`]: crate::EventLoop
/// [`EventLoop::with_poller`]: crate::EventLoop::with_poller
pub trait Poller: fmt::Debug {
    /// Wait for readiness on the registered channels.
    ///
    /// Blocks up to `timeout`, or forever on `None`, or until at least one
    /// registered descriptor becomes ready, whichever comes first. Every
    /// ready channel has its received mask set and is appended to `ready`,
    /// in backend order. Returns the timestamp taken when the wait ended;
    /// on timeout or interruption `ready` is left empty.
    fn poll(&mut self, timeout: Option<Duration>, ready: &mut Vec<Channel>) -> io::Result<Instant>;

    /// Reconcile the backend's watch set with `channel`'s current interest
    /// mask, registering, modifying or unwatching as needed. Called every
    /// time a channel's interest changes.
    fn update_channel(&mut self, channel: &Channel) -> io::Result<()>;

    /// Unregister a previously registered channel.
    ///
    /// The channel's interest must already be empty. Removing a channel
    /// that was never registered, or a different channel than the one
    /// registered for the descriptor, fails an assertion.
    fn remove_channel(&mut self, channel: &Channel);

    /// Returns true if exactly `channel` is registered for its descriptor.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// The descriptor to channel mapping shared by the poller backends.
///
/// Holds at most one channel per descriptor and checks registration
/// identity: a removal or lookup must name the exact channel that was
/// registered, anything else indicates a lifetime bug and fails an
/// assertion.
#[derive(Debug, Default)]
pub(crate) struct ChannelMap {
    channels: HashMap<RawFd, Channel>,
}

impl ChannelMap {
    pub(crate) fn new() -> ChannelMap {
        ChannelMap { channels: HashMap::new() }
    }

    /// Register `channel`, a no-op if this exact channel is already
    /// registered. Registering a second channel for the same descriptor is
    /// a programming error.
    pub(crate) fn insert(&mut self, channel: &Channel) {
        let prev = self.channels.insert(channel.fd(), channel.clone());
        if let Some(prev) = prev {
            assert!(prev.same_channel(channel),
                "fd={} is already registered with a different channel", channel.fd());
        }
    }

    /// Unregister `channel`. The exact channel must be registered.
    pub(crate) fn remove(&mut self, channel: &Channel) {
        match self.channels.remove(&channel.fd()) {
            Some(registered) => assert!(registered.same_channel(channel),
                "removing fd={} which is registered with a different channel", channel.fd()),
            None => panic!("removing fd={} which is not registered", channel.fd()),
        }
    }

    pub(crate) fn contains(&self, channel: &Channel) -> bool {
        self.channels.get(&channel.fd())
            .map_or(false, |registered| registered.same_channel(channel))
    }

    pub(crate) fn get(&self, fd: RawFd) -> Option<&Channel> {
        self.channels.get(&fd)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }
}
