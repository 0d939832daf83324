//! The binding of a file descriptor to an interest mask and callbacks.

use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use log::{error, trace};

use crate::event::Ready;
use crate::event_loop::LoopInner;

/// Callback invoked for writable, error and closed events.
type EventCallback = Box<dyn FnMut()>;

/// Callback invoked for readable events, receives the poll timestamp.
type ReadEventCallback = Box<dyn FnMut(Instant)>;

/// A `Channel` binds one file descriptor to an interest mask and up to four
/// callbacks (read, write, close and error).
///
/// A `Channel` never owns the descriptor and makes no system calls itself; it
/// only records state and informs its [`EventLoop`]'s poller whenever the
/// interest mask changes. It is the building block the [`Acceptor`], the
/// timer subsystem and connection implementations are made of.
///
/// `Channel` is a cheap handle, cloning it returns a second handle to the
/// same channel. Identity can be checked with [`same_channel`].
///
/// # Lifetime
///
/// Before the last handle to a channel is dropped all interest must be
/// disabled ([`disable_all`]) and the channel must be removed from the poller
/// ([`remove`]). Dropping a channel with live interest is a programming error
/// and fails an assertion, since it indicates the poller is left with a
/// dangling registration.
///
/// [`EventLoop`]: crate::EventLoop
/// [`Acceptor`]: crate::Acceptor
/// [`same_channel`]: Channel::same_channel
/// [`disable_all`]: Channel::disable_all
/// [`remove`]: Channel::remove
#[derive(Clone)]
pub struct Channel {
    inner: Rc<RefCell<ChannelInner>>,
}

struct ChannelInner {
    fd: RawFd,
    interest: Ready,
    received: Ready,
    /// State hint owned by the poller backend, see `sys::EpollPoller`.
    index: i8,
    event_loop: Weak<LoopInner>,
    tie: Option<LifeWatch>,
    read_callback: Option<ReadEventCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl Channel {
    /// Create a new channel for `fd`, owned by `event_loop`.
    ///
    /// The channel starts without interest and without callbacks; it is not
    /// known to the poller until the first `enable_*` call.
    pub fn new(event_loop: &crate::EventLoop, fd: RawFd) -> Channel {
        Channel::new_with_loop(event_loop.inner_weak(), fd)
    }

    pub(crate) fn new_with_loop(event_loop: Weak<LoopInner>, fd: RawFd) -> Channel {
        Channel {
            inner: Rc::new(RefCell::new(ChannelInner {
                fd,
                interest: Ready::EMPTY,
                received: Ready::EMPTY,
                index: -1,
                event_loop,
                tie: None,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            })),
        }
    }

    /// Returns the file descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    /// Returns the current interest mask.
    pub fn interest(&self) -> Ready {
        self.inner.borrow().interest
    }

    /// Returns true if no interest is registered.
    pub fn is_idle(&self) -> bool {
        self.interest().is_empty()
    }

    /// Returns true if readable interest is registered.
    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    /// Returns true if writable interest is registered.
    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    /// Returns true if `self` and `other` are handles to the same channel.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set the callback invoked on readable events.
    ///
    /// The callback receives the timestamp taken when the poller returned.
    pub fn set_read_callback<F>(&self, callback: F)
        where F: FnMut(Instant) + 'static,
    {
        self.inner.borrow_mut().read_callback = Some(Box::new(callback));
    }

    /// Set the callback invoked on writable events.
    pub fn set_write_callback<F>(&self, callback: F)
        where F: FnMut() + 'static,
    {
        self.inner.borrow_mut().write_callback = Some(Box::new(callback));
    }

    /// Set the callback invoked on closed events.
    pub fn set_close_callback<F>(&self, callback: F)
        where F: FnMut() + 'static,
    {
        self.inner.borrow_mut().close_callback = Some(Box::new(callback));
    }

    /// Set the callback invoked on error events.
    pub fn set_error_callback<F>(&self, callback: F)
        where F: FnMut() + 'static,
    {
        self.inner.borrow_mut().error_callback = Some(Box::new(callback));
    }

    /// Tie this channel to the lifetime of its owning object.
    ///
    /// Once tied, [`handle_event`] refuses to dispatch callbacks after the
    /// [`LifeToken`] has been dropped. This guards against callbacks running
    /// while the owner has already begun destruction, e.g. when an earlier
    /// callback in the same poll cycle tore the owner down.
    ///
    /// [`handle_event`]: Channel::handle_event
    pub fn tie(&self, token: &LifeToken) {
        self.inner.borrow_mut().tie = Some(token.watch());
    }

    /// Add readable interest and synchronise the poller.
    pub fn enable_reading(&self) {
        self.add_interest(Ready::READABLE);
    }

    /// Remove readable interest and synchronise the poller.
    pub fn disable_reading(&self) {
        self.remove_interest(Ready::READABLE);
    }

    /// Add writable interest and synchronise the poller.
    pub fn enable_writing(&self) {
        self.add_interest(Ready::WRITABLE);
    }

    /// Remove writable interest and synchronise the poller.
    pub fn disable_writing(&self) {
        self.remove_interest(Ready::WRITABLE);
    }

    /// Clear the complete interest mask and synchronise the poller.
    pub fn disable_all(&self) {
        {
            self.inner.borrow_mut().interest = Ready::EMPTY;
        }
        self.update();
    }

    /// Remove this channel from the poller.
    ///
    /// All interest must have been disabled first, removal with live
    /// interest is a programming error.
    pub fn remove(&self) {
        assert!(self.is_idle(), "removing channel for fd={} with live interest", self.fd());
        let event_loop = self.inner.borrow().event_loop.upgrade();
        if let Some(event_loop) = event_loop {
            event_loop.remove_channel(self);
        }
    }

    /// Dispatch the callbacks for the received event mask.
    ///
    /// Callbacks for bits present in the received mask run in a fixed
    /// priority order: closed, error, read, write. Unset callbacks are
    /// skipped, and no callback runs twice for one received mask. If the
    /// channel is [tied] and the owner is gone nothing is dispatched; the
    /// tie is re-checked between callbacks, so when an earlier callback of
    /// the same mask begins the owner's destruction the remaining callbacks
    /// do not run.
    ///
    /// [tied]: Channel::tie
    pub fn handle_event(&self, now: Instant) {
        let (received, tie) = {
            let inner = self.inner.borrow();
            (inner.received, inner.tie.clone())
        };

        if !tie_intact(&tie) {
            trace!("skipping event dispatch for fd={}: owner is gone", self.fd());
            return;
        }

        trace!("handling events for fd={}: received={:?}", self.fd(), received);

        if received.is_closed() {
            self.invoke(|inner| &mut inner.close_callback);
        }
        // Any callback may tear the owner down; stop dispatching the moment
        // the tie reports it.
        if received.is_error() && tie_intact(&tie) {
            self.invoke(|inner| &mut inner.error_callback);
        }
        if received.is_readable() && tie_intact(&tie) {
            self.invoke_read(now);
        }
        if received.is_writable() && tie_intact(&tie) {
            self.invoke(|inner| &mut inner.write_callback);
        }
    }

    pub(crate) fn set_received(&self, received: Ready) {
        self.inner.borrow_mut().received = received;
    }

    pub(crate) fn index(&self) -> i8 {
        self.inner.borrow().index
    }

    pub(crate) fn set_index(&self, index: i8) {
        self.inner.borrow_mut().index = index;
    }

    fn add_interest(&self, interest: Ready) {
        {
            self.inner.borrow_mut().interest |= interest;
        }
        self.update();
    }

    fn remove_interest(&self, interest: Ready) {
        {
            self.inner.borrow_mut().interest -= interest;
        }
        self.update();
    }

    /// Push the current interest mask to the poller. Interest changes are
    /// never batched, the poller's watch set stays in sync with the mask.
    fn update(&self) {
        let event_loop = self.inner.borrow().event_loop.upgrade();
        if let Some(event_loop) = event_loop {
            if let Err(err) = event_loop.update_channel(self) {
                error!("failed to update interest for fd={}: {}", self.fd(), err);
            }
        }
    }

    /// Invoke the callback in `slot`, if any, without holding a borrow of
    /// the channel. The callback is taken out of its slot for the duration
    /// of the call so it may mutate its own channel, including replacing
    /// the callback it runs as.
    fn invoke(&self, slot: fn(&mut ChannelInner) -> &mut Option<EventCallback>) {
        let callback = slot(&mut *self.inner.borrow_mut()).take();
        if let Some(mut callback) = callback {
            callback();
            let mut inner = self.inner.borrow_mut();
            let slot = slot(&mut inner);
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    fn invoke_read(&self, now: Instant) {
        let callback = self.inner.borrow_mut().read_callback.take();
        if let Some(mut callback) = callback {
            callback(now);
            let mut inner = self.inner.borrow_mut();
            if inner.read_callback.is_none() {
                inner.read_callback = Some(callback);
            }
        }
    }
}

/// Whether dispatch may proceed: either the channel is untied, or the owner
/// behind the tie is still alive.
fn tie_intact(tie: &Option<LifeWatch>) -> bool {
    tie.as_ref().map_or(true, LifeWatch::alive)
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Channel")
            .field("fd", &inner.fd)
            .field("interest", &inner.interest)
            .field("received", &inner.received)
            .finish()
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        assert!(self.interest.is_empty(),
            "channel for fd={} dropped with live interest ({:?})", self.fd, self.interest);
    }
}

/// The strong side of a liveness capability pair.
///
/// A [`Channel`] [tied] to a `LifeToken` only dispatches callbacks while the
/// token is alive. The owning object keeps the token as a field; dropping
/// the owner drops the token and stops all further dispatch.
///
/// [tied]: Channel::tie
#[derive(Debug)]
pub struct LifeToken {
    alive: Rc<()>,
}

/// The weak side of the pair, held by the channel.
#[derive(Clone, Debug)]
pub(crate) struct LifeWatch {
    alive: Weak<()>,
}

impl LifeToken {
    /// Create a new, alive, token.
    pub fn new() -> LifeToken {
        LifeToken { alive: Rc::new(()) }
    }

    pub(crate) fn watch(&self) -> LifeWatch {
        LifeWatch { alive: Rc::downgrade(&self.alive) }
    }
}

impl Default for LifeToken {
    fn default() -> LifeToken {
        LifeToken::new()
    }
}

impl LifeWatch {
    pub(crate) fn alive(&self) -> bool {
        self.alive.upgrade().is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};
    use std::time::Instant;

    use crate::event::Ready;
    use crate::channel::{Channel, LifeToken};

    /// A channel without an owning loop; interest changes are recorded
    /// locally but never reach a poller.
    fn detached_channel() -> Channel {
        Channel::new_with_loop(Weak::new(), 0)
    }

    #[test]
    fn dispatch_priority_order() {
        let channel = detached_channel();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        channel.set_read_callback(move |_| log.borrow_mut().push("read"));
        let log = Rc::clone(&order);
        channel.set_write_callback(move || log.borrow_mut().push("write"));
        let log = Rc::clone(&order);
        channel.set_close_callback(move || log.borrow_mut().push("close"));
        let log = Rc::clone(&order);
        channel.set_error_callback(move || log.borrow_mut().push("error"));

        channel.set_received(Ready::READABLE | Ready::WRITABLE | Ready::ERROR | Ready::CLOSED);
        channel.handle_event(Instant::now());

        assert_eq!(*order.borrow(), vec!["close", "error", "read", "write"]);
    }

    #[test]
    fn dispatch_subset_of_mask() {
        let channel = detached_channel();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&order);
        channel.set_read_callback(move |_| log.borrow_mut().push("read"));
        let log = Rc::clone(&order);
        channel.set_write_callback(move || log.borrow_mut().push("write"));

        channel.set_received(Ready::WRITABLE);
        channel.handle_event(Instant::now());
        // Only the writable callback may run, and only once.
        assert_eq!(*order.borrow(), vec!["write"]);
    }

    #[test]
    fn unset_callbacks_are_noops() {
        let channel = detached_channel();
        channel.set_received(Ready::READABLE | Ready::CLOSED);
        // No callbacks set, should not panic.
        channel.handle_event(Instant::now());
    }

    #[test]
    fn tie_blocks_dispatch_after_owner_drop() {
        let channel = detached_channel();
        let fired = Rc::new(RefCell::new(0));

        let count = Rc::clone(&fired);
        channel.set_read_callback(move |_| *count.borrow_mut() += 1);
        channel.set_received(Ready::READABLE);

        let token = LifeToken::new();
        channel.tie(&token);
        channel.handle_event(Instant::now());
        assert_eq!(*fired.borrow(), 1);

        drop(token);
        channel.handle_event(Instant::now());
        // Owner is gone, dispatch must be refused.
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn tie_broken_mid_dispatch_stops_remaining_callbacks() {
        let channel = detached_channel();
        let reads = Rc::new(RefCell::new(0));
        let token_slot = Rc::new(RefCell::new(Some(LifeToken::new())));

        channel.tie(token_slot.borrow().as_ref().unwrap());

        let count = Rc::clone(&reads);
        channel.set_read_callback(move |_| *count.borrow_mut() += 1);
        // The close callback tears the owner down, dropping the token.
        let slot = Rc::clone(&token_slot);
        channel.set_close_callback(move || drop(slot.borrow_mut().take()));

        // A peer writing a byte and closing delivers both bits in one mask.
        channel.set_received(Ready::READABLE | Ready::CLOSED);
        channel.handle_event(Instant::now());

        // The owner was destroyed by the close callback, the read callback
        // for the same mask must not run.
        assert_eq!(*reads.borrow(), 0);
    }

    #[test]
    fn callback_may_replace_itself() {
        let channel = detached_channel();
        let first = Rc::new(RefCell::new(0));
        let second = Rc::new(RefCell::new(0));

        let inner_channel = channel.clone();
        let first_count = Rc::clone(&first);
        let second_count = Rc::clone(&second);
        channel.set_read_callback(move |_| {
            *first_count.borrow_mut() += 1;
            let second_count = Rc::clone(&second_count);
            inner_channel.set_read_callback(move |_| *second_count.borrow_mut() += 1);
        });

        channel.set_received(Ready::READABLE);
        channel.handle_event(Instant::now());
        channel.handle_event(Instant::now());

        assert_eq!(*first.borrow(), 1);
        assert_eq!(*second.borrow(), 1);
    }

    #[test]
    #[should_panic(expected = "live interest")]
    fn drop_with_live_interest_panics() {
        let channel = detached_channel();
        channel.enable_reading();
        drop(channel);
    }
}
