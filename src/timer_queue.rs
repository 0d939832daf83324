//! Ordered storage for timed callbacks.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::sys;

/// Opaque handle to a scheduled timer, used only for cancellation.
///
/// Returned by [`EventLoop::run_at`] and friends. The handle wraps the
/// timer's sequence number, which is monotonic and never reused, so a stale
/// id can at worst name a retired timer, never a different one.
///
/// [`EventLoop::run_at`]: crate::EventLoop::run_at
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

/// A scheduled callback. Exclusively owned by the [`TimerQueue`] from
/// insertion until it fires and does not repeat, or until cancelled.
pub(crate) struct Timer {
    seq: u64,
    when: Instant,
    /// `None` for a one-shot timer.
    interval: Option<Duration>,
    callback: Box<dyn FnMut() + Send>,
}

impl Timer {
    pub(crate) fn new(seq: u64, when: Instant, interval: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
    ) -> Timer {
        Timer { seq, when, interval, callback }
    }

    pub(crate) fn id(&self) -> TimerId {
        TimerId(self.seq)
    }
}

/// Owner of all scheduled callbacks of an event loop.
///
/// Keeps timers in two synchronised indices: an expiration-ordered index,
/// with the sequence number as tie break so no two entries ever compare
/// equal, and a sequence-indexed map for cancellation lookup. A `timerfd`
/// registered as a read-interest channel wakes the loop at the earliest
/// pending expiration; it is rearmed whenever the earliest deadline moves.
///
/// All index mutation happens on the loop thread. `add`/`cancel` requests
/// from other threads arrive through the loop's pending-task queue.
pub(crate) struct TimerQueue {
    fd: RawFd,
    channel: Channel,
    inner: Rc<RefCell<TimersInner>>,
}

struct TimersInner {
    /// Expiration-ordered index; (expiration, sequence) keys are unique.
    ordered: BTreeSet<(Instant, u64)>,
    /// Sequence-indexed side of the same set, for cancellation.
    active: HashMap<u64, Timer>,
    /// True while the expired batch's callbacks are running.
    firing: bool,
    /// Timers cancelled while their own batch fires; consulted before a
    /// repeating timer is rearmed. Cleared at the start of each batch.
    cancelling: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new(event_loop: &Rc<LoopInner>) -> io::Result<TimerQueue> {
        let fd = sys::timer_fd::new()?;
        let inner = Rc::new(RefCell::new(TimersInner {
            ordered: BTreeSet::new(),
            active: HashMap::new(),
            firing: false,
            cancelling: HashSet::new(),
        }));

        let channel = Channel::new_with_loop(Rc::downgrade(event_loop), fd);
        let weak = Rc::downgrade(&inner);
        channel.set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                TimerQueue::handle_read(&inner, fd);
            }
        });
        channel.enable_reading();

        Ok(TimerQueue { fd, channel, inner })
    }

    /// Insert `timer` into both indices, rearming the timer fd if the new
    /// timer became the earliest pending one. Loop thread only.
    pub(crate) fn insert(&self, timer: Timer) {
        trace!("adding timer: seq={}, when={:?}, interval={:?}",
            timer.seq, timer.when, timer.interval);
        let when = timer.when;
        let earliest_changed = self.inner.borrow_mut().insert(timer);
        if earliest_changed {
            self.arm(when);
        }
    }

    /// Cancel the timer behind `id`, see [`TimersInner::cancel`]. Loop
    /// thread only.
    pub(crate) fn cancel(&self, id: TimerId) {
        self.inner.borrow_mut().cancel(id.0);
    }

    /// Read callback of the timer fd channel: fires the expired batch.
    fn handle_read(inner: &Rc<RefCell<TimersInner>>, fd: RawFd) {
        sys::timer_fd::acknowledge(fd);
        let now = Instant::now();

        let expired = {
            let mut timers = inner.borrow_mut();
            let expired = timers.extract_expired(now);
            timers.firing = true;
            timers.cancelling.clear();
            expired
        };
        trace!("firing {} expired timer(s)", expired.len());

        // Fire without holding a borrow of the indices: a callback may
        // re-entrantly add or cancel timers.
        let mut fired = Vec::with_capacity(expired.len());
        for mut timer in expired {
            (timer.callback)();
            fired.push(timer);
        }

        let mut timers = inner.borrow_mut();
        timers.firing = false;
        for mut timer in fired {
            let cancelled = timers.cancelling.remove(&timer.seq);
            match timer.interval {
                Some(interval) if !cancelled => {
                    timer.when = now + interval;
                    // The final rearm below covers any earliest change.
                    let _ = timers.insert(timer);
                },
                _ => trace!("retiring timer: seq={}", timer.seq),
            }
        }

        let earliest = timers.ordered.iter().next().map(|&(when, _)| when);
        drop(timers);
        match earliest {
            Some(when) => TimerQueue::arm_fd(fd, when),
            None => {
                trace!("no timers remain, disarming timer fd");
                if let Err(err) = sys::timer_fd::disarm(fd) {
                    error!("failed to disarm timer fd: {}", err);
                }
            },
        }
    }

    fn arm(&self, when: Instant) {
        TimerQueue::arm_fd(self.fd, when);
    }

    fn arm_fd(fd: RawFd, when: Instant) {
        if let Err(err) = sys::timer_fd::arm(fd, when) {
            error!("failed to arm timer fd: {}", err);
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
        sys::close(self.fd);
    }
}

impl TimersInner {
    /// Cancel the timer with sequence number `seq`.
    ///
    /// A timer still in the indices is removed from both. A timer that is
    /// gone while the expired batch fires belongs to that batch, so it is
    /// recorded in the cancelling set and never rearmed. Anything else is a
    /// retired or unknown timer and a silent no-op.
    fn cancel(&mut self, seq: u64) {
        if let Some(timer) = self.active.remove(&seq) {
            let removed = self.ordered.remove(&(timer.when, timer.seq));
            assert!(removed, "timer indices out of sync: seq={} missing from ordered index", seq);
            trace!("cancelled timer: seq={}", seq);
        } else if self.firing {
            trace!("cancelling timer from within its firing batch: seq={}", seq);
            let _ = self.cancelling.insert(seq);
        } else {
            trace!("cancel of retired or unknown timer: seq={}", seq);
        }
    }

    /// Insert into both indices; returns true if `timer` became the
    /// earliest pending timer.
    fn insert(&mut self, timer: Timer) -> bool {
        debug_assert_eq!(self.ordered.len(), self.active.len());
        let earliest_changed = self.ordered.iter().next()
            .map_or(true, |&(when, _)| timer.when < when);

        let added = self.ordered.insert((timer.when, timer.seq));
        assert!(added, "timer indices out of sync: duplicate entry for seq={}", timer.seq);
        let prev = self.active.insert(timer.seq, timer);
        assert!(prev.is_none(), "timer indices out of sync: duplicate timer for seq");

        debug_assert_eq!(self.ordered.len(), self.active.len());
        earliest_changed
    }

    /// Remove and return every timer with an expiration at or before
    /// `now`, in (expiration, sequence) order, from both indices.
    fn extract_expired(&mut self, now: Instant) -> Vec<Timer> {
        debug_assert_eq!(self.ordered.len(), self.active.len());
        let mut expired = Vec::new();
        while let Some(&(when, seq)) = self.ordered.iter().next() {
            if when > now {
                break;
            }
            let removed = self.ordered.remove(&(when, seq));
            debug_assert!(removed);
            match self.active.remove(&seq) {
                Some(timer) => expired.push(timer),
                None => panic!("timer indices out of sync: no timer for seq={}", seq),
            }
        }
        debug_assert_eq!(self.ordered.len(), self.active.len());
        expired
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{Timer, TimersInner};

    fn empty_inner() -> TimersInner {
        TimersInner {
            ordered: Default::default(),
            active: Default::default(),
            firing: false,
            cancelling: Default::default(),
        }
    }

    fn timer(seq: u64, when: Instant) -> Timer {
        Timer::new(seq, when, None, Box::new(|| {}))
    }

    #[test]
    fn earliest_change_detection() {
        let mut timers = empty_inner();
        let now = Instant::now();

        // First timer is always the earliest.
        assert!(timers.insert(timer(1, now + Duration::from_millis(50))));
        // A later deadline does not change the earliest.
        assert!(!timers.insert(timer(2, now + Duration::from_millis(80))));
        // An earlier one does.
        assert!(timers.insert(timer(3, now + Duration::from_millis(10))));
        // The same deadline as the current earliest does not.
        assert!(!timers.insert(timer(4, now + Duration::from_millis(10))));
    }

    #[test]
    fn extraction_order_ties_broken_by_sequence() {
        let mut timers = empty_inner();
        let now = Instant::now();
        let deadline = now - Duration::from_millis(1);

        let _ = timers.insert(timer(2, deadline));
        let _ = timers.insert(timer(1, deadline));
        let _ = timers.insert(timer(3, now - Duration::from_millis(2)));
        let _ = timers.insert(timer(4, now + Duration::from_millis(50)));

        let expired = timers.extract_expired(now);
        let order: Vec<u64> = expired.iter().map(|timer| timer.seq).collect();
        // Earlier deadline first, then insertion sequence for the tie.
        assert_eq!(order, vec![3, 1, 2]);
        // The future timer stays behind, in both indices.
        assert_eq!(timers.ordered.len(), 1);
        assert_eq!(timers.active.len(), 1);
        assert!(timers.active.contains_key(&4));
    }

    #[test]
    fn extraction_includes_deadline_at_now() {
        let mut timers = empty_inner();
        let now = Instant::now();
        let _ = timers.insert(timer(1, now));
        assert_eq!(timers.extract_expired(now).len(), 1);
    }

    #[test]
    fn cancel_removes_from_both_indices() {
        let mut timers = empty_inner();
        let now = Instant::now();
        let _ = timers.insert(timer(1, now + Duration::from_millis(10)));
        let _ = timers.insert(timer(2, now + Duration::from_millis(20)));

        timers.cancel(1);
        assert_eq!(timers.ordered.len(), 1);
        assert_eq!(timers.active.len(), 1);
        assert!(timers.active.contains_key(&2));
        // A scheduled timer is removed outright, not marked cancelling.
        assert!(timers.cancelling.is_empty());
    }

    #[test]
    fn cancel_while_firing_is_recorded_for_the_batch() {
        let mut timers = empty_inner();
        let now = Instant::now();
        let _ = timers.insert(timer(1, now));
        let expired = timers.extract_expired(now);
        assert_eq!(expired.len(), 1);
        timers.firing = true;

        // The timer is out of the indices while its batch fires, a cancel
        // arriving now must be recorded so it is not rearmed.
        timers.cancel(1);
        assert!(timers.cancelling.contains(&1));

        // Outside a firing batch the same cancel is a plain no-op.
        timers.firing = false;
        timers.cancel(2);
        assert!(!timers.cancelling.contains(&2));
    }
}
