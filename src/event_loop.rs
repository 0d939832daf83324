//! The thread-confined dispatch engine.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::Awakener;
use crate::timer_queue::{Timer, TimerId, TimerQueue};

/// Timeout for a single poll when [`run`]ning the loop. Timer expirations
/// and [`LoopHandle::wake`] cut the wait short, so a long timeout only
/// bounds how often an idle loop spins.
///
/// [`run`]: EventLoop::run
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A task marshaled onto the loop thread, see [`LoopHandle::run_in_loop`].
type Task = Box<dyn FnOnce(&EventLoop) + Send>;

/// A single-threaded reactor: waits for readiness with its [`Poller`],
/// dispatches [`Channel`] callbacks and runs timed callbacks.
///
/// The loop is confined to the thread that created it (`EventLoop` is not
/// `Send`). Each [`run_once`] cycle performs three steps: wait for ready
/// channels, dispatch their callbacks in poller order, then drain and run
/// tasks submitted from other threads. Other threads interact with the loop
/// exclusively through a [`LoopHandle`].
///
/// # Examples
///
/// ```no_run
/// # fn main() -> std::io::Result<()> {
/// use std::time::Duration;
///
/// use boreas::EventLoop;
///
/// let mut event_loop = EventLoop::new()?;
/// let handle = event_loop.handle();
///
/// // Stop the loop after 100 milliseconds.
/// let _ = event_loop.run_after(Duration::from_millis(100), move || handle.quit());
///
/// event_loop.run()
/// # }
/// ```
///
/// [`run_once`]: EventLoop::run_once
pub struct EventLoop {
    // Field order matters: `timers` and `wake` hold channels which must be
    // dropped while `inner` (and with it the poller) is still alive.
    timers: TimerQueue,
    wake: Channel,
    inner: Rc<LoopInner>,
    shared: Arc<LoopShared>,
    /// Recycled buffer for ready channels.
    ready: Vec<Channel>,
    iteration: u64,
}

/// Loop internals reachable from [`Channel`]s, via a weak reference.
pub(crate) struct LoopInner {
    thread: ThreadId,
    poller: RefCell<Box<dyn Poller>>,
}

/// The cross-thread visible part of the loop, shared with [`LoopHandle`]s.
struct LoopShared {
    thread: ThreadId,
    pending: Mutex<Vec<Task>>,
    awakener: Awakener,
    quit: AtomicBool,
    timer_seq: AtomicU64,
}

impl EventLoop {
    /// Create a new event loop with the default poller backend, epoll.
    pub fn new() -> io::Result<EventLoop> {
        let poller = Box::new(crate::sys::EpollPoller::new()?);
        EventLoop::with_poller(poller)
    }

    /// Create a new event loop driving the provided poller backend.
    pub fn with_poller(poller: Box<dyn Poller>) -> io::Result<EventLoop> {
        let inner = Rc::new(LoopInner {
            thread: thread::current().id(),
            poller: RefCell::new(poller),
        });
        let shared = Arc::new(LoopShared {
            thread: inner.thread,
            pending: Mutex::new(Vec::new()),
            awakener: Awakener::new()?,
            quit: AtomicBool::new(false),
            timer_seq: AtomicU64::new(1),
        });

        // The read end of the awakener participates in the poll cycle like
        // any other channel; its callback only acknowledges the wake up,
        // the queued tasks run at the end of the cycle.
        let wake = Channel::new_with_loop(Rc::downgrade(&inner), shared.awakener.fd());
        let awakener_shared = Arc::clone(&shared);
        wake.set_read_callback(move |_| awakener_shared.awakener.drain());
        wake.enable_reading();

        let timers = match TimerQueue::new(&inner) {
            Ok(timers) => timers,
            Err(err) => {
                wake.disable_all();
                wake.remove();
                return Err(err);
            },
        };

        Ok(EventLoop {
            timers,
            wake,
            inner,
            shared,
            ready: Vec::new(),
            iteration: 0,
        })
    }

    /// Returns a handle to this loop which can be sent to, and cloned on,
    /// other threads.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.shared) }
    }

    /// Run the wait-dispatch cycle until [`quit`] is called.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&mut self) -> io::Result<()> {
        self.inner.assert_in_loop_thread();
        self.shared.quit.store(false, Ordering::Relaxed);
        trace!("event loop starting");
        while !self.shared.quit.load(Ordering::Relaxed) {
            self.run_once(Some(POLL_TIMEOUT))?;
        }
        trace!("event loop stopped after {} iterations", self.iteration);
        Ok(())
    }

    /// Run a single wait-dispatch cycle.
    ///
    /// Waits up to `timeout` for readiness, dispatches the callbacks of
    /// every ready channel in poller order, then runs the tasks other
    /// threads have submitted since the previous cycle.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.assert_in_loop_thread();

        let mut ready = mem::replace(&mut self.ready, Vec::new());
        ready.clear();
        let result = self.inner.poller.borrow_mut().poll(timeout, &mut ready);
        let now = match result {
            Ok(now) => now,
            Err(err) => {
                self.ready = ready;
                return Err(err);
            },
        };

        self.iteration += 1;
        trace!("event loop iteration {}: {} ready channel(s)", self.iteration, ready.len());

        for channel in ready.drain(..) {
            channel.handle_event(now);
        }
        self.ready = ready;

        self.run_pending_tasks();
        Ok(())
    }

    /// Execute `task` on the loop thread.
    ///
    /// The caller is on the loop thread by construction (`EventLoop` cannot
    /// move across threads), so the task runs immediately. The cross-thread
    /// equivalent is [`LoopHandle::run_in_loop`], which enqueues the task
    /// and wakes the loop.
    pub fn run_in_loop<F>(&self, task: F)
        where F: FnOnce(&EventLoop),
    {
        self.inner.assert_in_loop_thread();
        task(self);
    }

    /// Schedule `callback` to run at `when`.
    ///
    /// The returned [`TimerId`] can be used to [`cancel`] the timer.
    ///
    /// [`cancel`]: EventLoop::cancel
    pub fn run_at<F>(&self, when: Instant, callback: F) -> TimerId
        where F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(self.shared.alloc_timer_seq(), when, None, Box::new(callback));
        let id = timer.id();
        self.timers.insert(timer);
        id
    }

    /// Schedule `callback` to run once, `delay` from now.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
        where F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedule `callback` to run every `interval`, starting one interval
    /// from now.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
        where F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(self.shared.alloc_timer_seq(),
            Instant::now() + interval, Some(interval), Box::new(callback));
        let id = timer.id();
        self.timers.insert(timer);
        id
    }

    /// Cancel a previously scheduled timer.
    ///
    /// Guaranteed to be applied before the timer's next firing opportunity.
    /// Cancelling an already fired, or already cancelled, timer is a no-op.
    pub fn cancel(&self, id: TimerId) {
        self.timers.cancel(id);
    }

    /// Stop the loop after the current cycle completes.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Relaxed);
    }

    /// Returns true if exactly `channel` is registered with the poller.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.inner.has_channel(channel)
    }

    /// Returns true if the current thread is the loop thread.
    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.is_in_loop_thread()
    }

    pub(crate) fn inner_weak(&self) -> Weak<LoopInner> {
        Rc::downgrade(&self.inner)
    }

    fn run_pending_tasks(&self) {
        // Move the tasks out under the lock, then run them without it, so
        // other threads can keep submitting while we dispatch.
        let tasks = mem::replace(&mut *lock(&self.shared.pending), Vec::new());
        if !tasks.is_empty() {
            trace!("running {} queued task(s)", tasks.len());
        }
        for task in tasks {
            task(self);
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.inner.thread)
            .field("iteration", &self.iteration)
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wake.disable_all();
        self.wake.remove();
    }
}

impl LoopInner {
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        assert!(self.is_in_loop_thread(),
            "event loop method called from thread {:?}, but the loop runs on {:?}",
            thread::current().id(), self.thread);
    }

    pub(crate) fn update_channel(&self, channel: &Channel) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel)
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }
}

impl LoopShared {
    fn alloc_timer_seq(&self) -> u64 {
        self.timer_seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// A sendable, cloneable handle to an [`EventLoop`].
///
/// All methods marshal their request onto the loop thread: the request is
/// pushed onto the loop's pending queue and the loop is woken from its
/// readiness wait, so queued work runs at the end of the current cycle
/// rather than waiting for the next natural timeout.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Execute `task` on the loop thread.
    ///
    /// Tasks run after the current cycle's channel dispatch, before the
    /// next readiness wait, in submission order.
    pub fn run_in_loop<F>(&self, task: F)
        where F: FnOnce(&EventLoop) + Send + 'static,
    {
        lock(&self.shared.pending).push(Box::new(task));
        self.wake();
    }

    /// Schedule `callback` to run at `when`.
    ///
    /// The returned [`TimerId`] is valid immediately; the timer itself is
    /// inserted by the loop thread. See [`EventLoop::run_at`].
    pub fn run_at<F>(&self, when: Instant, callback: F) -> TimerId
        where F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(self.shared.alloc_timer_seq(), when, None, Box::new(callback));
        let id = timer.id();
        self.run_in_loop(move |event_loop| event_loop.timers.insert(timer));
        id
    }

    /// Schedule `callback` to run once, `delay` from now.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
        where F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Schedule `callback` to run every `interval`, starting one interval
    /// from now.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
        where F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(self.shared.alloc_timer_seq(),
            Instant::now() + interval, Some(interval), Box::new(callback));
        let id = timer.id();
        self.run_in_loop(move |event_loop| event_loop.timers.insert(timer));
        id
    }

    /// Cancel a previously scheduled timer.
    ///
    /// Applied by the loop thread before the timer's next firing
    /// opportunity; the timer is not guaranteed to be gone the moment this
    /// call returns.
    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move |event_loop| event_loop.timers.cancel(id));
    }

    /// Stop the loop after its current cycle completes, waking it if it is
    /// blocked in a readiness wait.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Relaxed);
        self.wake();
    }

    /// Force a blocked readiness wait to return early.
    pub fn wake(&self) {
        if let Err(err) = self.shared.awakener.wake() {
            error!("failed to wake event loop: {}", err);
        }
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

/// Lock `mutex`, ignoring poisoning: the queue holds plain boxed closures
/// and remains in a consistent state even if a panic unwound past a lock.
fn lock(mutex: &Mutex<Vec<Task>>) -> MutexGuard<'_, Vec<Task>> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
