//! Integration of a listening socket into the event loop.

use std::cell::RefCell;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use log::{error, trace, warn};

use crate::channel::{Channel, LifeToken};
use crate::event_loop::LoopInner;
use crate::sys;

/// Callback invoked for every accepted connection. The receiver takes
/// ownership of the descriptor and must close it if it declines the
/// connection.
type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr)>;

/// Owner of a listening socket, accepting connections on the event loop.
///
/// After a successful [`listen`] the acceptor watches its listening socket
/// with a read-interest [`Channel`]. Each read-readiness event drains all
/// pending inbound connections with repeated non-blocking accepts, handing
/// every accepted descriptor plus peer address to the new-connection
/// callback on the loop thread.
///
/// Listen failures, e.g. a port already in use, are logged and absorbed:
/// the loop keeps running and [`listening`] stays false.
///
/// [`listen`]: Acceptor::listen
/// [`listening`]: Acceptor::listening
pub struct Acceptor {
    event_loop: Weak<LoopInner>,
    inner: Rc<RefCell<AcceptorInner>>,
    /// Guards the channel's dispatch against a torn-down acceptor.
    token: LifeToken,
}

struct AcceptorInner {
    address: SocketAddr,
    reuse_port: bool,
    /// The listening descriptor, `None` before a successful `listen`.
    fd: Option<RawFd>,
    local_address: Option<SocketAddr>,
    listening: bool,
    channel: Option<Channel>,
    new_connection: Option<NewConnectionCallback>,
}

impl Acceptor {
    /// Create a new acceptor for `address`.
    ///
    /// No socket is created yet, that happens in [`listen`].
    ///
    /// [`listen`]: Acceptor::listen
    pub fn new(event_loop: &crate::EventLoop, address: SocketAddr, reuse_port: bool) -> Acceptor {
        Acceptor {
            event_loop: event_loop.inner_weak(),
            inner: Rc::new(RefCell::new(AcceptorInner {
                address,
                reuse_port,
                fd: None,
                local_address: None,
                listening: false,
                channel: None,
                new_connection: None,
            })),
            token: LifeToken::new(),
        }
    }

    /// Set the callback invoked for every accepted connection.
    ///
    /// Without a callback accepted descriptors are closed immediately, no
    /// descriptor is ever silently leaked.
    pub fn set_new_connection_callback<F>(&self, callback: F)
        where F: FnMut(RawFd, SocketAddr) + 'static,
    {
        self.inner.borrow_mut().new_connection = Some(Box::new(callback));
    }

    /// Create the listening socket and register it with the event loop.
    ///
    /// Creates a non-blocking socket, binds it to the configured address,
    /// starts listening and enables read interest. On failure of any step
    /// the partially created socket is closed, the error is logged and
    /// [`listening`] remains false; no error is propagated and the process
    /// keeps running.
    ///
    /// [`listening`]: Acceptor::listening
    pub fn listen(&self) {
        let (address, reuse_port) = {
            let inner = self.inner.borrow();
            if inner.listening {
                return;
            }
            (inner.address, inner.reuse_port)
        };

        let (fd, local_address) = match sys::new_listener(address, reuse_port) {
            Ok((fd, local_address)) => (fd, local_address),
            Err(err) => {
                error!("failed to listen on {}: {}", address, err);
                return;
            },
        };
        trace!("listening on {}: fd={}", local_address, fd);

        let channel = Channel::new_with_loop(self.event_loop.clone(), fd);
        let weak = Rc::downgrade(&self.inner);
        channel.set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                Acceptor::handle_read(&inner);
            }
        });
        channel.tie(&self.token);
        channel.enable_reading();

        let mut inner = self.inner.borrow_mut();
        inner.fd = Some(fd);
        inner.local_address = Some(local_address);
        inner.channel = Some(channel);
        inner.listening = true;
    }

    /// Returns true between a successful [`listen`] and destruction.
    ///
    /// [`listen`]: Acceptor::listen
    pub fn listening(&self) -> bool {
        self.inner.borrow().listening
    }

    /// Returns the bound address, once listening. Useful when binding to
    /// port 0 and letting the OS pick the port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().local_address
    }

    /// Read callback of the listen channel: drain all pending connections.
    fn handle_read(inner: &Rc<RefCell<AcceptorInner>>) {
        let fd = match inner.borrow().fd {
            Some(fd) => fd,
            None => return,
        };

        loop {
            let (conn_fd, peer_address) = match sys::accept(fd) {
                Ok(accepted) => accepted,
                Err(ref err) if is_retriable_accept_error(err) => return,
                Err(err) => {
                    error!("accept on fd={} failed: {}", fd, err);
                    return;
                },
            };
            trace!("accepted connection from {}: fd={}", peer_address, conn_fd);

            // Take the callback out of its slot during the call, it may
            // touch the acceptor re-entrantly.
            let callback = inner.borrow_mut().new_connection.take();
            match callback {
                Some(mut callback) => {
                    callback(conn_fd, peer_address);
                    let mut inner = inner.borrow_mut();
                    if inner.new_connection.is_none() {
                        inner.new_connection = Some(callback);
                    }
                },
                None => {
                    warn!("no new-connection callback set, closing accepted fd={}", conn_fd);
                    sys::close(conn_fd);
                },
            }
        }
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Acceptor")
            .field("address", &inner.address)
            .field("listening", &inner.listening)
            .finish()
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Disable interest, unregister, then close, strictly in this order
        // so the poller never holds a registration for a closed descriptor.
        let (channel, fd) = {
            let mut inner = self.inner.borrow_mut();
            inner.listening = false;
            (inner.channel.take(), inner.fd.take())
        };
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove();
        }
        if let Some(fd) = fd {
            sys::close(fd);
        }
    }
}

/// Accept errors that merely mean "no more connections right now": they
/// end the current drain pass silently and are not logged.
fn is_retriable_accept_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
        return true;
    }
    // The connection was reset before we got to accept it.
    match err.raw_os_error() {
        Some(libc::ECONNABORTED) | Some(libc::EPROTO) => true,
        _ => false,
    }
}
