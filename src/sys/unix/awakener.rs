use std::io;
use std::os::unix::io::RawFd;

use super::tcp::close;

/// Cross-thread wake primitive for the event loop.
///
/// A non-blocking pipe: the read end is registered with the loop's poller
/// as a regular channel, [`wake`] writes a single byte from any thread to
/// force a blocked readiness wait to return. The loop thread [`drain`]s the
/// pipe when the wake channel becomes readable.
///
/// [`wake`]: Awakener::wake
/// [`drain`]: Awakener::drain
#[derive(Debug)]
pub struct Awakener {
    reader: RawFd,
    writer: RawFd,
}

impl Awakener {
    pub fn new() -> io::Result<Awakener> {
        let mut fds: [RawFd; 2] = [-1, -1];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Awakener { reader: fds[0], writer: fds[1] })
        }
    }

    /// The descriptor to register read interest for.
    pub fn fd(&self) -> RawFd {
        self.reader
    }

    /// Wake the loop. Safe to call from any thread. A full pipe means a
    /// wake up is already pending, which is good enough.
    pub fn wake(&self) -> io::Result<()> {
        let buf = [1u8];
        let n = unsafe { libc::write(self.writer, buf.as_ptr() as *const libc::c_void, 1) };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(())
            } else {
                Err(err)
            }
        } else {
            Ok(())
        }
    }

    /// Consume all pending wake up bytes. Loop thread only.
    pub fn drain(&self) {
        let mut buf = [0u8; 128];
        loop {
            let n = unsafe {
                libc::read(self.reader, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                return;
            }
        }
    }
}

impl Drop for Awakener {
    fn drop(&mut self) {
        close(self.writer);
        close(self.reader);
    }
}
