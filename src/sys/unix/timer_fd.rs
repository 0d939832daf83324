//! OS-level timer expiration primitive.
//!
//! A `timerfd` becomes readable when its deadline passes, which makes it a
//! regular channel in the event loop's watch set. The timer queue keeps it
//! armed to the earliest pending expiration.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Instant;

use log::error;

/// Create a new non-blocking, monotonic timer descriptor.
pub fn new() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

/// Arm `fd` to expire at `when`.
///
/// A deadline at or before now is clamped to the smallest non-zero delay,
/// since an all-zero value would disarm the timer; this way an already
/// expired timer still wakes the loop on its next iteration.
pub fn arm(fd: RawFd, when: Instant) -> io::Result<()> {
    let delay = when.saturating_duration_since(Instant::now());
    let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
    spec.it_value.tv_sec = delay.as_secs() as libc::time_t;
    spec.it_value.tv_nsec = delay.subsec_nanos() as libc::c_long;
    if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
        spec.it_value.tv_nsec = 1;
    }
    settime(fd, &spec)
}

/// Disarm `fd`; it will not become readable until armed again.
pub fn disarm(fd: RawFd) -> io::Result<()> {
    let spec: libc::itimerspec = unsafe { mem::zeroed() };
    settime(fd, &spec)
}

/// Consume the expiration count, acknowledging the wake up. A would-block
/// read means a spurious wake up and is fine; anything else is logged.
pub fn acknowledge(fd: RawFd) {
    let mut buf = [0u8; 8];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            error!("error reading timer fd={}: {}", fd, err);
        }
    }
}

fn settime(fd: RawFd, spec: &libc::itimerspec) -> io::Result<()> {
    if unsafe { libc::timerfd_settime(fd, 0, spec, std::ptr::null_mut()) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    use super::{acknowledge, arm, disarm, new};
    use crate::sys::close;

    fn expired(fd: i32) -> bool {
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        n == 8
    }

    #[test]
    fn arm_and_expire() {
        let fd = new().expect("unable to create timer fd");
        arm(fd, Instant::now() + Duration::from_millis(10)).unwrap();
        assert!(!expired(fd));
        sleep(Duration::from_millis(20));
        assert!(expired(fd));
        close(fd);
    }

    #[test]
    fn deadline_in_the_past_still_fires() {
        let fd = new().expect("unable to create timer fd");
        arm(fd, Instant::now() - Duration::from_secs(1)).unwrap();
        sleep(Duration::from_millis(1));
        assert!(expired(fd));
        close(fd);
    }

    #[test]
    fn disarmed_timer_never_fires() {
        let fd = new().expect("unable to create timer fd");
        arm(fd, Instant::now() + Duration::from_millis(5)).unwrap();
        disarm(fd).unwrap();
        sleep(Duration::from_millis(20));
        assert!(!expired(fd));
        close(fd);
    }

    #[test]
    fn acknowledge_consumes_expiration() {
        let fd = new().expect("unable to create timer fd");
        arm(fd, Instant::now()).unwrap();
        sleep(Duration::from_millis(5));
        acknowledge(fd);
        assert!(!expired(fd));
        close(fd);
    }
}
