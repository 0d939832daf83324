mod awakener;
mod epoll;
mod select;
mod tcp;

pub mod timer_fd;

pub use self::awakener::Awakener;
pub use self::epoll::EpollPoller;
pub use self::select::SelectPoller;
pub use self::tcp::{accept, close, new_listener};

use std::cmp::min;
use std::time::Duration;

const MILLIS_PER_SEC: u64 = 1_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

/// Convert a `Duration` to milliseconds, rounding up so we never wake
/// before a deadline has passed.
pub(crate) fn duration_to_millis(duration: Duration) -> libc::c_int {
    let millis = duration.as_secs().saturating_mul(MILLIS_PER_SEC)
        .saturating_add((u64::from(duration.subsec_nanos()) / NANOS_PER_MILLI) + 1);
    min(millis, libc::c_int::max_value() as u64) as libc::c_int
}
