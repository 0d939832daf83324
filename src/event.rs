//! Readiness event types.

use std::fmt;
use std::ops::{BitOr, BitOrAssign, Sub, SubAssign};

/// A set of readiness event kinds.
///
/// `Ready` is a set of operation descriptors indicating which kind of
/// operation is ready to be performed. For example, `Ready::READABLE`
/// indicates that the associated descriptor is ready to perform a read
/// operation.
///
/// `Ready` is used both as the *interest* mask of a [`Channel`], describing
/// which operations to monitor, and as the *received* mask delivered by a
/// [`Poller`] once the operating system reports readiness.
///
/// `Ready` values can be combined together using the various bitwise
/// operators, see examples below.
///
/// [`Channel`]: crate::Channel
/// [`Poller`]: crate::Poller
///
/// # Examples
///
/// ```
/// use boreas::Ready;
///
/// let ready = Ready::READABLE | Ready::WRITABLE;
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// assert!(!ready.is_error());
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Ready(u8);

const READABLE: u8 = 1 << 0;
const WRITABLE: u8 = 1 << 1;
const ERROR: u8 = 1 << 2;
const CLOSED: u8 = 1 << 3;

impl Ready {
    /// Empty set, i.e. no readiness and no interest.
    pub const EMPTY: Ready = Ready(0);

    /// Readable readiness.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// Error readiness.
    pub const ERROR: Ready = Ready(ERROR);

    /// Closed readiness, e.g. the other side of a connection hung up.
    pub const CLOSED: Ready = Ready(CLOSED);

    /// Returns true if the set is empty.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the value includes readable readiness.
    #[inline]
    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    /// Returns true if the value includes writable readiness.
    #[inline]
    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    /// Returns true if the value includes error readiness.
    #[inline]
    pub fn is_error(self) -> bool {
        self.contains(Ready::ERROR)
    }

    /// Returns true if the value includes closed readiness.
    #[inline]
    pub fn is_closed(self) -> bool {
        self.contains(Ready::CLOSED)
    }

    /// Returns true if `self` contains all readiness in `other`.
    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, rhs: Ready) {
        self.0 |= rhs.0;
    }
}

impl Sub for Ready {
    type Output = Ready;

    fn sub(self, rhs: Ready) -> Ready {
        Ready(self.0 & !rhs.0)
    }
}

impl SubAssign for Ready {
    fn sub_assign(&mut self, rhs: Ready) {
        self.0 &= !rhs.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }

        let flags = [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::ERROR, "ERROR"),
            (Ready::CLOSED, "CLOSED"),
        ];
        let mut first = true;
        for &(flag, name) in flags.iter() {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                first = false;
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}
