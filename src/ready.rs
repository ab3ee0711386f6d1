use std::fmt;
use std::ops;

/// A set of readiness bits reported by the [`reactor`](crate::reactor) and
/// returned by event handlers to describe what they want watched next.
///
/// Beyond the usual `readable`/`writable`/`error`/`hup` bits, this adds
/// the two bits the stream protocol and transport need to talk to the
/// reactor: `DONE` (deregister
/// and drop the child) and `WRITE_DEFERRED` (stop watching for write until
/// an absolute time is reached).
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Ready(u8);

const READABLE: u8 = 0b0000_0001;
const WRITABLE: u8 = 0b0000_0010;
const ERROR: u8 = 0b0000_0100;
const HUP: u8 = 0b0000_1000;
const DONE: u8 = 0b0001_0000;
const WRITE_DEFERRED: u8 = 0b0010_0000;

impl Ready {
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    /// The child is finished; the reactor should deregister and drop it.
    #[inline]
    pub fn done() -> Ready {
        Ready(DONE)
    }

    /// Write readiness is wanted, but not until a later absolute time.
    /// Supersedes a plain `writable()` bit (see `Reactor::dispatch`).
    #[inline]
    pub fn write_deferred() -> Ready {
        Ready(WRITE_DEFERRED)
    }

    #[inline]
    pub fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self.0 & ERROR != 0
    }

    #[inline]
    pub fn is_hup(self) -> bool {
        self.0 & HUP != 0
    }

    #[inline]
    pub fn is_done(self) -> bool {
        self.0 & DONE != 0
    }

    #[inline]
    pub fn is_write_deferred(self) -> bool {
        self.0 & WRITE_DEFERRED != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    /// The subset of `self` that the epoll layer actually understands
    /// (readable/writable only — `DONE` and `WRITE_DEFERRED` are reactor
    /// control bits, never passed to `epoll_ctl`).
    #[inline]
    pub fn as_epoll_interest(self) -> Ready {
        Ready(self.0 & (READABLE | WRITABLE))
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut flag = |name: &str, set: bool, f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if set {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
            Ok(())
        };
        flag("R", self.is_readable(), f)?;
        flag("W", self.is_writable(), f)?;
        flag("ERR", self.is_error(), f)?;
        flag("HUP", self.is_hup(), f)?;
        flag("DONE", self.is_done(), f)?;
        flag("DEFER", self.is_write_deferred(), f)?;
        if first {
            write!(f, "(empty)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_query() {
        let r = Ready::readable() | Ready::writable();
        assert!(r.is_readable());
        assert!(r.is_writable());
        assert!(!r.is_done());
    }

    #[test]
    fn epoll_interest_strips_control_bits() {
        let r = Ready::writable() | Ready::done();
        let interest = r.as_epoll_interest();
        assert!(interest.is_writable());
        assert!(!interest.is_done());
    }

    #[test]
    fn sub_removes_bits() {
        let r = Ready::readable() | Ready::writable();
        let r = r - Ready::writable();
        assert!(r.is_readable());
        assert!(!r.is_writable());
    }
}
