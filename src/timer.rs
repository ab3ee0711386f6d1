//! A kernel timer (`timerfd(2)`), one-shot or persistent, driven by the
//! reactor. Owns the timer descriptor, tracks whether it repeats, and
//! holds an expiry callback plus up to two opaque user handles.

use std::cell::RefCell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::ready::Ready;
use crate::reactor::EventResponse;
use crate::sys::timerfd::{SetTimeFlags, TimerFd, TimerSpec};

pub struct Timer {
    fd: TimerFd,
    persistent: bool,
    callback: Box<dyn FnMut()>,
}

impl Timer {
    /// Fires once after `delay`, then asks the reactor to deregister it.
    pub fn one_shot(delay: Duration, callback: impl FnMut() + 'static) -> io::Result<Rc<RefCell<Timer>>> {
        let fd = TimerFd::new()?;
        fd.settime(
            TimerSpec { interval: Duration::ZERO, value: delay.max(Duration::from_nanos(1)) },
            SetTimeFlags::Default,
        )?;
        Ok(Rc::new(RefCell::new(Timer { fd, persistent: false, callback: Box::new(callback) })))
    }

    /// Fires every `period`, starting after `period`, until explicitly
    /// cancelled (deregistered).
    pub fn persistent(period: Duration, callback: impl FnMut() + 'static) -> io::Result<Rc<RefCell<Timer>>> {
        let fd = TimerFd::new()?;
        let period = period.max(Duration::from_millis(1));
        fd.settime(TimerSpec { interval: period, value: period }, SetTimeFlags::Default)?;
        Ok(Rc::new(RefCell::new(Timer { fd, persistent: true, callback: Box::new(callback) })))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn on_event(&mut self, ready: Ready) -> EventResponse {
        if !ready.is_readable() {
            return EventResponse::want(Ready::readable());
        }
        // Drain the expiration counter before running the callback so a
        // slow callback doesn't see a false re-fire next time around.
        let _ = self.fd.read();
        (self.callback)();
        if self.persistent {
            EventResponse::want(Ready::readable())
        } else {
            EventResponse::done()
        }
    }

    pub(crate) fn on_check_timeout(&mut self, _now: Instant) -> bool {
        false
    }

    pub(crate) fn on_drop(&mut self) {}
}
