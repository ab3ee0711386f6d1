use std::os::unix::io::{RawFd, AsRawFd, FromRawFd, IntoRawFd};
use std::time::Duration;
use std::mem;
use std::io::{self, Read};
use std::convert::TryInto;
use std::fmt;

use super::fd::FileDesc;

#[derive(Clone, Copy)]
#[repr(i32)]
pub enum Clock {
    Realtime = libc::CLOCK_REALTIME,
    Monotonic = libc::CLOCK_MONOTONIC,
    Boottime = libc::CLOCK_BOOTTIME,
    RealtimeAlarm = libc::CLOCK_REALTIME_ALARM,
    BoottimeAlarm = libc::CLOCK_BOOTTIME_ALARM
}

impl Clock {
    pub fn clock_name(&self) -> &'static str {
        match self {
            Clock::Realtime       => "CLOCK_REALTIME",
            Clock::RealtimeAlarm  => "CLOCK_REALTIME_ALARM",
            Clock::Monotonic      => "CLOCK_MONOTONIC",
            Clock::Boottime       => "CLOCK_BOOTTIME",
            Clock::BoottimeAlarm  => "CLOCK_BOOTTIME_ALARM",
        }
    }
}

impl fmt::Display for Clock {
    fn fmt (&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.clock_name())
    }
}

impl fmt::Debug for Clock {
    fn fmt (&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.clone() as i32, self.clock_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetTimeFlags {
    /// Flags to `timerfd_settime(2)`.
    ///
    /// The default is zero, i. e. all bits unset.
    Default,

    /// Interpret new_value.it_value as an absolute value on the timer's clock. The timer will
    /// expire when the value of the timer's clock reaches the value specified in
    /// new_value.it_value.
    Abstime,
}

pub const TFD_CLOEXEC: i32 = libc::TFD_CLOEXEC;
pub const TFD_NONBLOCK: i32 = libc::TFD_NONBLOCK;

const TFD_TIMER_ABSTIME: i32 = libc::TFD_TIMER_ABSTIME;

/// A `timerfd(2)` descriptor: the reactor watches it for readability and
/// drains the expiration count on each fire (see `crate::timer::Timer`).
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc
}

#[derive(Debug, Clone)]
pub struct TimerSpec {
    pub interval: Duration,
    pub value: Duration
}

impl TimerFd {
    /// Create a timerfd with clockid `CLOCK_MONOTONIC` and flags
    /// `TFD_CLOEXEC | TFD_NONBLOCK`.
    pub fn new() -> io::Result<TimerFd> {
        let flags = TFD_CLOEXEC | TFD_NONBLOCK;
        TimerFd::create(Clock::Monotonic, flags)
    }

    pub fn create(clock: Clock, flags: i32) -> io::Result<TimerFd> {
        let timerfd = crate::syscall!(timerfd_create(clock as i32, flags))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(timerfd) }
        })
    }

    pub fn settime(&self, value: TimerSpec, flags: SetTimeFlags) -> io::Result<TimerSpec> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(value.interval),
            it_value: duration_to_timespec(value.value)
        };

        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        let flags = match flags {
            SetTimeFlags::Default => 0,
            SetTimeFlags::Abstime => TFD_TIMER_ABSTIME,
        };

        crate::syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            flags,
            &new_value,
            &mut old_value
        ))?;

        Ok(TimerSpec {
            interval: timespec_to_duration(old_value.it_interval),
            value: timespec_to_duration(old_value.it_value)
        })
    }

    pub fn gettime(&self) -> io::Result<TimerSpec> {
        let mut itimerspec: libc::itimerspec = unsafe { mem::zeroed() };

        crate::syscall!(timerfd_gettime(
            self.inner.as_raw_fd(),
            &mut itimerspec
        ))?;

        Ok(TimerSpec {
            interval: timespec_to_duration(itimerspec.it_interval),
            value: timespec_to_duration(itimerspec.it_value)
        })
    }

    /// Drains the expiration counter. Returns the number of expirations
    /// since the last read (always `1` for a one-shot timer that fired
    /// exactly once, but can be `>1` for a persistent timer whose owner
    /// was slow to re-poll).
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        match (&self.inner).read_exact(&mut buf) {
            Ok(()) => Ok(u64::from_ne_bytes(buf)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().try_into().unwrap(),
        tv_nsec: duration.subsec_nanos().try_into().unwrap()
    }
}

fn timespec_to_duration(timespec: libc::timespec) -> Duration {
    Duration::new(timespec.tv_sec as u64, timespec.tv_nsec as u32)
}

impl FromRawFd for TimerFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        TimerFd {
            inner: FileDesc::new(fd)
        }
    }
}

impl IntoRawFd for TimerFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
