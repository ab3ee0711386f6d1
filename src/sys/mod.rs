//! Thin wrappers around the raw syscalls the reactor needs that
//! `std`/`socket2` don't expose: `epoll_create1`/`epoll_wait`/`epoll_ctl`
//! and `timerfd_create`/`timerfd_settime`. The macro below wraps a libc
//! call and turns a `-1` return into `io::Error::last_os_error()`, used
//! the same way throughout this module.

#[macro_export]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod epoll;
pub mod fd;
pub mod timerfd;
