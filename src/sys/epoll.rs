use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use std::{cmp, i32};

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLHUP};
use libc::{EPOLLIN, EPOLLOUT, EPOLLPRI};
use libc::EPOLLRDHUP;

use crate::ready::Ready;
use crate::token::Token;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Raw `epoll_create1`/`epoll_ctl`/`epoll_wait` wrapper. Interest is always
/// level-triggered (the reactor re-arms explicitly rather than relying on
/// edge-triggered semantics — see `reactor::Reactor::dispatch`).
pub struct Epoll {
    id: usize,
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = crate::syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Epoll { id, epfd })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|to| cmp::min(to.as_millis(), i32::MAX as u128) as c_int)
            .unwrap_or(-1);

        let cnt = loop {
            match crate::syscall!(epoll_wait(
                self.epfd,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as i32,
                timeout_ms
            )) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        unsafe { evts.events.set_len(cnt as usize) };
        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interest),
            u64: usize::from(token) as u64,
        };
        crate::syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interest),
            u64: usize::from(token) as u64,
        };
        crate::syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        crate::syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }
}

fn ioevent_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            events: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.events.capacity()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns `(token, readable, writable, done)` for the event at `idx`.
    /// `done` covers both `EPOLLHUP` and `EPOLLERR` — the reactor treats
    /// either as "this descriptor is finished, tell the child".
    pub fn get(&self, idx: usize) -> Option<(Token, bool, bool, bool)> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let readable = (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0;
            let writable = (epoll & EPOLLOUT) != 0;
            let done =
                (epoll & EPOLLERR) != 0 || (epoll & EPOLLHUP) != 0 || (epoll & EPOLLRDHUP) != 0;
            (Token(event.u64 as usize), readable, writable, done)
        })
    }
}
