//! The I/O reactor: a single-threaded event loop over `epoll(7)` that
//! multiplexes sockets, timers, and the listening server.
//!
//! The reactor holds every registered descriptor's `Child` directly
//! (unique ownership, not a refcounted pair of function pointers the way
//! a C reactor would do it — see DESIGN.md). A `Child` is a tagged enum
//! rather than an opaque `void*` pair, so dispatch is a `match`.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::ready::Ready;
use crate::server::Server;
use crate::stream::Stream;
use crate::sys;
use crate::timer::Timer;
use crate::token::Token;
use std::cell::RefCell;
use std::rc::Rc;

/// What a child wants watched next, and (for `WRITE_DEFERRED`) when.
#[derive(Clone, Copy, Debug)]
pub struct EventResponse {
    pub wanted: Ready,
    pub defer_until: Option<Instant>,
}

impl EventResponse {
    pub fn want(wanted: Ready) -> EventResponse {
        EventResponse { wanted, defer_until: None }
    }

    pub fn done() -> EventResponse {
        EventResponse { wanted: Ready::done(), defer_until: None }
    }

    pub fn write_deferred(until: Instant) -> EventResponse {
        EventResponse { wanted: Ready::write_deferred(), defer_until: Some(until) }
    }
}

/// A registered child, tagged by what kind of thing it is. The
/// `DeferWrite` variant is reactor-internal bookkeeping only (see
/// `Reactor::arm_defer`); it's never constructed by a caller of
/// `register_*`.
#[derive(Clone)]
enum Child {
    Stream(Rc<RefCell<Stream>>),
    Timer(Rc<RefCell<Timer>>),
    Server(Rc<RefCell<Server>>),
    DeferWrite { owner: RawFd },
}

struct Registration {
    child: Child,
    watched: Ready,
    defer_timer_fd: Option<RawFd>,
}

pub struct Reactor {
    epoll: sys::epoll::Epoll,
    events: sys::epoll::Events,
    children: HashMap<RawFd, Registration>,
    /// Owns the kernel timer for any in-flight write deferral; keyed by
    /// the defer timer's own fd (which is also its `children` key).
    defer_timers: HashMap<RawFd, sys::timerfd::TimerFd>,
}

const DEFAULT_MAX_EVENTS: usize = 1024;

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            epoll: sys::epoll::Epoll::new()?,
            events: sys::epoll::Events::with_capacity(DEFAULT_MAX_EVENTS),
            children: HashMap::new(),
            defer_timers: HashMap::new(),
        })
    }

    pub fn epoll_descriptor(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    pub fn register_stream(&mut self, stream: Rc<RefCell<Stream>>) -> io::Result<()> {
        let fd = stream.borrow().as_raw_fd();
        self.register(fd, Child::Stream(stream), Ready::readable() | Ready::writable())
    }

    pub fn register_timer(&mut self, timer: Rc<RefCell<Timer>>) -> io::Result<()> {
        let fd = timer.borrow().as_raw_fd();
        self.register(fd, Child::Timer(timer), Ready::readable())
    }

    pub fn register_server(&mut self, server: Rc<RefCell<Server>>) -> io::Result<()> {
        let fd = server.borrow().as_raw_fd();
        self.register(fd, Child::Server(server), Ready::readable())
    }

    pub fn cancel_timer(&mut self, fd: RawFd) -> io::Result<()> {
        self.deregister(fd)
    }

    fn register(&mut self, fd: RawFd, child: Child, initial: Ready) -> io::Result<()> {
        if self.children.contains_key(&fd) {
            warn!("reactor: fd {} already registered, replacing", fd);
            self.deregister(fd)?;
        }
        self.epoll.add(fd, Token(fd as usize), initial)?;
        self.children.insert(fd, Registration { child, watched: initial, defer_timer_fd: None });
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(reg) = self.children.remove(&fd) {
            if let Some(defer_fd) = reg.defer_timer_fd {
                self.cancel_defer(defer_fd);
            }
            let _ = self.epoll.delete(fd);
            match reg.child {
                Child::Stream(s) => s.borrow_mut().on_drop(),
                Child::Timer(t) => t.borrow_mut().on_drop(),
                Child::Server(srv) => srv.borrow_mut().on_drop(),
                Child::DeferWrite { .. } => {}
            }
        }
        Ok(())
    }

    fn cancel_defer(&mut self, defer_fd: RawFd) {
        self.defer_timers.remove(&defer_fd);
        if self.children.remove(&defer_fd).is_some() {
            let _ = self.epoll.delete(defer_fd);
        }
    }

    /// Collects up to `max_events` ready descriptors and dispatches each.
    /// Returns the number dispatched; callers should re-invoke while the
    /// return value equals `max_events`.
    pub fn loop_once(&mut self, max_events: usize, timeout: Option<Duration>) -> io::Result<usize> {
        let n = self.epoll.wait(&mut self.events, timeout)?;
        let n = n.min(max_events);

        let mut batch = Vec::with_capacity(n);
        for i in 0..n {
            if let Some(evt) = self.events.get(i) {
                batch.push(evt);
            }
        }

        let mut dispatched = 0;
        for (token, readable, writable, done) in batch {
            let fd = usize::from(token) as RawFd;
            if !self.children.contains_key(&fd) {
                // Deregistered earlier in this same batch, or stale.
                continue;
            }
            self.dispatch_one(fd, readable, writable, done)?;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    fn dispatch_one(&mut self, fd: RawFd, readable: bool, writable: bool, hup: bool) -> io::Result<()> {
        let child = match self.children.get(&fd) {
            Some(reg) => reg.child.clone(),
            None => return Ok(()),
        };

        let mut ready = Ready::empty();
        if readable {
            ready |= Ready::readable();
        }
        if writable {
            ready |= Ready::writable();
        }
        if hup {
            ready |= Ready::hup();
        }

        match child {
            Child::DeferWrite { owner } => {
                if let Some(tfd) = self.defer_timers.get(&fd) {
                    let _ = tfd.read();
                }
                self.resume_write(owner)?;
                self.deregister(fd)?;
            }
            Child::Stream(s) => {
                let resp = s.borrow_mut().on_event(ready);
                self.apply_response(fd, resp)?;
            }
            Child::Timer(t) => {
                let resp = t.borrow_mut().on_event(ready);
                self.apply_response(fd, resp)?;
            }
            Child::Server(srv) => {
                let accepted = srv.borrow_mut().accept_ready();
                for (sock, addr, created_at) in accepted {
                    let stream = srv.borrow_mut().dispatch_accept(sock, addr, created_at);
                    if let Some(stream) = stream {
                        self.register_stream(stream)?;
                    }
                }
                self.apply_response(fd, EventResponse::want(Ready::readable()))?;
            }
        }
        Ok(())
    }

    fn apply_response(&mut self, fd: RawFd, resp: EventResponse) -> io::Result<()> {
        if resp.wanted.is_done() {
            return self.deregister(fd);
        }
        if resp.wanted.is_write_deferred() {
            let until = resp.defer_until.unwrap_or_else(Instant::now);
            self.arm_defer(fd, until)?;
            return self.set_watched(fd, Ready::readable());
        }
        self.set_watched(fd, resp.wanted.as_epoll_interest())
    }

    fn set_watched(&mut self, fd: RawFd, want: Ready) -> io::Result<()> {
        let changed = match self.children.get(&fd) {
            Some(reg) => reg.watched != want,
            None => return Ok(()),
        };
        if !changed {
            return Ok(());
        }
        self.epoll.modify(fd, Token(fd as usize), want)?;
        if let Some(reg) = self.children.get_mut(&fd) {
            reg.watched = want;
        }
        Ok(())
    }

    fn arm_defer(&mut self, owner_fd: RawFd, until: Instant) -> io::Result<()> {
        let now = Instant::now();
        let delay = until.saturating_duration_since(now);

        let existing = self.children.get(&owner_fd).and_then(|r| r.defer_timer_fd);
        if let Some(defer_fd) = existing {
            if let Some(tfd) = self.defer_timers.get(&defer_fd) {
                tfd.settime(
                    sys::timerfd::TimerSpec { interval: Duration::ZERO, value: delay.max(Duration::from_nanos(1)) },
                    sys::timerfd::SetTimeFlags::Default,
                )?;
                return Ok(());
            }
        }

        let tfd = sys::timerfd::TimerFd::new()?;
        tfd.settime(
            sys::timerfd::TimerSpec { interval: Duration::ZERO, value: delay.max(Duration::from_nanos(1)) },
            sys::timerfd::SetTimeFlags::Default,
        )?;
        let defer_fd = tfd.as_raw_fd();
        self.epoll.add(defer_fd, Token(defer_fd as usize), Ready::readable())?;
        self.children.insert(
            defer_fd,
            Registration { child: Child::DeferWrite { owner: owner_fd }, watched: Ready::readable(), defer_timer_fd: None },
        );
        self.defer_timers.insert(defer_fd, tfd);
        if let Some(reg) = self.children.get_mut(&owner_fd) {
            reg.defer_timer_fd = Some(defer_fd);
        }
        Ok(())
    }

    fn resume_write(&mut self, owner_fd: RawFd) -> io::Result<()> {
        if let Some(reg) = self.children.get_mut(&owner_fd) {
            reg.defer_timer_fd = None;
            let want = reg.watched | Ready::writable();
            drop(reg);
            return self.set_watched(owner_fd, want);
        }
        Ok(())
    }

    /// Iterates children that care about timeouts; those reporting "timed
    /// out" are deregistered only after the full iteration completes, so a
    /// deregistration never invalidates the iterator.
    pub fn check_timeouts(&mut self, now: Instant) -> io::Result<()> {
        let mut expired = Vec::new();
        for (&fd, reg) in self.children.iter() {
            let timed_out = match &reg.child {
                Child::Stream(s) => s.borrow_mut().on_check_timeout(now),
                Child::Timer(t) => t.borrow_mut().on_check_timeout(now),
                Child::Server(_) | Child::DeferWrite { .. } => false,
            };
            if timed_out {
                expired.push(fd);
            }
        }
        for fd in expired {
            debug!("reactor: fd {} timed out, deregistering", fd);
            self.deregister(fd)?;
        }
        Ok(())
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}
