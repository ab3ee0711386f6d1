//! Accept path: a listening socket that accepts in a loop until it
//! would block, handing each new connection to a driver-supplied
//! callback that decides whether (and how) to wrap it as a passive
//! `Stream`.
//!
//! Kept decoupled from `Stream` construction: the server's only job is
//! "accept, set nonblocking, hand off", leaving protocol decisions
//! entirely to the callback.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

use log::{debug, warn};

use crate::net::tcp::{TcpListener, TcpStream};
use crate::stream::Stream;

type AcceptCallback = Box<dyn FnMut(TcpStream, SocketAddr, Instant) -> Option<Rc<RefCell<Stream>>>>;

pub struct Server {
    listener: TcpListener,
    on_accept: AcceptCallback,
}

impl Server {
    pub fn bind(
        addr: SocketAddr,
        on_accept: impl FnMut(TcpStream, SocketAddr, Instant) -> Option<Rc<RefCell<Stream>>> + 'static,
    ) -> std::io::Result<Server> {
        let listener = TcpListener::bind(addr)?;
        debug!("server: listening on {}", listener.local_addr()?);
        Ok(Server { listener, on_accept: Box::new(on_accept) })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Drains the accept backlog, tagging each connection with its
    /// acceptance time. Does not invoke the callback directly: that
    /// happens in `dispatch_accept`, kept separate so the reactor can
    /// call `register_stream` without re-entering a borrow of `self`.
    pub fn accept_ready(&mut self) -> Vec<(TcpStream, SocketAddr, Instant)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((sock, addr)) => accepted.push((sock, addr, Instant::now())),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("server: accept error: {}", e);
                    break;
                }
            }
        }
        accepted
    }

    pub fn dispatch_accept(
        &mut self,
        sock: TcpStream,
        addr: SocketAddr,
        created_at: Instant,
    ) -> Option<Rc<RefCell<Stream>>> {
        (self.on_accept)(sock, addr, created_at)
    }

    pub fn on_drop(&mut self) {}
}
