use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// A non-blocking TCP connection. `connect()` never blocks: it issues the
/// syscall and returns immediately, relying on the caller to watch for
/// the first writable event to know the connection has gone through.
pub struct TcpStream {
    inner: Socket,
}

impl TcpStream {
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        match sock.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(e),
        }
        Ok(TcpStream { inner: sock })
    }

    pub fn from_socket2(inner: Socket) -> TcpStream {
        TcpStream { inner }
    }

    /// Pending error on the socket, surfaced via `SO_ERROR` — used to
    /// distinguish a refused connect from a successful one on the first
    /// writable event.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr().and_then(|a| {
            a.as_socket().ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet address"))
        })
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Write)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.inner).read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.inner).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.inner).flush()
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl FromRawFd for TcpStream {
    unsafe fn from_raw_fd(fd: RawFd) -> TcpStream {
        TcpStream { inner: Socket::from_raw_fd(fd) }
    }
}

impl IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

/// A non-blocking TCP listener with `SO_REUSEADDR` (and, where supported,
/// `SO_REUSEPORT`) enabled.
pub struct TcpListener {
    inner: Socket,
}

impl TcpListener {
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        #[cfg(target_os = "linux")]
        {
            let _ = sock.set_reuse_port(true);
        }
        sock.bind(&SockAddr::from(addr))?;
        sock.listen(1024)?;
        sock.set_nonblocking(true)?;
        Ok(TcpListener { inner: sock })
    }

    /// Accepts one pending connection, or `WouldBlock` if none are ready.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (sock, addr) = self.inner.accept()?;
        sock.set_nonblocking(true)?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet address"))?;
        Ok((TcpStream { inner: sock }, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet address"))
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
