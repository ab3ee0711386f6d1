//! Non-blocking TCP primitives used by the transport and server. Built
//! on `socket2::Socket`, which already gives non-blocking connect,
//! `SO_REUSEADDR`/`SO_REUSEPORT`, and `take_error()` without re-deriving
//! sockaddr conversions by hand.

pub mod tcp;

pub use tcp::{TcpListener, TcpStream};
