//! Transport: a non-blocking TCP socket plus, optionally, a SOCKS5
//! handshake driven in front of it. Owned exclusively by its `Stream`,
//! which drives it with readiness events until it reaches
//! `SUCCESS_OPEN` and then takes the raw descriptor over for the stream
//! protocol itself.
//!
//! The handshake is byte-exact against the SOCKS5 wire format; partial
//! reads/writes are buffered rather than looped to completion, since
//! looping would block the single reactor thread.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{SocksStatus, TransportError};
use crate::net::tcp::TcpStream;
use crate::peer::Peer;
use crate::ready::Ready;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub addr: SocketAddr,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connecting,
    ProxyInit,
    ProxyChoice,
    ProxyAuthReq,
    ProxyAuthResp,
    ProxyRequest,
    ProxyResponseStatus,
    ProxyResponseType,
    ProxyResponseIpv4,
    ProxyResponseNameLen,
    ProxyResponseName,
    SuccessOpen,
    SuccessEof,
}

pub enum Outcome {
    /// Handshake still in progress; the reactor should watch this ready
    /// set next.
    Pending(Ready),
    /// `SUCCESS_OPEN`: the socket is ready for the stream protocol.
    Open,
    Eof,
    Failed(TransportError),
}

pub struct Transport {
    stream: TcpStream,
    peer: Arc<Peer>,
    proxy: Option<ProxyConfig>,
    state: State,
    out: Vec<u8>,
    out_pos: usize,
    in_buf: Vec<u8>,
    in_need: usize,
    name_len: u8,
    auth_method: u8,
    bytes_read: u64,
    bytes_written: u64,
    created_at: Instant,
    last_activity: Instant,
}

impl Transport {
    /// Begins a connection to `peer`, optionally via `proxy`. The
    /// returned transport is in `CONNECTING` state; drive it with
    /// `on_event` on every writable/readable notification.
    pub fn connect(peer: Arc<Peer>, proxy: Option<ProxyConfig>, now: Instant) -> io::Result<Transport> {
        let target = match &proxy {
            Some(p) => p.addr,
            None => peer.socket_addr(),
        };
        let stream = TcpStream::connect(target)?;
        Ok(Transport {
            stream,
            peer,
            proxy,
            state: State::Connecting,
            out: Vec::new(),
            out_pos: 0,
            in_buf: Vec::new(),
            in_need: 0,
            name_len: 0,
            auth_method: 0,
            bytes_read: 0,
            bytes_written: 0,
            created_at: now,
            last_activity: now,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Hands the underlying socket to the caller once `SUCCESS_OPEN` has
    /// been reached (the stream protocol reads/writes it directly from
    /// then on).
    pub fn into_socket(self) -> TcpStream {
        self.stream
    }

    pub fn stallout_timeout_exceeded(&self, now: Instant, stallout: Option<Duration>, timeout: Option<Duration>) -> Option<TransportError> {
        if let Some(t) = timeout {
            if now.duration_since(self.created_at) > t {
                return Some(TransportError::Timeout);
            }
        }
        if let Some(s) = stallout {
            if now.duration_since(self.last_activity) > s {
                return Some(TransportError::Stallout);
            }
        }
        None
    }

    pub fn on_event(&mut self, _ready: Ready, now: Instant) -> Outcome {
        self.last_activity = now;
        loop {
            let result = match self.state {
                State::Connecting => self.step_connecting(),
                State::ProxyInit => self.step_write(State::ProxyChoice, |_| {}),
                State::ProxyChoice => self.step_proxy_choice(),
                State::ProxyAuthReq => self.step_write(State::ProxyAuthResp, |_| {}),
                State::ProxyAuthResp => self.step_proxy_auth_resp(),
                State::ProxyRequest => self.step_write(State::ProxyResponseStatus, |t| {
                    t.in_need = 3;
                }),
                State::ProxyResponseStatus => self.step_proxy_response_status(),
                State::ProxyResponseType => self.step_proxy_response_type(),
                State::ProxyResponseIpv4 => self.step_proxy_response_ipv4(),
                State::ProxyResponseNameLen => self.step_proxy_response_namelen(),
                State::ProxyResponseName => self.step_proxy_response_name(),
                State::SuccessOpen => return Outcome::Open,
                State::SuccessEof => return Outcome::Eof,
            };
            match result {
                StepResult::Continue => continue,
                StepResult::WouldBlock(want) => return Outcome::Pending(want),
                StepResult::Failed(e) => return Outcome::Failed(e),
                StepResult::Ready => {
                    if self.state == State::SuccessOpen {
                        return Outcome::Open;
                    }
                    continue;
                }
            }
        }
    }

    fn step_connecting(&mut self) -> StepResult {
        match self.stream.take_error() {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => return StepResult::Failed(TransportError::Connect),
        }

        if self.proxy.is_some() {
            self.begin_proxy_init();
            StepResult::Continue
        } else {
            self.state = State::SuccessOpen;
            StepResult::Ready
        }
    }

    fn begin_proxy_init(&mut self) {
        let has_auth = self
            .proxy
            .as_ref()
            .map(|p| p.username.is_some() || p.password.is_some())
            .unwrap_or(false);
        self.auth_method = if has_auth { 0x02 } else { 0x00 };
        self.out = vec![0x05, 0x01, self.auth_method];
        self.out_pos = 0;
        self.state = State::ProxyInit;
        self.in_need = 2;
    }

    /// Drains `self.out`; on completion transitions to `next` (after
    /// calling `prepare` to arm the next expected-read length) and reads
    /// `in_need` bytes for the following step.
    fn step_write(&mut self, next: State, prepare: impl FnOnce(&mut Transport)) -> StepResult {
        match drain(&mut self.stream, &mut self.out, &mut self.out_pos, &mut self.bytes_written) {
            Ok(true) => {
                self.out.clear();
                self.out_pos = 0;
                self.state = next;
                prepare(self);
                self.in_buf.clear();
                StepResult::Continue
            }
            Ok(false) => StepResult::WouldBlock(Ready::writable()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => StepResult::WouldBlock(Ready::writable()),
            Err(_) => StepResult::Failed(TransportError::Write),
        }
    }

    fn fill(&mut self) -> Result<bool, TransportError> {
        match fill_exact(&mut self.stream, &mut self.in_buf, self.in_need, &mut self.bytes_read) {
            Ok(FillOutcome::Complete) => Ok(true),
            Ok(FillOutcome::Pending) => Ok(false),
            Ok(FillOutcome::Eof) => Err(TransportError::Read),
            Err(_) => Err(TransportError::Read),
        }
    }

    fn step_proxy_choice(&mut self) -> StepResult {
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return StepResult::WouldBlock(Ready::readable()),
            Err(e) => return StepResult::Failed(e),
        }
        if self.in_buf[0] != 0x05 {
            return StepResult::Failed(TransportError::Version);
        }
        if self.in_buf[1] != self.auth_method {
            return StepResult::Failed(TransportError::Choice);
        }
        if self.auth_method == 0x02 {
            let user = self.proxy.as_ref().and_then(|p| p.username.as_deref()).unwrap_or("");
            let pass = self.proxy.as_ref().and_then(|p| p.password.as_deref()).unwrap_or("");
            let user = &user.as_bytes()[..user.len().min(255)];
            let pass = &pass.as_bytes()[..pass.len().min(255)];
            let mut out = vec![0x01, user.len() as u8];
            out.extend_from_slice(user);
            out.push(pass.len() as u8);
            out.extend_from_slice(pass);
            self.out = out;
            self.out_pos = 0;
            self.state = State::ProxyAuthReq;
        } else {
            self.build_proxy_request();
        }
        StepResult::Continue
    }

    fn step_proxy_auth_resp(&mut self) -> StepResult {
        if self.in_need == 0 {
            self.in_need = 2;
            self.in_buf.clear();
        }
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return StepResult::WouldBlock(Ready::readable()),
            Err(e) => return StepResult::Failed(e),
        }
        if self.in_buf[0] != 0x01 {
            return StepResult::Failed(TransportError::Version);
        }
        if self.in_buf[1] != 0x00 {
            return StepResult::Failed(TransportError::Auth);
        }
        self.build_proxy_request();
        StepResult::Continue
    }

    fn build_proxy_request(&mut self) {
        let mut out = vec![0x05, 0x01, 0x00];
        if self.peer.is_onion() || self.peer.addr().octets() == [0, 0, 0, 0] {
            out.push(0x03);
            let name = self.peer.host().as_bytes();
            let name = &name[..name.len().min(255)];
            out.push(name.len() as u8);
            out.extend_from_slice(name);
        } else {
            out.push(0x01);
            out.extend_from_slice(&self.peer.addr().octets());
        }
        out.extend_from_slice(&self.peer.port().to_be_bytes());
        self.out = out;
        self.out_pos = 0;
        self.state = State::ProxyRequest;
        self.in_need = 0;
    }

    fn step_proxy_response_status(&mut self) -> StepResult {
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return StepResult::WouldBlock(Ready::readable()),
            Err(e) => return StepResult::Failed(e),
        }
        if self.in_buf[0] != 0x05 {
            return StepResult::Failed(TransportError::Version);
        }
        if self.in_buf[1] != 0x00 {
            return StepResult::Failed(TransportError::Status(SocksStatus::decode(self.in_buf[1])));
        }
        // byte 2 is reserved
        self.state = State::ProxyResponseType;
        self.in_buf.clear();
        self.in_need = 1;
        StepResult::Continue
    }

    fn step_proxy_response_type(&mut self) -> StepResult {
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return StepResult::WouldBlock(Ready::readable()),
            Err(e) => return StepResult::Failed(e),
        }
        match self.in_buf[0] {
            0x01 => {
                self.state = State::ProxyResponseIpv4;
                self.in_buf.clear();
                self.in_need = 6;
            }
            0x03 => {
                self.state = State::ProxyResponseNameLen;
                self.in_buf.clear();
                self.in_need = 1;
            }
            _ => return StepResult::Failed(TransportError::Addr),
        }
        StepResult::Continue
    }

    fn step_proxy_response_ipv4(&mut self) -> StepResult {
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return StepResult::WouldBlock(Ready::readable()),
            Err(e) => return StepResult::Failed(e),
        }
        let addr = [self.in_buf[0], self.in_buf[1], self.in_buf[2], self.in_buf[3]];
        let port = u16::from_be_bytes([self.in_buf[4], self.in_buf[5]]);
        if addr != [0, 0, 0, 0] || port != 0 {
            return StepResult::Failed(TransportError::Reconn);
        }
        self.state = State::SuccessOpen;
        StepResult::Ready
    }

    fn step_proxy_response_namelen(&mut self) -> StepResult {
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return StepResult::WouldBlock(Ready::readable()),
            Err(e) => return StepResult::Failed(e),
        }
        self.name_len = self.in_buf[0];
        self.state = State::ProxyResponseName;
        self.in_buf.clear();
        self.in_need = self.name_len as usize + 2;
        StepResult::Continue
    }

    fn step_proxy_response_name(&mut self) -> StepResult {
        match self.fill() {
            Ok(true) => {}
            Ok(false) => return StepResult::WouldBlock(Ready::readable()),
            Err(e) => return StepResult::Failed(e),
        }
        let port_off = self.name_len as usize;
        let port = u16::from_be_bytes([self.in_buf[port_off], self.in_buf[port_off + 1]]);
        let name_nonempty = self.name_len != 0;
        if name_nonempty || port != 0 {
            return StepResult::Failed(TransportError::Reconn);
        }
        self.state = State::SuccessOpen;
        StepResult::Ready
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.stream.write(buf)?;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

enum StepResult {
    Continue,
    Ready,
    WouldBlock(Ready),
    Failed(TransportError),
}

enum FillOutcome {
    Complete,
    Pending,
    Eof,
}

fn fill_exact(stream: &mut TcpStream, buf: &mut Vec<u8>, need: usize, bytes_read: &mut u64) -> io::Result<FillOutcome> {
    if buf.len() >= need {
        return Ok(FillOutcome::Complete);
    }
    let mut scratch = [0u8; 512];
    loop {
        let remaining = need - buf.len();
        if remaining == 0 {
            return Ok(FillOutcome::Complete);
        }
        let want = remaining.min(scratch.len());
        match stream.read(&mut scratch[..want]) {
            Ok(0) => return Ok(FillOutcome::Eof),
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                *bytes_read += n as u64;
                if buf.len() >= need {
                    return Ok(FillOutcome::Complete);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(FillOutcome::Pending),
            Err(e) => return Err(e),
        }
    }
}

fn drain(stream: &mut TcpStream, buf: &[u8], pos: &mut usize, bytes_written: &mut u64) -> io::Result<bool> {
    while *pos < buf.len() {
        match stream.write(&buf[*pos..]) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                *pos += n;
                *bytes_written += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn auth_method_byte_matches_proxy_credentials() {
        let peer = Peer::new("example.com", Ipv4Addr::new(93, 184, 216, 34), 80);
        let mut t = fake_transport(peer.clone(), None);
        t.begin_proxy_init();
        assert_eq!(t.out, vec![0x05, 0x01, 0x00]);

        let proxy = ProxyConfig {
            addr: "127.0.0.1:9050".parse().unwrap(),
            username: Some("user".into()),
            password: Some("pass".into()),
        };
        let mut t = fake_transport(peer, Some(proxy));
        t.begin_proxy_init();
        assert_eq!(t.out, vec![0x05, 0x01, 0x02]);
    }

    #[test]
    fn proxy_request_uses_domain_form_for_onion_peer() {
        let peer = Peer::resolve("facebookcorewwwi.onion", 80).unwrap();
        let mut t = fake_transport(peer, None);
        t.auth_method = 0x00;
        t.build_proxy_request();
        assert_eq!(t.out[0..3], [0x05, 0x01, 0x00]);
        assert_eq!(t.out[3], 0x03);
        assert_eq!(t.out[4] as usize, "facebookcorewwwi.onion".len());
    }

    #[test]
    fn proxy_request_uses_ipv4_form_for_resolved_peer() {
        let peer = Peer::new("example.com", Ipv4Addr::new(1, 2, 3, 4), 443);
        let mut t = fake_transport(peer, None);
        t.auth_method = 0x00;
        t.build_proxy_request();
        assert_eq!(t.out[0..4], [0x05, 0x01, 0x00, 0x01]);
        assert_eq!(&t.out[4..8], &[1, 2, 3, 4]);
        assert_eq!(u16::from_be_bytes([t.out[8], t.out[9]]), 443);
    }

    /// Builds a `Transport` without actually connecting, for unit-testing
    /// the pure wire-format helpers above. Uses a loopback listener so the
    /// underlying socket is valid without depending on network access.
    fn fake_transport(peer: Arc<Peer>, proxy: Option<ProxyConfig>) -> Transport {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        Transport {
            stream,
            peer,
            proxy,
            state: State::Connecting,
            out: Vec::new(),
            out_pos: 0,
            in_buf: Vec::new(),
            in_need: 0,
            name_len: 0,
            auth_method: 0,
            bytes_read: 0,
            bytes_written: 0,
            created_at: Instant::now(),
            last_activity: Instant::now(),
        }
    }
}
