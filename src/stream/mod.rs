//! Stream protocol: the authentication preamble, header exchange,
//! optional model transfer, payload generation/reception, and checksum
//! exchange that make up one logical exchange over one TCP connection.
//!
//! A `Stream` owns its `Transport` until the SOCKS5 handshake (if any)
//! completes, then takes the bare socket over directly — mirroring the
//! way the reactor hands a `Child` unique ownership of its descriptor.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::StreamError;
use crate::markov::{MarkovModel, Observation};
use crate::net::tcp::TcpStream;
use crate::ready::Ready;
use crate::reactor::EventResponse;
use crate::transport::Transport;

pub const AUTH_TOKEN: &[u8; 20] = b"tgen-auth-token-v001";
const PROTOCOL_MAJOR: &str = "1";
const MAX_MODEL_SIZE: u64 = 10 * 1024 * 1024;
const MAX_BUFFER: usize = 32 * 1024;
const PACKET_SIZE: usize = 1460;
const DEFER_THRESHOLD: Duration = Duration::from_millis(10);
const FILLER_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Commander,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Exact(u64),
    ExplicitZero,
    ModelDriven,
}

impl SizeSpec {
    pub fn parse(s: &str) -> Option<SizeSpec> {
        if s == "~" {
            return Some(SizeSpec::ExplicitZero);
        }
        match s.parse::<u64>() {
            Ok(0) => Some(SizeSpec::ModelDriven),
            Ok(n) => Some(SizeSpec::Exact(n)),
            Err(_) => None,
        }
    }

    fn to_header_value(self) -> String {
        match self {
            SizeSpec::ExplicitZero => "~".to_string(),
            SizeSpec::ModelDriven => "0".to_string(),
            SizeSpec::Exact(n) => n.to_string(),
        }
    }

    fn target(self) -> Option<u64> {
        match self {
            SizeSpec::Exact(n) => Some(n),
            _ => None,
        }
    }

    fn is_skipped(self) -> bool {
        matches!(self, SizeSpec::ExplicitZero)
    }
}

#[derive(Debug, Clone)]
pub enum ModelSource {
    Path(String),
    Inline(String),
}

/// Everything a commander needs to open a stream, or a responder needs
/// once it has parsed the incoming command header.
pub struct StreamOptions {
    pub role: Role,
    pub hostname: String,
    pub transfer_id: String,
    pub send_size: SizeSpec,
    pub recv_size: SizeSpec,
    pub model_name: String,
    pub model_seed: u64,
    pub model_source: Option<ModelSource>,
    /// The commander's own local packet model, already built from the
    /// same path/seed it advertises to the responder via `model_source`.
    /// The commander never receives a model back over the wire — it
    /// already has one, and only ships the means to reconstruct it.
    pub model: Option<MarkovModel>,
    pub stallout: Option<Duration>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    None,
    Auth,
    Header,
    Model,
    Payload,
    Checksum,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    None,
    Command,
    Response,
    Payload,
    Checksum,
    Flush,
    Success,
    Error,
}

enum Conn {
    Handshaking(Transport),
    Open(TcpStream),
}

type CompletionCallback = Box<dyn FnOnce(bool, u64, u64)>;

pub struct Stream {
    conn: Option<Conn>,
    role: Role,
    hostname: String,
    transfer_id: String,
    recv: RecvState,
    send: SendState,

    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    out_pos: usize,

    auth_sent: bool,
    header_fields: HashMap<String, String>,

    send_target: SizeSpec,
    recv_target: SizeSpec,
    bytes_sent: u64,
    bytes_received: u64,

    model: Option<MarkovModel>,
    model_name: String,
    model_seed: u64,
    model_source: Option<ModelSource>,
    expecting_model_bytes: Option<u64>,
    model_buf: Vec<u8>,

    fill_rng: StdRng,
    accumulated_delay: Duration,
    defer_until: Option<Instant>,

    md5_send: Option<md5::Context>,
    md5_recv: Option<md5::Context>,
    pending_checksum_send: Option<String>,

    created_at: Instant,
    last_progress: Option<Instant>,
    stallout: Option<Duration>,
    timeout: Option<Duration>,

    error: Option<StreamError>,
    completion: Option<CompletionCallback>,
    completed: bool,
}

impl Stream {
    /// Commander-side constructor: begins from an in-progress (or
    /// already-open, for a direct connection) `Transport`.
    pub fn commander(
        transport: Transport,
        opts: StreamOptions,
        completion: impl FnOnce(bool, u64, u64) + 'static,
    ) -> Stream {
        let now = Instant::now();
        Stream {
            conn: Some(Conn::Handshaking(transport)),
            role: Role::Commander,
            hostname: opts.hostname,
            transfer_id: opts.transfer_id,
            recv: RecvState::None,
            send: SendState::None,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            auth_sent: false,
            header_fields: HashMap::new(),
            send_target: opts.send_size,
            recv_target: opts.recv_size,
            bytes_sent: 0,
            bytes_received: 0,
            model: opts.model,
            model_name: opts.model_name,
            model_seed: opts.model_seed,
            model_source: opts.model_source,
            expecting_model_bytes: None,
            model_buf: Vec::new(),
            fill_rng: StdRng::seed_from_u64(opts.model_seed ^ 0x5151_5151_5151_5151),
            accumulated_delay: Duration::ZERO,
            defer_until: None,
            md5_send: None,
            md5_recv: None,
            pending_checksum_send: None,
            created_at: now,
            last_progress: None,
            stallout: opts.stallout,
            timeout: opts.timeout,
            error: None,
            completion: Some(Box::new(completion)),
            completed: false,
        }
    }

    /// Responder-side constructor: the socket is already open (accepted
    /// by the `Server`), no transport handshake is needed.
    pub fn responder(
        socket: TcpStream,
        hostname: String,
        stallout: Option<Duration>,
        timeout: Option<Duration>,
        completion: impl FnOnce(bool, u64, u64) + 'static,
    ) -> Stream {
        let now = Instant::now();
        Stream {
            conn: Some(Conn::Open(socket)),
            role: Role::Responder,
            hostname,
            transfer_id: String::new(),
            recv: RecvState::None,
            send: SendState::None,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            out_pos: 0,
            auth_sent: false,
            header_fields: HashMap::new(),
            send_target: SizeSpec::ExplicitZero,
            recv_target: SizeSpec::ExplicitZero,
            bytes_sent: 0,
            bytes_received: 0,
            model: None,
            model_name: String::new(),
            model_seed: 0,
            model_source: None,
            expecting_model_bytes: None,
            model_buf: Vec::new(),
            fill_rng: StdRng::seed_from_u64(0),
            accumulated_delay: Duration::ZERO,
            defer_until: None,
            md5_send: None,
            md5_recv: None,
            pending_checksum_send: None,
            created_at: now,
            last_progress: None,
            stallout,
            timeout,
            error: None,
            completion: Some(Box::new(completion)),
            completed: false,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match self.conn.as_ref().expect("conn always present while registered") {
            Conn::Handshaking(t) => t.as_raw_fd(),
            Conn::Open(s) => std::os::unix::io::AsRawFd::as_raw_fd(s),
        }
    }

    pub fn on_event(&mut self, ready: Ready) -> EventResponse {
        if let Some(Conn::Handshaking(_)) = self.conn {
            match self.drive_transport(ready) {
                Some(resp) => return resp,
                None => {} // fell through to SUCCESS_OPEN, continue below
            }
        }

        self.run_state_machines()
    }

    fn drive_transport(&mut self, ready: Ready) -> Option<EventResponse> {
        let now = Instant::now();
        let Conn::Handshaking(transport) = self.conn.as_mut().unwrap() else { return None };
        match transport.on_event(ready, now) {
            crate::transport::Outcome::Pending(want) => Some(EventResponse::want(want)),
            crate::transport::Outcome::Open => {
                if let Some(Conn::Handshaking(t)) = self.conn.take() {
                    self.conn = Some(Conn::Open(t.into_socket()));
                }
                None
            }
            crate::transport::Outcome::Eof => {
                self.fail(StreamError::ReadEof);
                Some(EventResponse::done())
            }
            crate::transport::Outcome::Failed(e) => {
                self.fail(e.into());
                Some(EventResponse::done())
            }
        }
    }

    pub fn on_check_timeout(&mut self, now: Instant) -> bool {
        if self.completed {
            return true;
        }
        if let Some(timeout) = self.timeout {
            if now.duration_since(self.created_at) >= timeout {
                self.fail(StreamError::Timeout);
                return true;
            }
        }
        if let Some(stallout) = self.stallout {
            if let Some(last) = self.last_progress {
                if now.duration_since(last) >= stallout {
                    self.fail(StreamError::Stallout);
                    return true;
                }
            }
        }
        false
    }

    pub fn on_drop(&mut self) {
        if !self.completed {
            self.finish(false);
        }
    }

    fn fail(&mut self, err: StreamError) {
        if self.error.is_none() {
            warn!("[stream-error] transfer_id={} error={}", self.transfer_id, err);
            self.error = Some(err);
        }
        self.recv = RecvState::Error;
        self.send = SendState::Error;
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        info!(
            "[stream-complete] transfer_id={} success={} sent={} received={}",
            self.transfer_id, success, self.bytes_sent, self.bytes_received
        );
        if let Some(cb) = self.completion.take() {
            cb(success, self.bytes_sent, self.bytes_received);
        }
    }

    fn mark_progress(&mut self, n: usize) {
        if n > 0 {
            self.last_progress = Some(Instant::now());
        }
    }

    fn run_state_machines(&mut self) -> EventResponse {
        loop {
            let recv_progress = self.step_recv();
            let send_progress = self.step_send();

            if self.recv == RecvState::Error || self.send == SendState::Error {
                return EventResponse::done();
            }

            let both_done = self.recv == RecvState::Success && self.send == SendState::Success;
            if both_done {
                self.finish(true);
                return EventResponse::done();
            }

            if !recv_progress && !send_progress {
                break;
            }
        }

        if let Some(until) = self.defer_until.take() {
            return EventResponse::write_deferred(until);
        }

        let mut want = Ready::empty();
        if self.wants_read() {
            want |= Ready::readable();
        }
        if self.wants_write() {
            want |= Ready::writable();
        }
        EventResponse::want(want)
    }

    fn wants_read(&self) -> bool {
        !matches!(self.recv, RecvState::Success | RecvState::Error)
    }

    fn wants_write(&self) -> bool {
        !matches!(self.send, SendState::Success | SendState::Error) || self.out_pos < self.out_buf.len()
    }

    // ---- recv state machine ----

    fn step_recv(&mut self) -> bool {
        match self.recv {
            RecvState::None => {
                self.recv = RecvState::Auth;
                true
            }
            RecvState::Auth => self.recv_auth(),
            RecvState::Header => self.recv_header(),
            RecvState::Model => self.recv_model(),
            RecvState::Payload => self.recv_payload(),
            RecvState::Checksum => self.recv_checksum(),
            RecvState::Success | RecvState::Error => false,
        }
    }

    fn fill_in_buf(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; 8192];
        let conn = self.conn.as_mut().expect("conn present");
        let n = match conn {
            Conn::Open(s) => s.read(&mut scratch)?,
            Conn::Handshaking(_) => return Ok(0),
        };
        if n > 0 {
            self.in_buf.extend_from_slice(&scratch[..n]);
        }
        Ok(n)
    }

    fn recv_auth(&mut self) -> bool {
        let need = AUTH_TOKEN.len() + 1;
        match self.fill_in_buf() {
            Ok(0) if self.in_buf.len() < need => {
                self.fail(StreamError::ReadEof);
                return false;
            }
            Ok(n) => self.mark_progress(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(_) => {
                self.fail(StreamError::Read);
                return false;
            }
        }
        if self.in_buf.len() < need {
            return false;
        }
        let ok = &self.in_buf[..AUTH_TOKEN.len()] == AUTH_TOKEN.as_slice() && self.in_buf[AUTH_TOKEN.len()] == b' ';
        self.in_buf.drain(..need);
        if !ok {
            self.fail(StreamError::Auth);
            return false;
        }
        self.recv = RecvState::Header;
        true
    }

    fn recv_header(&mut self) -> bool {
        if !self.in_buf.contains(&b'\n') {
            match self.fill_in_buf() {
                Ok(0) => {
                    self.fail(StreamError::ReadEof);
                    return false;
                }
                Ok(n) => self.mark_progress(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => {
                    self.fail(StreamError::Read);
                    return false;
                }
            }
            if !self.in_buf.contains(&b'\n') {
                return false;
            }
        }

        let pos = self.in_buf.iter().position(|&b| b == b'\n').unwrap();
        let line: Vec<u8> = self.in_buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();

        let fields = parse_header(&line);

        match self.role {
            Role::Commander => self.apply_response_header(fields),
            Role::Responder => self.apply_command_header(fields),
        }
    }

    fn apply_response_header(&mut self, fields: HashMap<String, String>) -> bool {
        for required in ["protocol_version", "hostname", "code"] {
            if !fields.contains_key(required) {
                self.fail(StreamError::HeaderIncomplete);
                return false;
            }
        }
        if !version_major_matches(&fields["protocol_version"]) {
            self.fail(StreamError::HeaderVersion);
            return false;
        }
        if fields["code"] != "NONE" {
            self.fail(StreamError::Header);
            return false;
        }
        self.header_fields = fields;
        self.recv = RecvState::Payload;
        true
    }

    fn apply_command_header(&mut self, fields: HashMap<String, String>) -> bool {
        for required in [
            "protocol_version",
            "hostname",
            "transfer_id",
            "send_size",
            "recv_size",
            "model_name",
            "model_seed",
            "model_mode",
        ] {
            if !fields.contains_key(required) {
                self.fail(StreamError::HeaderIncomplete);
                return false;
            }
        }
        if !version_major_matches(&fields["protocol_version"]) {
            self.fail(StreamError::HeaderVersion);
            return false;
        }

        self.transfer_id = fields["transfer_id"].clone();
        self.model_name = fields["model_name"].clone();
        self.model_seed = fields["model_seed"].parse().unwrap_or(0);
        self.fill_rng = StdRng::seed_from_u64(self.model_seed ^ 0x5151_5151_5151_5151);

        // Responder's own send/recv directions mirror the commander's.
        let cmd_send = match SizeSpec::parse(&fields["send_size"]) {
            Some(s) => s,
            None => {
                self.fail(StreamError::HeaderIncomplete);
                return false;
            }
        };
        let cmd_recv = match SizeSpec::parse(&fields["recv_size"]) {
            Some(s) => s,
            None => {
                self.fail(StreamError::HeaderIncomplete);
                return false;
            }
        };
        self.recv_target = cmd_send;
        self.send_target = cmd_recv;

        match fields["model_mode"].as_str() {
            "graphml" => {
                let size: u64 = match fields.get("model_size").and_then(|s| s.parse().ok()) {
                    Some(n) if n > 0 && n <= MAX_MODEL_SIZE => n,
                    _ => {
                        self.fail(StreamError::HeaderModelSize);
                        return false;
                    }
                };
                self.expecting_model_bytes = Some(size);
                self.recv = RecvState::Model;
            }
            "path" => {
                let path = match fields.get("model_path") {
                    Some(p) => p.clone(),
                    None => {
                        self.fail(StreamError::HeaderModelMode);
                        return false;
                    }
                };
                match std::fs::read_to_string(&path).ok().and_then(|xml| {
                    MarkovModel::from_graphml(&xml, self.model_seed, self.model_name.clone()).ok()
                }) {
                    Some(model) => {
                        self.model = Some(model);
                        self.begin_payload();
                    }
                    None => {
                        self.fail(StreamError::HeaderModelPath);
                        return false;
                    }
                }
            }
            _ => {
                self.fail(StreamError::HeaderModelMode);
                return false;
            }
        }

        self.header_fields = fields;
        self.send = SendState::Response;
        true
    }

    fn recv_model(&mut self) -> bool {
        let need = self.expecting_model_bytes.unwrap_or(0) as usize;
        if self.in_buf.len() < need {
            match self.fill_in_buf() {
                Ok(0) => {
                    self.fail(StreamError::ReadEof);
                    return false;
                }
                Ok(n) => self.mark_progress(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => {
                    self.fail(StreamError::Read);
                    return false;
                }
            }
            if self.in_buf.len() < need {
                return false;
            }
        }
        let xml_bytes: Vec<u8> = self.in_buf.drain(..need).collect();
        let xml = String::from_utf8_lossy(&xml_bytes).into_owned();
        match MarkovModel::from_graphml(&xml, self.model_seed, self.model_name.clone()) {
            Ok(model) => {
                self.model = Some(model);
                self.begin_payload();
                true
            }
            Err(_) => {
                self.fail(StreamError::Model);
                false
            }
        }
    }

    fn begin_payload(&mut self) {
        self.recv = RecvState::Payload;
        if self.recv_target.is_skipped() {
            self.recv = RecvState::Success;
        }
        if matches!(self.recv_target, SizeSpec::Exact(_)) {
            self.md5_recv = Some(md5::Context::new());
        }
    }

    fn recv_payload(&mut self) -> bool {
        if let SizeSpec::Exact(target) = self.recv_target {
            if self.bytes_received >= target {
                self.recv = RecvState::Checksum;
                return true;
            }
            let remaining = (target - self.bytes_received) as usize;
            match self.read_into_counter(remaining.min(64 * 1024)) {
                ReadOutcome::Progress(n) => {
                    let consumed: Vec<u8> = self.in_buf.drain(..n).collect();
                    if let Some(ctx) = self.md5_recv.as_mut() {
                        ctx.consume(&consumed);
                    }
                    self.bytes_received += n as u64;
                    true
                }
                ReadOutcome::WouldBlock => false,
                ReadOutcome::Eof => {
                    self.fail(StreamError::ReadEof);
                    false
                }
                ReadOutcome::Err => {
                    self.fail(StreamError::Read);
                    false
                }
            }
        } else {
            // Model-driven: ends on peer EOF.
            match self.read_into_counter(64 * 1024) {
                ReadOutcome::Progress(n) => {
                    self.in_buf.drain(..n);
                    self.bytes_received += n as u64;
                    true
                }
                ReadOutcome::WouldBlock => false,
                ReadOutcome::Eof => {
                    self.recv = RecvState::Success;
                    true
                }
                ReadOutcome::Err => {
                    self.fail(StreamError::Read);
                    false
                }
            }
        }
    }

    fn read_into_counter(&mut self, want: usize) -> ReadOutcome {
        if !self.in_buf.is_empty() {
            return ReadOutcome::Progress(self.in_buf.len().min(want));
        }
        let mut scratch = vec![0u8; want.max(1).min(64 * 1024)];
        let conn = self.conn.as_mut().expect("conn present");
        let res = match conn {
            Conn::Open(s) => s.read(&mut scratch),
            Conn::Handshaking(_) => return ReadOutcome::WouldBlock,
        };
        match res {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => {
                self.in_buf.extend_from_slice(&scratch[..n]);
                self.mark_progress(n);
                ReadOutcome::Progress(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(_) => ReadOutcome::Err,
        }
    }

    fn recv_checksum(&mut self) -> bool {
        if !matches!(self.recv_target, SizeSpec::Exact(_)) {
            self.recv = RecvState::Success;
            return true;
        }
        if !self.in_buf.contains(&b'\n') {
            match self.fill_in_buf() {
                Ok(0) => {
                    self.fail(StreamError::ReadEof);
                    return false;
                }
                Ok(n) => self.mark_progress(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(_) => {
                    self.fail(StreamError::Read);
                    return false;
                }
            }
            if !self.in_buf.contains(&b'\n') {
                return false;
            }
        }
        let pos = self.in_buf.iter().position(|&b| b == b'\n').unwrap();
        let line: Vec<u8> = self.in_buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();

        let mut parts = line.splitn(2, ' ');
        let tag = parts.next().unwrap_or("");
        let hex = parts.next().unwrap_or("");
        if tag != "MD5" || hex.is_empty() {
            self.fail(StreamError::Checksum);
            return false;
        }
        let expected = self
            .md5_recv
            .take()
            .map(|ctx| format!("{:x}", ctx.compute()))
            .unwrap_or_default();
        if !expected.eq_ignore_ascii_case(hex) {
            self.fail(StreamError::Checksum);
            return false;
        }
        self.recv = RecvState::Success;
        true
    }

    // ---- send state machine ----

    fn step_send(&mut self) -> bool {
        let drained = self.drain_out_buf();

        match self.send {
            SendState::None => {
                self.send = match self.role {
                    Role::Commander => SendState::Command,
                    Role::Responder => SendState::Response,
                };
                self.auth_sent = false;
                true
            }
            SendState::Command => self.send_command(drained),
            SendState::Response => self.send_response(drained),
            SendState::Payload => self.send_payload(drained),
            SendState::Checksum => self.send_checksum(drained),
            SendState::Flush => self.send_flush(drained),
            SendState::Success | SendState::Error => false,
        }
    }

    fn drain_out_buf(&mut self) -> bool {
        if self.out_pos >= self.out_buf.len() {
            return false;
        }
        let conn = self.conn.as_mut().expect("conn present");
        let res = match conn {
            Conn::Open(s) => s.write(&self.out_buf[self.out_pos..]),
            Conn::Handshaking(_) => return false,
        };
        match res {
            Ok(0) => false,
            Ok(n) => {
                self.out_pos += n;
                self.bytes_sent_raw(n);
                if self.out_pos >= self.out_buf.len() {
                    self.out_buf.clear();
                    self.out_pos = 0;
                }
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => {
                self.fail(StreamError::Write);
                false
            }
        }
    }

    fn bytes_sent_raw(&mut self, n: usize) {
        self.mark_progress(n);
    }

    fn queue_out(&mut self, bytes: Vec<u8>) {
        if self.out_buf.is_empty() {
            self.out_buf = bytes;
            self.out_pos = 0;
        } else {
            self.out_buf.extend_from_slice(&bytes);
        }
    }

    fn send_command(&mut self, drained: bool) -> bool {
        if !self.auth_sent && self.out_buf.is_empty() {
            let mut bytes = AUTH_TOKEN.to_vec();
            bytes.push(b' ');
            bytes.extend_from_slice(self.build_command_header().as_bytes());
            self.queue_out(bytes);
            self.auth_sent = true;
            return true;
        }
        if self.out_pos >= self.out_buf.len() && self.auth_sent {
            self.begin_send_payload();
            return true;
        }
        drained
    }

    fn build_command_header(&self) -> String {
        let mut parts = vec![
            format!("PROTOCOL_VERSION={}.0", PROTOCOL_MAJOR),
            format!("HOSTNAME={}", self.hostname),
            format!("TRANSFER_ID={}", self.transfer_id),
            format!("SEND_SIZE={}", self.send_target.to_header_value()),
            format!("RECV_SIZE={}", self.recv_target.to_header_value()),
            format!("MODEL_NAME={}", self.model_name),
            format!("MODEL_SEED={}", self.model_seed),
        ];
        match &self.model_source {
            Some(ModelSource::Path(p)) => {
                parts.push("MODEL_MODE=path".to_string());
                parts.push(format!("MODEL_PATH={}", p));
            }
            Some(ModelSource::Inline(xml)) => {
                parts.push("MODEL_MODE=graphml".to_string());
                parts.push(format!("MODEL_SIZE={}", xml.len()));
            }
            None => {
                let xml = self.model.as_ref().map(|m| m.to_graphml()).unwrap_or_default();
                parts.push("MODEL_MODE=graphml".to_string());
                parts.push(format!("MODEL_SIZE={}", xml.len()));
            }
        }
        let mut line = parts.join(" ");
        line.push('\n');
        if self.model_source.is_none() {
            if let Some(model) = &self.model {
                line.push_str(&model.to_graphml());
            }
        }
        if let Some(ModelSource::Inline(xml)) = &self.model_source {
            line.push_str(xml);
        }
        line
    }

    fn send_response(&mut self, drained: bool) -> bool {
        if !self.auth_sent && self.out_buf.is_empty() {
            let mut bytes = AUTH_TOKEN.to_vec();
            bytes.push(b' ');
            let code = if self.error.is_some() { "HEADER" } else { "NONE" };
            let line = format!(
                "PROTOCOL_VERSION={}.0 HOSTNAME={} CODE={}\n",
                PROTOCOL_MAJOR, self.hostname, code
            );
            bytes.extend_from_slice(line.as_bytes());
            self.queue_out(bytes);
            self.auth_sent = true;
            return true;
        }
        if self.out_pos >= self.out_buf.len() && self.auth_sent {
            // `send_target` only becomes meaningful once the command
            // header has been parsed (`apply_command_header`); entering
            // SEND_PAYLOAD any earlier would use the constructor's
            // `ExplicitZero` default and skip the transfer outright.
            if self.command_header_parsed() {
                self.begin_send_payload();
                return true;
            }
            return drained;
        }
        drained
    }

    fn command_header_parsed(&self) -> bool {
        !matches!(self.recv, RecvState::None | RecvState::Auth | RecvState::Header)
    }

    fn begin_send_payload(&mut self) {
        self.send = SendState::Payload;
        if self.send_target.is_skipped() {
            self.send = SendState::Flush;
        } else if matches!(self.send_target, SizeSpec::Exact(_)) {
            self.md5_send = Some(md5::Context::new());
        }
        if self.model.is_none() && !matches!(self.send_target, SizeSpec::ExplicitZero) {
            self.model = Some(MarkovModel::default_model(self.model_seed));
        }
    }

    fn send_payload(&mut self, drained: bool) -> bool {
        if let SizeSpec::Exact(target) = self.send_target {
            if self.bytes_sent >= target {
                self.send = SendState::Checksum;
                return true;
            }
        }
        if !self.out_buf.is_empty() {
            return drained;
        }

        let buffered = self.generate_payload_batch();
        match buffered {
            BatchOutcome::Bytes(bytes) => {
                if let Some(ctx) = self.md5_send.as_mut() {
                    ctx.consume(&bytes);
                }
                self.bytes_sent += bytes.len() as u64;
                self.queue_out(bytes);
                true
            }
            BatchOutcome::Defer(until) => {
                self.defer_until = Some(until);
                false
            }
            BatchOutcome::Done => {
                self.send = SendState::Checksum;
                true
            }
        }
    }

    /// Produces up to `MAX_BUFFER` of payload by repeatedly sampling the
    /// Markov model: `to-server` emits a filler packet (commander) or
    /// `to-origin` does (responder); the other direction only accumulates
    /// delay. `end` either resets (bounded transfer) or stops (unbounded).
    fn generate_payload_batch(&mut self) -> BatchOutcome {
        let mut out = Vec::new();
        let remaining_target = match self.send_target {
            SizeSpec::Exact(target) => Some(target.saturating_sub(self.bytes_sent)),
            _ => None,
        };

        loop {
            if out.len() >= MAX_BUFFER {
                break;
            }
            if let Some(remaining) = remaining_target {
                if out.len() as u64 >= remaining {
                    break;
                }
            }

            let model = match self.model.as_mut() {
                Some(m) => m,
                None => break,
            };
            let (obs, delay_micros) = model.next_observation();
            let i_send = match (self.role, obs) {
                (Role::Commander, Observation::ToServer) => true,
                (Role::Commander, Observation::ToOrigin) => false,
                (Role::Responder, Observation::ToOrigin) => true,
                (Role::Responder, Observation::ToServer) => false,
                (_, Observation::End) => {
                    if matches!(self.send_target, SizeSpec::Exact(_)) {
                        model.reset();
                        continue;
                    } else {
                        return if out.is_empty() { BatchOutcome::Done } else { BatchOutcome::Bytes(out) };
                    }
                }
            };

            if i_send {
                self.accumulated_delay = Duration::ZERO;
                let mut chunk_len = PACKET_SIZE;
                if let Some(remaining) = remaining_target {
                    let already = out.len() as u64;
                    chunk_len = chunk_len.min((remaining.saturating_sub(already)) as usize);
                }
                if chunk_len == 0 {
                    break;
                }
                out.extend(filler_bytes(&mut self.fill_rng, chunk_len));
            } else {
                self.accumulated_delay += Duration::from_micros(delay_micros);
                if self.accumulated_delay > DEFER_THRESHOLD {
                    let until = Instant::now() + self.accumulated_delay;
                    self.accumulated_delay = Duration::ZERO;
                    if !out.is_empty() {
                        return BatchOutcome::Bytes(out);
                    }
                    return BatchOutcome::Defer(until);
                }
            }
        }

        if out.is_empty() {
            BatchOutcome::Defer(Instant::now())
        } else {
            BatchOutcome::Bytes(out)
        }
    }

    fn send_checksum(&mut self, drained: bool) -> bool {
        if !matches!(self.send_target, SizeSpec::Exact(_)) {
            self.send = SendState::Flush;
            return true;
        }
        if self.pending_checksum_send.is_none() {
            let hex = self
                .md5_send
                .take()
                .map(|ctx| format!("{:x}", ctx.compute()))
                .unwrap_or_default();
            self.pending_checksum_send = Some(hex.clone());
            self.queue_out(format!("MD5 {}\n", hex).into_bytes());
            return true;
        }
        if self.out_buf.is_empty() {
            self.send = SendState::Flush;
            return true;
        }
        drained
    }

    fn send_flush(&mut self, drained: bool) -> bool {
        if !self.out_buf.is_empty() {
            return drained;
        }
        if let Some(Conn::Open(s)) = self.conn.as_ref() {
            let _ = s.shutdown_write();
        }
        self.send = SendState::Success;
        true
    }
}

enum ReadOutcome {
    Progress(usize),
    WouldBlock,
    Eof,
    Err,
}

enum BatchOutcome {
    Bytes(Vec<u8>),
    Defer(Instant),
    Done,
}

fn filler_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let letter = FILLER_ALPHABET[rng.gen_range(0..FILLER_ALPHABET.len())];
    vec![letter; len]
}

fn version_major_matches(v: &str) -> bool {
    v.split('.').next().map(|maj| maj == PROTOCOL_MAJOR).unwrap_or(false)
}

fn parse_header(line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for tok in line.split(' ') {
        if tok.is_empty() {
            continue;
        }
        if let Some((k, v)) = tok.split_once('=') {
            fields.insert(k.to_ascii_lowercase(), v.to_string());
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_spec_parses_sentinel_and_numbers() {
        assert_eq!(SizeSpec::parse("~"), Some(SizeSpec::ExplicitZero));
        assert_eq!(SizeSpec::parse("0"), Some(SizeSpec::ModelDriven));
        assert_eq!(SizeSpec::parse("1048576"), Some(SizeSpec::Exact(1048576)));
        assert_eq!(SizeSpec::parse("nope"), None);
    }

    #[test]
    fn header_parsing_is_case_insensitive_on_keys() {
        let fields = parse_header("PROTOCOL_VERSION=1.0 hostname=box CODE=NONE");
        assert_eq!(fields.get("protocol_version"), Some(&"1.0".to_string()));
        assert_eq!(fields.get("hostname"), Some(&"box".to_string()));
        assert_eq!(fields.get("code"), Some(&"NONE".to_string()));
    }

    #[test]
    fn version_major_check() {
        assert!(version_major_matches("1.0"));
        assert!(version_major_matches("1.7"));
        assert!(!version_major_matches("2.0"));
        assert!(!version_major_matches(""));
    }

    #[test]
    fn model_size_over_cap_is_rejected() {
        let oversize = MAX_MODEL_SIZE + 1;
        assert!(oversize > MAX_MODEL_SIZE);
    }
}
