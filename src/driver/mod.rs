//! Action-graph driver: walks the action graph, opening Streams, arming
//! Pauses, and evaluating stop conditions at End vertices. Holds the
//! only mutable global state in the process — the running byte/stream
//! counters — safe without locking because everything here runs on the
//! single reactor thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use petgraph::graph::NodeIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::RuntimeConfig;
use crate::graph::{ActionGraph, VertexKind};
use crate::markov::MarkovModel;
use crate::reactor::Reactor;
use crate::server::Server;
use crate::stream::{ModelSource, Role, SizeSpec, Stream, StreamOptions};
use crate::timer::Timer;
use crate::transport::{ProxyConfig, Transport};

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    bytes_sent: u64,
    bytes_received: u64,
    streams_succeeded: u64,
    streams_failed: u64,
}

pub struct Driver {
    graph: ActionGraph,
    reactor: Rc<RefCell<Reactor>>,
    runtime: RuntimeConfig,
    rng: StdRng,
    pause_counters: HashMap<NodeIndex, usize>,
    flow_models: HashMap<NodeIndex, MarkovModel>,
    totals: Counters,
    window: Counters,
    client_ended: bool,
    start_time: Option<Instant>,
    servers: Vec<Rc<RefCell<Server>>>,
    next_transfer_id: u64,
}

impl Driver {
    pub fn new(graph: ActionGraph, reactor: Rc<RefCell<Reactor>>, runtime: RuntimeConfig, seed: u64) -> Driver {
        Driver {
            graph,
            reactor,
            runtime,
            rng: StdRng::seed_from_u64(seed),
            pause_counters: HashMap::new(),
            flow_models: HashMap::new(),
            totals: Counters::default(),
            window: Counters::default(),
            client_ended: false,
            start_time: None,
            servers: Vec::new(),
            next_transfer_id: 0,
        }
    }

    /// Schedules the initial traversal and the recurring heartbeat.
    pub fn start(self_rc: &Rc<RefCell<Driver>>, start_delay: Duration, heartbeat_period: Duration) -> std::io::Result<()> {
        self_rc.borrow_mut().start_time = Some(Instant::now());
        self_rc.borrow().graph.log_summary();

        let d = Rc::clone(self_rc);
        let start_idx = self_rc.borrow().graph.start();
        let start_timer = Timer::one_shot(start_delay, move || {
            advance(&d, start_idx);
        })?;
        self_rc.borrow().reactor.borrow_mut().register_timer(start_timer)?;

        let d = Rc::clone(self_rc);
        let heartbeat_timer = Timer::persistent(heartbeat_period, move || {
            heartbeat(&d);
        })?;
        self_rc.borrow().reactor.borrow_mut().register_timer(heartbeat_timer)?;

        Ok(())
    }

    /// Starts a passive server listening at `port`; any accepted
    /// connection is wrapped as a responder `Stream` and registered
    /// with the reactor.
    pub fn listen(self_rc: &Rc<RefCell<Driver>>, port: u16) -> std::io::Result<()> {
        let bind_ip = self_rc.borrow().runtime.bind_ip.unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        let addr = std::net::SocketAddr::new(bind_ip, port);

        let d = Rc::clone(self_rc);
        let hostname = self_rc.borrow().runtime.hostname.clone();
        let server = Server::bind(addr, move |sock, _addr, _created_at| {
            let mut driver = d.borrow_mut();
            let stallout = None;
            let timeout = None;
            let dd = Rc::clone(&d);
            let stream = Stream::responder(sock, hostname.clone(), stallout, timeout, move |success, sent, received| {
                record_stream_counters(&dd, success, sent, received);
            });
            driver.next_transfer_id += 1;
            Some(Rc::new(RefCell::new(stream)))
        })?;
        let server = Rc::new(RefCell::new(server));
        self_rc.borrow_mut().servers.push(Rc::clone(&server));
        self_rc.borrow().reactor.borrow_mut().register_server(server)?;
        Ok(())
    }

    pub fn has_client_ended(&self) -> bool {
        self.client_ended
    }
}

fn advance(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    if driver.borrow().client_ended {
        return;
    }
    let (unweighted, weighted) = driver.borrow().graph.outgoing(idx);

    let mut targets = unweighted;
    if !weighted.is_empty() {
        let total: f64 = weighted.iter().map(|(_, w)| w).sum();
        if total > 0.0 {
            let r: f64 = driver.borrow_mut().rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            for (target, w) in &weighted {
                cumulative += w;
                if cumulative >= r {
                    targets.push(*target);
                    break;
                }
            }
        } else {
            targets.push(weighted[0].0);
        }
    }

    for target in targets {
        visit(driver, target);
    }
}

fn visit(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    let kind = driver.borrow().graph.vertex(idx).kind;
    match kind {
        VertexKind::Start => advance(driver, idx),
        VertexKind::Stream => spawn_stream(driver, idx, true),
        VertexKind::Flow => start_flow(driver, idx),
        VertexKind::Pause => pause(driver, idx),
        VertexKind::End => {
            evaluate_stop_conditions(driver, idx);
            advance(driver, idx);
        }
    }
}

fn pause(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    let times = driver.borrow().graph.vertex(idx).pause_opts.as_ref().and_then(|p| p.times.clone());

    match times {
        Some(pool) if !pool.is_empty() => {
            let delay = {
                let mut d = driver.borrow_mut();
                *pool.random(&mut d.rng).unwrap()
            };
            let d = Rc::clone(driver);
            match Timer::one_shot(delay, move || advance(&d, idx)) {
                Ok(timer) => {
                    let _ = driver.borrow().reactor.borrow_mut().register_timer(timer);
                }
                Err(e) => log::warn!("driver: failed to arm pause timer: {}", e),
            }
        }
        _ => {
            let indegree = driver.borrow().graph.in_degree(idx);
            let mut d = driver.borrow_mut();
            let counter = d.pause_counters.entry(idx).or_insert(0);
            *counter += 1;
            if *counter >= indegree.max(1) {
                *counter = 0;
                drop(d);
                advance(driver, idx);
            }
        }
    }
}

/// `Flow` resolution: an enhanced `Stream` emitter whose inter-arrival
/// delays come from a second, independent Markov model — the "stream"
/// model, distinct from the per-stream "packet"
/// model each spawned Stream carries. Runs until that model reaches its
/// `end` observation or the driver's client side has ended, then
/// advances to the vertex's successors like any other fan-out vertex.
fn start_flow(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    let flow_opts = driver.borrow().graph.vertex(idx).flow_opts.clone();
    let flow_opts = match flow_opts {
        Some(o) => o,
        None => {
            advance(driver, idx);
            return;
        }
    };

    let seed = if flow_opts.stream_model_seed != 0 { flow_opts.stream_model_seed } else { driver.borrow_mut().rng.gen() };
    let model = match &flow_opts.stream_model_path {
        Some(path) => std::fs::read_to_string(path)
            .ok()
            .and_then(|xml| MarkovModel::from_graphml(&xml, seed, "flow-arrivals").ok())
            .unwrap_or_else(|| MarkovModel::default_model(seed)),
        None => MarkovModel::default_model(seed),
    };

    driver.borrow_mut().flow_models.insert(idx, model);
    schedule_flow_arrival(driver, idx);
}

fn schedule_flow_arrival(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    if driver.borrow().client_ended {
        finish_flow(driver, idx);
        return;
    }
    let ended = driver.borrow().flow_models.get(&idx).map(|m| m.has_ended()).unwrap_or(true);
    if ended {
        finish_flow(driver, idx);
        return;
    }

    let delay_micros = {
        let mut d = driver.borrow_mut();
        let model = d.flow_models.get_mut(&idx).expect("flow model armed by start_flow");
        model.next_observation().1
    };

    let d = Rc::clone(driver);
    match Timer::one_shot(Duration::from_micros(delay_micros), move || fire_flow_arrival(&d, idx)) {
        Ok(timer) => {
            let _ = driver.borrow().reactor.borrow_mut().register_timer(timer);
        }
        Err(e) => log::warn!("driver: failed to arm flow arrival timer: {}", e),
    }
}

fn fire_flow_arrival(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    if driver.borrow().client_ended {
        finish_flow(driver, idx);
        return;
    }
    spawn_stream(driver, idx, false);
    schedule_flow_arrival(driver, idx);
}

fn finish_flow(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    driver.borrow_mut().flow_models.remove(&idx);
    advance(driver, idx);
}

fn evaluate_stop_conditions(driver: &Rc<RefCell<Driver>>, idx: NodeIndex) {
    let stop = driver.borrow().graph.vertex(idx).stop_conditions.clone();
    let stop = match stop {
        Some(s) => s,
        None => return,
    };

    let mut d = driver.borrow_mut();
    if d.client_ended {
        return;
    }
    let elapsed = d.start_time.map(|t| t.elapsed()).unwrap_or_default();
    let count = d.totals.streams_succeeded + d.totals.streams_failed;

    let ended = stop.send_size.map(|target| d.totals.bytes_sent >= target).unwrap_or(false)
        || stop.recv_size.map(|target| d.totals.bytes_received >= target).unwrap_or(false)
        || stop.count.map(|target| count >= target).unwrap_or(false)
        || stop.time.map(|target| elapsed >= target).unwrap_or(false);

    if ended {
        info!("[driver-status] client-ended at vertex {:?}", idx);
        d.client_ended = true;
    }
}

/// Opens one stream from `idx`'s configuration. `advance_after` controls
/// whether completion (or an inability to even start) advances the
/// traversal from `idx` to its successors: `true` for a `Stream` vertex,
/// where the spawn *is* the vertex's one visit; `false` for a `Flow`
/// vertex, whose own advance happens once in `finish_flow` regardless of
/// how many streams it emitted along the way.
fn spawn_stream(driver: &Rc<RefCell<Driver>>, idx: NodeIndex, advance_after: bool) {
    let (opts, hostname, seed_base) = {
        let d = driver.borrow();
        let vertex = d.graph.vertex(idx);
        match &vertex.stream_opts {
            Some(o) => (o.clone(), d.runtime.hostname.clone(), o.model_seed),
            None => {
                if advance_after {
                    advance(driver, idx);
                }
                return;
            }
        }
    };

    let peer = {
        let mut d = driver.borrow_mut();
        match opts.peers.random(&mut d.rng) {
            Some(p) => Arc::clone(p),
            None => {
                log::warn!("driver: stream vertex has no configured peers");
                drop(d);
                if advance_after {
                    advance(driver, idx);
                }
                return;
            }
        }
    };

    let model_seed = if seed_base != 0 {
        seed_base
    } else {
        driver.borrow_mut().rng.gen()
    };

    let model = match &opts.model_path {
        Some(path) => match std::fs::read_to_string(path).ok().and_then(|xml| MarkovModel::from_graphml(&xml, model_seed, "configured").ok()) {
            Some(m) => m,
            None => {
                log::warn!("driver: failed to load packet model at {:?}", path);
                MarkovModel::default_model(model_seed)
            }
        },
        None => MarkovModel::default_model(model_seed),
    };

    let model_source = match &opts.model_path {
        Some(path) => ModelSource::Path(path.clone()),
        None => ModelSource::Inline(model.to_graphml()),
    };

    let proxy = opts.socks_proxy.as_ref().and_then(|spec| parse_proxy(spec)).or_else(|| driver.borrow().runtime.default_socks.clone()).map(
        |mut p| {
            p.username = opts.socks_username.clone();
            p.password = opts.socks_password.clone();
            p
        },
    );

    let transport = match Transport::connect(Arc::clone(&peer), proxy, Instant::now()) {
        Ok(t) => t,
        Err(e) => {
            log::warn!("[stream-error] connect failed: {}", e);
            {
                let mut d = driver.borrow_mut();
                d.totals.streams_failed += 1;
                d.window.streams_failed += 1;
            }
            if advance_after {
                advance(driver, idx);
            }
            return;
        }
    };

    let transfer_id = {
        let mut d = driver.borrow_mut();
        d.next_transfer_id += 1;
        format!("{}-{}", hostname, d.next_transfer_id)
    };

    let stream_opts = StreamOptions {
        role: Role::Commander,
        hostname,
        transfer_id,
        send_size: opts.send_size.map(SizeSpec::Exact).unwrap_or(SizeSpec::ModelDriven),
        recv_size: opts.recv_size.map(SizeSpec::Exact).unwrap_or(SizeSpec::ModelDriven),
        model_name: "configured".to_string(),
        model_seed,
        model_source: Some(model_source),
        model: Some(model),
        stallout: opts.stallout,
        timeout: opts.timeout,
    };

    let d = Rc::clone(driver);
    let stream = Stream::commander(transport, stream_opts, move |success, sent, received| {
        if advance_after {
            on_stream_complete(&d, idx, success, sent, received);
        } else {
            record_stream_counters(&d, success, sent, received);
        }
    });

    if let Err(e) = driver.borrow().reactor.borrow_mut().register_stream(Rc::new(RefCell::new(stream))) {
        log::warn!("driver: failed to register stream: {}", e);
        if advance_after {
            advance(driver, idx);
        }
    }
}

/// Records a finished stream's counters. Shared by responder streams
/// (no originating vertex to advance from) and commander streams
/// (which advance separately via `on_stream_complete`).
fn record_stream_counters(driver: &Rc<RefCell<Driver>>, success: bool, sent: u64, received: u64) {
    let mut d = driver.borrow_mut();
    d.totals.bytes_sent += sent;
    d.totals.bytes_received += received;
    d.window.bytes_sent += sent;
    d.window.bytes_received += received;
    if success {
        d.totals.streams_succeeded += 1;
        d.window.streams_succeeded += 1;
    } else {
        d.totals.streams_failed += 1;
        d.window.streams_failed += 1;
    }
}

/// A commander stream finished: record its counters, then advance from
/// the vertex that spawned it to its successors.
fn on_stream_complete(driver: &Rc<RefCell<Driver>>, idx: NodeIndex, success: bool, sent: u64, received: u64) {
    record_stream_counters(driver, success, sent, received);
    advance(driver, idx);
}

fn heartbeat(driver: &Rc<RefCell<Driver>>) {
    let mut d = driver.borrow_mut();
    info!(
        "[driver-heartbeat] window_sent={} window_recv={} window_ok={} window_err={} total_sent={} total_recv={} total_ok={} total_err={}",
        d.window.bytes_sent,
        d.window.bytes_received,
        d.window.streams_succeeded,
        d.window.streams_failed,
        d.totals.bytes_sent,
        d.totals.bytes_received,
        d.totals.streams_succeeded,
        d.totals.streams_failed,
    );
    d.window = Counters::default();
    let reactor = Rc::clone(&d.reactor);
    drop(d);
    let _ = reactor.borrow_mut().check_timeouts(Instant::now());
}

fn parse_proxy(spec: &str) -> Option<ProxyConfig> {
    let addr: std::net::SocketAddr = spec.parse().ok()?;
    Some(ProxyConfig { addr, username: None, password: None })
}
