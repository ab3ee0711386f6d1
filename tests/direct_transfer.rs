//! End-to-end direct (no proxy) fixed-size transfer over a loopback
//! socket, driven entirely through the crate's own reactor — no
//! external test harness.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tgen_rs::markov::MarkovModel;
use tgen_rs::peer::Peer;
use tgen_rs::reactor::Reactor;
use tgen_rs::server::Server;
use tgen_rs::stream::{ModelSource, Role, SizeSpec, Stream, StreamOptions};
use tgen_rs::transport::Transport;

type Outcome = Rc<RefCell<Option<(bool, u64, u64)>>>;

fn pump_until<F: Fn() -> bool>(reactor: &Rc<RefCell<Reactor>>, done: F, budget: Duration) {
    let deadline = Instant::now() + budget;
    while !done() && Instant::now() < deadline {
        reactor.borrow_mut().loop_once(64, Some(Duration::from_millis(20))).unwrap();
    }
}

#[test]
fn direct_fixed_size_transfer_completes_with_matching_byte_counts() {
    let reactor = Rc::new(RefCell::new(Reactor::new().unwrap()));

    let responder_outcome: Outcome = Rc::new(RefCell::new(None));
    let responder_cb = Rc::clone(&responder_outcome);

    let server = Server::bind("127.0.0.1:0".parse().unwrap(), move |sock, _addr, _created_at| {
        let cb = Rc::clone(&responder_cb);
        let stream = Stream::responder(sock, "responder-host".to_string(), None, Some(Duration::from_secs(10)), move |ok, sent, received| {
            *cb.borrow_mut() = Some((ok, sent, received));
        });
        Some(Rc::new(RefCell::new(stream)))
    })
    .unwrap();

    let addr = server.local_addr().unwrap();
    reactor.borrow_mut().register_server(Rc::new(RefCell::new(server))).unwrap();

    let peer = Peer::new("127.0.0.1", "127.0.0.1".parse().unwrap(), addr.port());
    let transport = Transport::connect(peer, None, Instant::now()).unwrap();

    let commander_outcome: Outcome = Rc::new(RefCell::new(None));
    let commander_cb = Rc::clone(&commander_outcome);

    let model = MarkovModel::default_model(42);
    let opts = StreamOptions {
        role: Role::Commander,
        hostname: "commander-host".to_string(),
        transfer_id: "direct-transfer-1".to_string(),
        send_size: SizeSpec::Exact(4096),
        recv_size: SizeSpec::Exact(4096),
        model_name: "default".to_string(),
        model_seed: 42,
        model_source: Some(ModelSource::Inline(model.to_graphml())),
        model: Some(model),
        stallout: None,
        timeout: Some(Duration::from_secs(10)),
    };

    let commander = Stream::commander(transport, opts, move |ok, sent, received| {
        *commander_cb.borrow_mut() = Some((ok, sent, received));
    });
    reactor.borrow_mut().register_stream(Rc::new(RefCell::new(commander))).unwrap();

    pump_until(&reactor, || commander_outcome.borrow().is_some() && responder_outcome.borrow().is_some(), Duration::from_secs(5));

    let (ok, sent, received) = commander_outcome.borrow().expect("commander stream never completed");
    assert!(ok, "commander stream reported failure");
    assert_eq!(sent, 4096);
    assert_eq!(received, 4096);

    let (ok, _, _) = responder_outcome.borrow().expect("responder stream never completed");
    assert!(ok, "responder stream reported failure");
}

#[test]
fn explicit_zero_size_skips_the_transfer_in_that_direction() {
    let reactor = Rc::new(RefCell::new(Reactor::new().unwrap()));

    let responder_outcome: Outcome = Rc::new(RefCell::new(None));
    let responder_cb = Rc::clone(&responder_outcome);

    let server = Server::bind("127.0.0.1:0".parse().unwrap(), move |sock, _addr, _created_at| {
        let cb = Rc::clone(&responder_cb);
        let stream = Stream::responder(sock, "responder-host".to_string(), None, Some(Duration::from_secs(10)), move |ok, sent, received| {
            *cb.borrow_mut() = Some((ok, sent, received));
        });
        Some(Rc::new(RefCell::new(stream)))
    })
    .unwrap();

    let addr = server.local_addr().unwrap();
    reactor.borrow_mut().register_server(Rc::new(RefCell::new(server))).unwrap();

    let peer = Peer::new("127.0.0.1", "127.0.0.1".parse().unwrap(), addr.port());
    let transport = Transport::connect(peer, None, Instant::now()).unwrap();

    let commander_outcome: Outcome = Rc::new(RefCell::new(None));
    let commander_cb = Rc::clone(&commander_outcome);

    let model = MarkovModel::default_model(7);
    let opts = StreamOptions {
        role: Role::Commander,
        hostname: "commander-host".to_string(),
        transfer_id: "direct-transfer-2".to_string(),
        send_size: SizeSpec::ExplicitZero,
        recv_size: SizeSpec::ExplicitZero,
        model_name: "default".to_string(),
        model_seed: 7,
        model_source: Some(ModelSource::Inline(model.to_graphml())),
        model: Some(model),
        stallout: None,
        timeout: Some(Duration::from_secs(10)),
    };

    let commander = Stream::commander(transport, opts, move |ok, sent, received| {
        *commander_cb.borrow_mut() = Some((ok, sent, received));
    });
    reactor.borrow_mut().register_stream(Rc::new(RefCell::new(commander))).unwrap();

    pump_until(&reactor, || commander_outcome.borrow().is_some() && responder_outcome.borrow().is_some(), Duration::from_secs(5));

    let (ok, sent, received) = commander_outcome.borrow().expect("commander stream never completed");
    assert!(ok, "commander stream reported failure");
    assert_eq!(sent, 0);
    assert_eq!(received, 0);
}
