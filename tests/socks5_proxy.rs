//! End-to-end transfer through a hand-rolled SOCKS5 proxy, exercising
//! both the no-auth and username/password handshakes. The fake proxy
//! runs on a background thread using blocking `std::net` sockets; the
//! client side runs on the crate's own single-threaded reactor.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream as StdTcpStream};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use tgen_rs::markov::MarkovModel;
use tgen_rs::peer::Peer;
use tgen_rs::reactor::Reactor;
use tgen_rs::server::Server;
use tgen_rs::stream::{ModelSource, Role, SizeSpec, Stream, StreamOptions};
use tgen_rs::transport::{ProxyConfig, Transport};

type Outcome = Rc<RefCell<Option<(bool, u64, u64)>>>;

fn pump_until<F: Fn() -> bool>(reactor: &Rc<RefCell<Reactor>>, done: F, budget: Duration) {
    let deadline = Instant::now() + budget;
    while !done() && Instant::now() < deadline {
        reactor.borrow_mut().loop_once(64, Some(Duration::from_millis(20))).unwrap();
    }
}

/// Runs a single-connection SOCKS5 proxy that relays the one accepted
/// client connection to `origin` after completing the handshake.
/// `credentials` selects no-auth (`None`) or username/password (`Some`).
fn spawn_fake_proxy(origin: std::net::SocketAddr, credentials: Option<(&'static str, &'static str)>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut client, _) = listener.accept().unwrap();

        let mut greeting = [0u8; 3];
        client.read_exact(&mut greeting).unwrap();
        assert_eq!(greeting[0], 0x05);
        assert_eq!(greeting[1], 0x01);

        let method = if credentials.is_some() { 0x02 } else { 0x00 };
        assert_eq!(greeting[2], method, "client offered an unexpected auth method");
        client.write_all(&[0x05, method]).unwrap();

        if let Some((user, pass)) = credentials {
            let mut head = [0u8; 2];
            client.read_exact(&mut head).unwrap();
            assert_eq!(head[0], 0x01);
            let mut ubuf = vec![0u8; head[1] as usize];
            client.read_exact(&mut ubuf).unwrap();
            let mut plen = [0u8; 1];
            client.read_exact(&mut plen).unwrap();
            let mut pbuf = vec![0u8; plen[0] as usize];
            client.read_exact(&mut pbuf).unwrap();
            assert_eq!(ubuf, user.as_bytes());
            assert_eq!(pbuf, pass.as_bytes());
            client.write_all(&[0x01, 0x00]).unwrap();
        }

        let mut req_head = [0u8; 4];
        client.read_exact(&mut req_head).unwrap();
        assert_eq!(req_head[0], 0x05);
        assert_eq!(req_head[1], 0x01);
        assert_eq!(req_head[3], 0x01, "test peers are resolved IPv4 addresses");
        let mut rest = [0u8; 6];
        client.read_exact(&mut rest).unwrap();

        client.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).unwrap();

        let mut upstream = StdTcpStream::connect(origin).unwrap();
        let mut client_for_reader = client.try_clone().unwrap();
        let mut upstream_for_writer = upstream.try_clone().unwrap();
        let forward = thread::spawn(move || {
            let _ = std::io::copy(&mut client_for_reader, &mut upstream_for_writer);
        });
        let _ = std::io::copy(&mut upstream, &mut client);
        let _ = forward.join();
    });

    addr
}

fn run_transfer_through_proxy(proxy_addr: std::net::SocketAddr, proxy_username: Option<String>, proxy_password: Option<String>) {
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
    let origin_addr = server.local_addr().unwrap();
    reactor.borrow_mut().register_server(Rc::new(RefCell::new(server))).unwrap();

    let credentials = match (&proxy_username, &proxy_password) {
        (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
        _ => None,
    };
    let proxy_listen_addr = spawn_fake_proxy(origin_addr, credentials.map(|(u, p)| (Box::leak(u.to_string().into_boxed_str()) as &str, Box::leak(p.to_string().into_boxed_str()) as &str)));
    assert_eq!(proxy_listen_addr.ip(), proxy_addr.ip());

    let peer = Peer::new("127.0.0.1", origin_addr.ip().to_string().parse().unwrap(), origin_addr.port());
    let proxy = ProxyConfig { addr: proxy_listen_addr, username: proxy_username, password: proxy_password };
    let transport = Transport::connect(peer, Some(proxy), Instant::now()).unwrap();

    let commander_outcome: Outcome = Rc::new(RefCell::new(None));
    let commander_cb = Rc::clone(&commander_outcome);

    let model = MarkovModel::default_model(99);
    let opts = StreamOptions {
        role: Role::Commander,
        hostname: "commander-host".to_string(),
        transfer_id: "socks-transfer".to_string(),
        send_size: SizeSpec::Exact(512),
        recv_size: SizeSpec::Exact(512),
        model_name: "default".to_string(),
        model_seed: 99,
        model_source: Some(ModelSource::Inline(model.to_graphml())),
        model: Some(model),
        stallout: None,
        timeout: Some(Duration::from_secs(10)),
    };

    let commander = Stream::commander(transport, opts, move |ok, sent, received| {
        *commander_cb.borrow_mut() = Some((ok, sent, received));
    });
    reactor.borrow_mut().register_stream(Rc::new(RefCell::new(commander))).unwrap();

    pump_until(&reactor, || commander_outcome.borrow().is_some(), Duration::from_secs(5));

    let (ok, sent, received) = commander_outcome.borrow().expect("commander stream never completed through the proxy");
    assert!(ok, "commander stream reported failure through the proxy");
    assert_eq!(sent, 512);
    assert_eq!(received, 512);
}

#[test]
fn transfer_completes_through_socks5_with_no_auth() {
    // `proxy_addr` here is only used to assert the fake proxy bound
    // where we expect; the real dialing address comes back from
    // `spawn_fake_proxy` itself since port 0 picks an ephemeral port.
    let placeholder: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    run_transfer_through_proxy(placeholder, None, None);
}

#[test]
fn transfer_completes_through_socks5_with_username_and_password() {
    let placeholder: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    run_transfer_through_proxy(placeholder, Some("tgen-user".to_string()), Some("tgen-pass".to_string()));
}
