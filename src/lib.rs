//! `tgen-rs`: a programmable network traffic generator driven by an
//! action graph and Markov packet models.
//!
//! A run reads a GraphML action graph (`graph`) describing `Start`,
//! `Stream`, `Pause`, `Flow` and `End` vertices, and drives traversal
//! of that graph on a single-threaded epoll event loop (`reactor`).
//! Each `Stream` vertex opens a connection — directly or through a
//! SOCKS5 proxy (`transport`) — speaks the wire protocol that
//! exchanges packet-timing models and generates payload traffic
//! against them (`stream`, `markov`), and reports its outcome back to
//! the `driver`, which is the only place global byte/stream counters
//! live.
//!
//! ## Example
//!
//! ```no_run
//! use tgen_rs::config::RuntimeConfig;
//! use tgen_rs::driver::Driver;
//! use tgen_rs::graph::ActionGraph;
//! use tgen_rs::reactor::Reactor;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! let xml = std::fs::read_to_string("graph.xml").unwrap();
//! let graph = ActionGraph::from_graphml(&xml).unwrap();
//! let reactor = Rc::new(RefCell::new(Reactor::new().unwrap()));
//! let runtime = RuntimeConfig::from_env();
//! let driver = Rc::new(RefCell::new(Driver::new(graph, Rc::clone(&reactor), runtime, 0)));
//! Driver::start(&driver, Duration::from_millis(0), Duration::from_secs(1)).unwrap();
//!
//! loop {
//!     reactor.borrow_mut().loop_once(1024, Some(Duration::from_secs(1))).unwrap();
//!     if driver.borrow().has_client_ended() {
//!         break;
//!     }
//! }
//! ```

extern crate libc;
#[macro_use]
extern crate log;

mod sys;
mod net;
mod ready;
mod token;

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod graphml;
pub mod logging;
pub mod markov;
pub mod peer;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod stream;
pub mod timer;
pub mod transport;

pub use net::tcp;
pub use ready::Ready;
pub use token::Token;
