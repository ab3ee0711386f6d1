//! Entry point: parse arguments, bring up logging and runtime
//! configuration, load the action graph, wire up the reactor and
//! driver, and run the event loop until the graph's stop conditions
//! end the client side.
//!
//! Any passive server ports named in the graph are bound before the
//! first `Start` traversal so an early peer connecting in can never
//! race the listener.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use tgen_rs::cli::Cli;
use tgen_rs::config::RuntimeConfig;
use tgen_rs::driver::Driver;
use tgen_rs::graph::ActionGraph;
use tgen_rs::logging;
use tgen_rs::reactor::Reactor;

use log::info;

const MAX_EVENTS_PER_LOOP: usize = 1024;
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    logging::init(logging::level_from_verbosity(cli.verbosity));

    match run(cli) {
        Ok(()) => {
            info!("[driver-status] client-ended, shutting down");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("[driver-error] {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let xml = std::fs::read_to_string(&cli.graph).map_err(|e| format!("reading {:?}: {}", cli.graph, e))?;
    let graph = ActionGraph::from_graphml(&xml)?;
    let server_ports = graph.server_ports();

    let runtime = RuntimeConfig::from_env();
    info!("[driver-status] hostname={} graph={:?}", runtime.hostname, cli.graph);

    let reactor = Rc::new(RefCell::new(Reactor::new()?));
    let seed = driver_seed();
    let driver = Rc::new(RefCell::new(Driver::new(graph, Rc::clone(&reactor), runtime.clone(), seed)));

    for port in server_ports {
        Driver::listen(&driver, port)?;
        let bind_ip = runtime.bind_ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
        info!("[driver-status] listening on {}", SocketAddr::new(bind_ip, port));
    }

    Driver::start(&driver, Duration::from_millis(0), HEARTBEAT_PERIOD)?;

    loop {
        reactor.borrow_mut().loop_once(MAX_EVENTS_PER_LOOP, Some(POLL_TIMEOUT))?;
        if driver.borrow().has_client_ended() {
            break;
        }
    }

    Ok(())
}

/// Seeds the driver's own RNG (peer selection, weighted edge choice, pause
/// times, and per-vertex model seeds left at `0`) from wall-clock time and
/// pid; per-stream reproducibility comes from the vertex-configured
/// packet-model seed, not from this value.
fn driver_seed() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ (std::process::id() as u64).wrapping_mul(0x9E3779B97F4A7C15)
}
