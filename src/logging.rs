//! Process-wide one-time initialization: the log filter and the
//! `SIGPIPE` handler. Both are set up once, at the top of `main`, and
//! never touched again.

use env_logger::Builder;
use log::LevelFilter;

/// Installs `env_logger` at `level` and ignores `SIGPIPE` process-wide so
/// a half-closed peer socket surfaces as an `EPIPE` write error instead
/// of killing the process.
pub fn init(level: LevelFilter) {
    Builder::new().filter_level(level).format_timestamp_millis().init();
    ignore_sigpipe();
}

fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

pub fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
