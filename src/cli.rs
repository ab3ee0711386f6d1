//! Command-line surface: one positional argument, the action-graph
//! file, plus a verbosity flag.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tgen", about = "Programmable network traffic generator", version)]
pub struct Cli {
    /// Path to the action-graph graphml file.
    pub graph: PathBuf,

    /// Increases log verbosity; repeat for more detail (-v, -vv, -vvv).
    #[arg(short = 'v', long = "log-level", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Cli {
    pub fn parse_args() -> Cli {
        Cli::parse()
    }
}
