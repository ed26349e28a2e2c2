use clap::{Args, Subcommand};
use std::path::PathBuf;

use agentlink_frame::DEFAULT_CAPACITY;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod send;
pub mod serve;
pub mod version;

/// Address `serve` binds when none is given.
pub const DEFAULT_ADDR: &str = "127.0.0.1:1534";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and echo every message back.
    Serve(ServeArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (port 0 picks a free port).
    #[arg(default_value = DEFAULT_ADDR)]
    pub addr: String,
    /// Input buffer capacity per connection, in bytes.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,
    /// Stop accepting after echoing N messages; exit once connections close.
    #[arg(long)]
    pub count: Option<usize>,
    /// Stack size for pool worker threads, in bytes.
    #[arg(long, value_name = "BYTES")]
    pub worker_stack_size: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Address to connect to.
    pub addr: String,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Wait for one reply message and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
