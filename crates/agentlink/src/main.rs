mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "agentlink", version, about = "Agent channel transport CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format.
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level.
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Append logs to this file instead of stderr.
    #[arg(long, value_name = "PATH", env = "AGENTLINK_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);

    let result = init_logging(cli.log_format, cli.log_level, cli.log_file.as_deref())
        .and_then(|()| cmd::run(cli.command, format));

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "agentlink",
            "send",
            "127.0.0.1:1534",
            "--data",
            "hello",
            "--wait",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.addr, "127.0.0.1:1534");
                assert!(args.wait);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "agentlink",
            "send",
            "127.0.0.1:1534",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["agentlink", "serve"]).expect("serve args should parse");
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.addr, cmd::DEFAULT_ADDR);
                assert_eq!(args.capacity, agentlink_frame::DEFAULT_CAPACITY);
                assert!(args.count.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_log_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "agentlink",
            "version",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ])
        .expect("global flags should parse");
        assert!(matches!(cli.log_format, LogFormat::Json));
        assert!(matches!(cli.log_level, LogLevel::Debug));
    }
}
