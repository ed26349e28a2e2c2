use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use agentlink_asyncreq::WorkerPool;
use agentlink_frame::Symbol;
use agentlink_transport::{EventLoop, MessageHandler, StreamChannel};
use bytes::Bytes;

use crate::cmd::SendArgs;
use crate::exit::{transport_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let addr = resolve_addr(&args.addr)?;
    let payload = resolve_payload(&args)?;

    let mut event_loop = EventLoop::new(WorkerPool::new());
    let mut replies = FirstReply::default();
    let id = event_loop
        .connect(addr, &mut replies)
        .map_err(|err| transport_error("connect failed", err))?;

    event_loop
        .send_message(id, &payload)
        .and_then(|()| event_loop.flush(id))
        .map_err(|err| transport_error("send failed", err))?;
    tracing::debug!(size = payload.len(), %addr, "message sent");

    if args.wait {
        let reply = wait_for_reply(&mut event_loop, &mut replies, wait_timeout)?;
        print_message(&reply, Some(addr), format);
    }

    if let Some(channel) = event_loop.channel_mut(id) {
        let queued = channel.send_eos();
        if let Err(err) = queued.and_then(|()| event_loop.flush(id)) {
            tracing::warn!(error = %err, "end of stream not delivered");
        }
    }

    Ok(SUCCESS)
}

fn wait_for_reply(
    event_loop: &mut EventLoop,
    replies: &mut FirstReply,
    timeout: Duration,
) -> CliResult<Bytes> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(reply) = replies.reply.take() {
            return Ok(reply);
        }
        if replies.closed || event_loop.channel_count() == 0 {
            return Err(CliError::new(
                FAILURE,
                "connection closed before a reply arrived",
            ));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CliError::new(
                TIMEOUT,
                format!("no reply within {}ms", timeout.as_millis()),
            ));
        }
        event_loop
            .poll(replies, Some(remaining))
            .map_err(|err| transport_error("receive failed", err))?;
    }
}

/// Keeps the first complete reply and stops the loop.
#[derive(Default)]
struct FirstReply {
    reply: Option<Bytes>,
    closed: bool,
}

impl MessageHandler for FirstReply {
    fn on_message(&mut self, channel: &mut StreamChannel) -> ControlFlow<()> {
        let (payload, end) = channel.read_payload();
        if end != Symbol::Eom || self.reply.is_some() {
            return ControlFlow::Continue(());
        }
        self.reply = Some(payload);
        ControlFlow::Break(())
    }

    fn on_close(&mut self, _channel: &mut StreamChannel) -> ControlFlow<()> {
        self.closed = true;
        ControlFlow::Break(())
    }
}

fn resolve_addr(input: &str) -> CliResult<SocketAddr> {
    input
        .to_socket_addrs()
        .map_err(|err| CliError::new(USAGE, format!("invalid address {input}: {err}")))?
        .next()
        .ok_or_else(|| CliError::new(USAGE, format!("address {input} did not resolve")))
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SendArgs {
        SendArgs {
            addr: "127.0.0.1:1534".to_string(),
            json: None,
            data: None,
            file: None,
            wait: false,
            wait_timeout: "5s".to_string(),
        }
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration(" 7 ").unwrap(), Duration::from_secs(7));
    }

    #[test]
    fn rejects_bad_durations() {
        for input in ["", "0s", "abc", "-1s", "5m"] {
            let err = parse_duration(input).unwrap_err();
            assert_eq!(err.code, USAGE, "input {input:?}");
        }
    }

    #[test]
    fn payload_sources() {
        let mut data = args();
        data.data = Some("hello".to_string());
        assert_eq!(resolve_payload(&data).unwrap(), b"hello");

        let mut json = args();
        json.json = Some("{\"x\":1}".to_string());
        assert_eq!(resolve_payload(&json).unwrap(), b"{\"x\":1}");

        assert!(resolve_payload(&args()).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_usage_error() {
        let mut json = args();
        json.json = Some("{nope".to_string());
        assert_eq!(resolve_payload(&json).unwrap_err().code, USAGE);
    }

    #[test]
    fn resolves_literal_address() {
        let addr = resolve_addr("127.0.0.1:9").unwrap();
        assert_eq!(addr.port(), 9);
        assert_eq!(resolve_addr("not an address").unwrap_err().code, USAGE);
    }
}
