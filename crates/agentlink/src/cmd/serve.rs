use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentlink_asyncreq::{PoolConfig, WorkerPool};
use agentlink_frame::{InputBufConfig, Symbol};
use agentlink_transport::{EventLoop, MessageHandler, StreamChannel, TcpEndpoint};

use crate::cmd::ServeArgs;
use crate::exit::{transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_listening, print_message, OutputFormat};

/// How often the loop wakes to check for Ctrl-C.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    if args.capacity < 2 {
        return Err(CliError::new(USAGE, "--capacity must be at least 2 bytes"));
    }

    let endpoint = TcpEndpoint::bind(args.addr.as_str())
        .map_err(|err| transport_error("bind failed", err))?;
    print_listening(endpoint.local_addr(), format);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let pool = WorkerPool::with_config(PoolConfig {
        stack_size: args.worker_stack_size,
        ..PoolConfig::default()
    });
    let mut event_loop = EventLoop::with_config(
        pool,
        InputBufConfig {
            capacity: args.capacity,
        },
    );
    event_loop.listen(endpoint);

    let mut echo = Echo::new(format, args.count);
    while running.load(Ordering::SeqCst)
        && (event_loop.is_listening() || event_loop.channel_count() > 0)
    {
        event_loop
            .poll(&mut echo, Some(POLL_INTERVAL))
            .map_err(|err| transport_error("serve failed", err))?;

        if echo.limit_reached() && event_loop.is_listening() {
            event_loop.stop_listening();
        }
    }

    tracing::info!(echoed = echo.echoed, "server stopped");
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}

/// Prints and echoes every complete message.
struct Echo {
    format: OutputFormat,
    limit: Option<usize>,
    echoed: usize,
}

impl Echo {
    fn new(format: OutputFormat, limit: Option<usize>) -> Self {
        Self {
            format,
            limit,
            echoed: 0,
        }
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.echoed >= limit)
    }
}

impl MessageHandler for Echo {
    fn on_message(&mut self, channel: &mut StreamChannel) -> ControlFlow<()> {
        let (payload, end) = channel.read_payload();
        if end == Symbol::Eos {
            tracing::debug!(
                channel = %channel.id(),
                size = payload.len(),
                "stream ended inside a message; not echoed"
            );
            return ControlFlow::Continue(());
        }

        print_message(&payload, channel.peer_addr(), self.format);
        tracing::info!(channel = %channel.id(), size = payload.len(), "echoing message");
        match channel.send_message(&payload) {
            Ok(()) => self.echoed += 1,
            Err(err) => tracing::warn!(error = %err, "echo send failed"),
        }
        ControlFlow::Continue(())
    }

    fn on_open(&mut self, channel: &mut StreamChannel) {
        tracing::debug!(channel = %channel.id(), peer = ?channel.peer_addr(), "channel opened");
    }

    fn on_close(&mut self, channel: &mut StreamChannel) -> ControlFlow<()> {
        tracing::info!(channel = %channel.id(), "peer closed stream");
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_counts_echoed_messages() {
        let mut echo = Echo::new(OutputFormat::Json, Some(2));
        assert!(!echo.limit_reached());
        echo.echoed = 2;
        assert!(echo.limit_reached());
    }

    #[test]
    fn no_limit_never_stops() {
        let mut echo = Echo::new(OutputFormat::Json, None);
        echo.echoed = usize::MAX;
        assert!(!echo.limit_reached());
    }
}
