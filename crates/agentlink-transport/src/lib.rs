//! TCP transport for agent channels.
//!
//! Every blocking socket call (accept, connect, recv, send) runs on the
//! [`WorkerPool`](agentlink_asyncreq::WorkerPool). Completions come back to
//! a single-threaded [`EventLoop`], which feeds received bytes into each
//! channel's [`InputBuf`](agentlink_frame::InputBuf) and runs a
//! [`MessageHandler`] whenever whole messages are available.

pub mod channel;
pub mod error;
pub mod event_loop;
pub mod tcp;

pub use channel::{ChannelId, PoolHost, StreamChannel};
pub use error::{Result, TransportError};
pub use event_loop::{EventLoop, MessageHandler};
pub use tcp::TcpEndpoint;
