use std::collections::VecDeque;
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use agentlink_asyncreq::{AsyncRequest, EventQueue, Operation, Token, WorkerPool};
use agentlink_frame::{
    encode_eos, encode_message, HandleState, InputBuf, InputBufConfig, InputBufHost, Symbol,
};
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};

#[cfg(target_os = "linux")]
const SEND_FLAGS: i32 = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: i32 = 0;

/// Identifies a channel within its [`EventLoop`](crate::EventLoop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which outstanding call of a channel a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Recv,
    Send,
    Connect,
    Accept,
}

impl Slot {
    pub(crate) fn token(self, id: ChannelId) -> Token {
        let tag = match self {
            Slot::Recv => 0,
            Slot::Send => 1,
            Slot::Connect => 2,
            Slot::Accept => 3,
        };
        Token((id.0 << 2) | tag)
    }

    pub(crate) fn decode(token: Token) -> (ChannelId, Slot) {
        let slot = match token.0 & 3 {
            0 => Slot::Recv,
            1 => Slot::Send,
            2 => Slot::Connect,
            _ => Slot::Accept,
        };
        (ChannelId(token.0 >> 2), slot)
    }
}

/// [`InputBufHost`] that reads through the worker pool.
///
/// Keeps at most one `Recv` in flight. Completions normally reach the
/// buffer through the event loop; while a handler is decoding a message
/// that outgrew the buffer, `wait_read` blocks on the event queue for this
/// channel's `Recv` and leaves every other completion queued.
pub struct PoolHost {
    id: ChannelId,
    sock: RawFd,
    pool: WorkerPool,
    queue: Rc<EventQueue>,
    read_pending: bool,
    message_ready: bool,
    aborted: bool,
}

impl PoolHost {
    /// True while a `Recv` is outstanding.
    pub fn read_pending(&self) -> bool {
        self.read_pending
    }
}

impl InputBufHost for PoolHost {
    fn post_read(&mut self, _pos: usize, len: usize) {
        if self.read_pending || self.aborted {
            return;
        }
        self.read_pending = true;
        debug!(channel = %self.id, len, "posting recv");
        let target = self.queue.target(Slot::Recv.token(self.id));
        self.pool
            .submit(AsyncRequest::recv(self.sock, len, 0, target));
    }

    fn wait_read(&mut self, dst: &mut [u8]) -> usize {
        if !self.read_pending {
            self.post_read(0, dst.len());
            if !self.read_pending {
                return 0;
            }
        }
        let Some(req) = self.queue.wait_for(Slot::Recv.token(self.id)) else {
            return 0;
        };
        self.read_pending = false;

        let data = received(self.id, &req);
        let n = data.len().min(dst.len());
        dst[..n].copy_from_slice(&data[..n]);
        n
    }

    fn trigger_message(&mut self) {
        self.message_ready = true;
    }
}

impl fmt::Debug for PoolHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHost")
            .field("id", &self.id)
            .field("sock", &self.sock)
            .field("read_pending", &self.read_pending)
            .field("message_ready", &self.message_ready)
            .field("aborted", &self.aborted)
            .finish()
    }
}

/// Payload of a finished `Recv`; a failed call reads as end of stream.
fn received(id: ChannelId, req: &AsyncRequest) -> &[u8] {
    if let Err(err) = req.result() {
        warn!(channel = %id, error = %err, "recv failed; closing input");
        return &[];
    }
    req.received()
}

/// One connected stream.
///
/// Incoming bytes land in an [`InputBuf`]; outgoing messages are encoded
/// and queued, with at most one `Send` in flight so the peer sees them in
/// order.
#[derive(Debug)]
pub struct StreamChannel {
    id: ChannelId,
    peer: Option<SocketAddr>,
    input: InputBuf<PoolHost>,
    outbox: VecDeque<Bytes>,
    send_in_flight: bool,
    send_failed: bool,
    eos_queued: bool,
    input_closed: bool,
    stream: TcpStream,
}

impl StreamChannel {
    pub(crate) fn new(
        id: ChannelId,
        stream: TcpStream,
        peer: Option<SocketAddr>,
        pool: WorkerPool,
        queue: Rc<EventQueue>,
        config: InputBufConfig,
    ) -> Self {
        let host = PoolHost {
            id,
            sock: stream.as_raw_fd(),
            pool,
            queue,
            read_pending: false,
            message_ready: false,
            aborted: false,
        };
        Self {
            id,
            peer,
            input: InputBuf::with_config(host, config),
            outbox: VecDeque::new(),
            send_in_flight: false,
            send_failed: false,
            eos_queued: false,
            input_closed: false,
            stream,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Direct access to the decoder, for handlers that parse symbol by symbol.
    pub fn input_mut(&mut self) -> &mut InputBuf<PoolHost> {
        &mut self.input
    }

    /// Decode the rest of the current message.
    ///
    /// The symbol says how it ended: [`Symbol::Eom`] for a complete message,
    /// [`Symbol::Eos`] if the stream ended first.
    pub fn read_payload(&mut self) -> (Bytes, Symbol) {
        let mut payload = BytesMut::new();
        let end = self.input.read_to_boundary(&mut payload);
        (payload.freeze(), end)
    }

    /// Encode `payload` as one message and queue it for sending.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<()> {
        if self.eos_queued || self.send_failed {
            return Err(TransportError::Closed(self.id));
        }
        let mut wire = BytesMut::new();
        encode_message(payload, &mut wire);
        self.outbox.push_back(wire.freeze());
        self.pump_send();
        Ok(())
    }

    /// Queue the end-of-stream marker. Nothing can be sent after it.
    pub fn send_eos(&mut self) -> Result<()> {
        if self.eos_queued || self.send_failed {
            return Err(TransportError::Closed(self.id));
        }
        let mut wire = BytesMut::new();
        encode_eos(&mut wire);
        self.outbox.push_back(wire.freeze());
        self.eos_queued = true;
        self.pump_send();
        Ok(())
    }

    /// True while queued output has not been fully written.
    pub fn has_pending_output(&self) -> bool {
        !self.send_failed && (self.send_in_flight || !self.outbox.is_empty())
    }

    /// The peer has ended the stream and every message has been decoded.
    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    /// Start receiving.
    pub(crate) fn open(&mut self) {
        self.input.trigger_read();
    }

    pub(crate) fn on_recv(&mut self, req: AsyncRequest) {
        self.input.host_mut().read_pending = false;
        let data = received(self.id, &req);
        let accepted = self.input.fill(data);
        debug_assert_eq!(accepted, data.len(), "recv larger than its read region");
    }

    pub(crate) fn on_send(&mut self, req: AsyncRequest) {
        self.send_in_flight = false;
        match req.result() {
            Ok(written) => {
                let written = written.max(0) as usize;
                if let Operation::Send { data, .. } = req.into_operation() {
                    if written < data.len() {
                        self.outbox.push_front(data.slice(written..));
                    }
                }
            }
            Err(err) => {
                warn!(channel = %self.id, error = %err, "send failed; dropping queued output");
                self.send_failed = true;
                self.outbox.clear();
            }
        }
        self.pump_send();
    }

    pub(crate) fn take_message_ready(&mut self) -> bool {
        std::mem::take(&mut self.input.host_mut().message_ready)
    }

    pub(crate) fn is_message_ready(&self) -> bool {
        self.input.host().message_ready
    }

    /// Finish a message the handler left partially decoded.
    pub(crate) fn discard_rest(&mut self) {
        if self.input.state() == HandleState::Active {
            let mut sink = BytesMut::new();
            let end = self.input.read_to_boundary(&mut sink);
            debug!(channel = %self.id, skipped = sink.len(), ?end, "discarded unread message tail");
        }
    }

    pub(crate) fn mark_input_closed(&mut self) {
        self.input_closed = true;
    }

    /// A call on this channel's socket is still running on a worker.
    pub(crate) fn has_inflight(&self) -> bool {
        self.send_in_flight || self.input.host().read_pending
    }

    /// Shut the socket down so in-flight calls return, and post nothing more.
    pub(crate) fn abort(&mut self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!(channel = %self.id, error = %err, "shutdown failed");
        }
        self.input.host_mut().aborted = true;
        self.send_failed = true;
        self.outbox.clear();
    }

    /// Nothing is outstanding and nothing more will arrive.
    pub(crate) fn is_finished(&self) -> bool {
        self.input_closed && !self.has_pending_output() && !self.input.host().read_pending
    }

    fn pump_send(&mut self) {
        if self.send_in_flight || self.send_failed {
            return;
        }
        let Some(data) = self.outbox.pop_front() else {
            return;
        };
        self.send_in_flight = true;
        let host = self.input.host();
        let target = host.queue.target(Slot::Send.token(self.id));
        debug!(channel = %self.id, len = data.len(), "posting send");
        host.pool.submit(AsyncRequest::send(
            self.stream.as_raw_fd(),
            data,
            SEND_FLAGS,
            target,
        ));
    }
}
