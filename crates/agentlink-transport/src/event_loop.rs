use std::collections::{BTreeMap, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use agentlink_asyncreq::{AsyncRequest, EventQueue, SockAddr, WorkerPool};
use agentlink_frame::{InputBufConfig, MessageStart};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelId, Slot, StreamChannel};
use crate::error::{Result, TransportError};
use crate::tcp::TcpEndpoint;

/// Token namespace reserved for the listening endpoint.
const LISTENER: ChannelId = ChannelId(0);

/// Application callbacks run by the [`EventLoop`].
pub trait MessageHandler {
    /// A message is ready on `channel`.
    ///
    /// Decode it with [`StreamChannel::read_payload`] or symbol by symbol
    /// through [`StreamChannel::input_mut`]. Whatever the handler leaves
    /// unread is discarded.
    fn on_message(&mut self, channel: &mut StreamChannel) -> ControlFlow<()>;

    /// A channel was accepted or connected.
    fn on_open(&mut self, channel: &mut StreamChannel) {
        let _ = channel;
    }

    /// The peer ended the stream and every message has been handled.
    fn on_close(&mut self, channel: &mut StreamChannel) -> ControlFlow<()> {
        let _ = channel;
        ControlFlow::Continue(())
    }
}

/// Single-threaded dispatcher for completions of one [`EventQueue`].
///
/// The loop and its channels are not `Send`; create them on the thread
/// that runs them.
pub struct EventLoop {
    pool: WorkerPool,
    queue: Rc<EventQueue>,
    config: InputBufConfig,
    listener: Option<TcpEndpoint>,
    accept_pending: bool,
    channels: BTreeMap<ChannelId, StreamChannel>,
    /// Channels whose handler stopped with messages still buffered.
    ready: VecDeque<ChannelId>,
    next_id: u64,
}

impl EventLoop {
    pub fn new(pool: WorkerPool) -> Self {
        Self::with_config(pool, InputBufConfig::default())
    }

    /// Create a loop whose channels use `config` for their input buffers.
    pub fn with_config(pool: WorkerPool, config: InputBufConfig) -> Self {
        Self {
            pool,
            queue: Rc::new(EventQueue::new()),
            config,
            listener: None,
            accept_pending: false,
            channels: BTreeMap::new(),
            ready: VecDeque::new(),
            next_id: LISTENER.0 + 1,
        }
    }

    /// Accept connections on `endpoint` while the loop runs.
    pub fn listen(&mut self, endpoint: TcpEndpoint) {
        let sock = endpoint.as_raw_fd();
        self.listener = Some(endpoint);
        self.post_accept(sock);
    }

    /// Stop accepting connections. `run` returns once every channel has closed.
    pub fn stop_listening(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        if self.accept_pending {
            // SAFETY: the descriptor belongs to `listener`, which is still open.
            unsafe { libc::shutdown(listener.as_raw_fd(), libc::SHUT_RDWR) };
            // A worker may still be inside accept(); keep the descriptor valid.
            debug!("accept still in flight; leaving listening socket open");
            std::mem::forget(listener);
        }
        info!("stopped listening");
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Connect to `addr` through the pool and open a channel on success.
    ///
    /// Blocks until the connect completes; other completions stay queued.
    pub fn connect<H: MessageHandler>(
        &mut self,
        addr: SocketAddr,
        handler: &mut H,
    ) -> Result<ChannelId> {
        let fd = TcpEndpoint::socket(&addr)?;
        let id = self.allocate_id();
        let token = Slot::Connect.token(id);
        self.pool.submit(AsyncRequest::connect(
            fd.as_raw_fd(),
            SockAddr::from_std(&addr),
            self.queue.target(token),
        ));

        let req = self
            .queue
            .wait_for(token)
            .ok_or(TransportError::Closed(id))?;
        req.result()
            .map_err(|source| TransportError::Connect { addr, source })?;

        info!(channel = %id, %addr, "connected");
        self.open_channel(id, TcpStream::from(fd), Some(addr), handler);
        Ok(id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut StreamChannel> {
        self.channels.get_mut(&id)
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Encode and queue a message on channel `id`.
    pub fn send_message(&mut self, id: ChannelId, payload: &[u8]) -> Result<()> {
        self.channels
            .get_mut(&id)
            .ok_or(TransportError::Closed(id))?
            .send_message(payload)
    }

    /// Block until everything queued on channel `id` has been written.
    ///
    /// Completions for other channels stay queued for the next `poll`.
    pub fn flush(&mut self, id: ChannelId) -> Result<()> {
        let token = Slot::Send.token(id);
        loop {
            let channel = self
                .channels
                .get_mut(&id)
                .ok_or(TransportError::Closed(id))?;
            if !channel.has_pending_output() {
                return Ok(());
            }
            let req = self
                .queue
                .wait_for(token)
                .ok_or(TransportError::Closed(id))?;
            channel.on_send(req);
        }
    }

    /// Process at most one completion, waiting up to `timeout` (forever if `None`).
    ///
    /// Messages left buffered when a handler stopped the loop are handed
    /// out first, without waiting.
    pub fn poll<H: MessageHandler>(
        &mut self,
        handler: &mut H,
        timeout: Option<Duration>,
    ) -> Result<ControlFlow<()>> {
        if let Some(flow) = self.service_ready(handler) {
            return Ok(flow);
        }
        let req = match timeout {
            Some(timeout) => self.queue.next_timeout(timeout),
            None => self.queue.next(),
        };
        match req {
            Some(req) => self.dispatch(req, handler),
            None => Ok(ControlFlow::Continue(())),
        }
    }

    /// Run until the handler breaks or nothing is left to wait for.
    pub fn run<H: MessageHandler>(&mut self, handler: &mut H) -> Result<()> {
        while self.listener.is_some() || !self.channels.is_empty() {
            if self.poll(handler, None)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    fn dispatch<H: MessageHandler>(
        &mut self,
        req: AsyncRequest,
        handler: &mut H,
    ) -> Result<ControlFlow<()>> {
        let (id, slot) = Slot::decode(req.token());
        match slot {
            Slot::Accept => {
                self.on_accept(req, handler)?;
                return Ok(ControlFlow::Continue(()));
            }
            Slot::Connect => {
                debug!(channel = %id, "late connect completion ignored");
                return Ok(ControlFlow::Continue(()));
            }
            Slot::Recv | Slot::Send => {}
        }

        let Some(channel) = self.channels.get_mut(&id) else {
            debug!(channel = %id, ?slot, "completion for closed channel ignored");
            return Ok(ControlFlow::Continue(()));
        };
        if slot == Slot::Recv {
            channel.on_recv(req);
        } else {
            channel.on_send(req);
        }

        let flow = service(channel, handler);
        self.settle(id);
        Ok(flow)
    }

    /// Resume a channel the handler stopped on while it had messages queued.
    fn service_ready<H: MessageHandler>(&mut self, handler: &mut H) -> Option<ControlFlow<()>> {
        while let Some(id) = self.ready.pop_front() {
            let Some(channel) = self.channels.get_mut(&id) else {
                continue;
            };
            let flow = service(channel, handler);
            self.settle(id);
            return Some(flow);
        }
        None
    }

    /// Requeue a channel that still has messages; drop one that is done.
    fn settle(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        if channel.is_message_ready() {
            if !self.ready.contains(&id) {
                self.ready.push_back(id);
            }
        } else if channel.is_finished() {
            debug!(channel = %id, "channel closed");
            self.channels.remove(&id);
        }
    }

    fn on_accept<H: MessageHandler>(&mut self, req: AsyncRequest, handler: &mut H) -> Result<()> {
        self.accept_pending = false;
        let Some(sock) = self.listener.as_ref().map(AsRawFd::as_raw_fd) else {
            // The listener was shut down under the pending accept.
            if let Ok(fd) = req.result() {
                // SAFETY: accept() returned a fresh descriptor that nothing else owns.
                drop(unsafe { TcpStream::from_raw_fd(fd as RawFd) });
            }
            return Ok(());
        };
        let fd = match req.result() {
            Ok(fd) => fd,
            Err(err) if listener_is_broken(err.errno()) => {
                error!(error = %err, "listening socket failed; no longer accepting");
                self.stop_listening();
                return Err(TransportError::Accept(err));
            }
            Err(err) => {
                warn!(error = %err, "accept failed; still listening");
                self.post_accept(sock);
                return Ok(());
            }
        };
        let peer = req.peer_addr().and_then(|addr| addr.to_std());
        // SAFETY: accept() returned a fresh descriptor that nothing else owns.
        let stream = unsafe { TcpStream::from_raw_fd(fd as RawFd) };

        let id = self.allocate_id();
        info!(channel = %id, peer = ?peer, "accepted connection");
        self.open_channel(id, stream, peer, handler);
        self.post_accept(sock);
        Ok(())
    }

    fn open_channel<H: MessageHandler>(
        &mut self,
        id: ChannelId,
        stream: TcpStream,
        peer: Option<SocketAddr>,
        handler: &mut H,
    ) {
        let mut channel = StreamChannel::new(
            id,
            stream,
            peer,
            self.pool.clone(),
            Rc::clone(&self.queue),
            self.config.clone(),
        );
        channel.open();
        handler.on_open(&mut channel);
        self.channels.insert(id, channel);
    }

    fn post_accept(&mut self, sock: RawFd) {
        self.accept_pending = true;
        let target = self.queue.target(Slot::Accept.token(LISTENER));
        self.pool.submit(AsyncRequest::accept(sock, true, target));
    }

    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Errors after which the listening socket cannot accept again.
fn listener_is_broken(errno: i32) -> bool {
    matches!(
        errno,
        libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP
    )
}

/// Run the handler for every message the channel has ready.
fn service<H: MessageHandler>(channel: &mut StreamChannel, handler: &mut H) -> ControlFlow<()> {
    if !channel.take_message_ready() {
        return ControlFlow::Continue(());
    }
    let mut flow = ControlFlow::Continue(());
    loop {
        match channel.input_mut().start_message() {
            MessageStart::Message => {
                flow = handler.on_message(channel);
                channel.discard_rest();
                if flow.is_break() {
                    break;
                }
            }
            MessageStart::EndOfStream => {
                if !channel.is_input_closed() {
                    channel.mark_input_closed();
                    flow = handler.on_close(channel);
                }
                break;
            }
            MessageStart::None => break,
        }
    }
    if flow.is_continue() {
        channel.take_message_ready();
    } else {
        debug!(channel = %channel.id(), "handler stopped the loop");
    }
    flow
}

impl Drop for EventLoop {
    /// Workers may still be blocked on these sockets; wake them and wait
    /// for their completions before the descriptors are closed.
    fn drop(&mut self) {
        for channel in self.channels.values_mut() {
            channel.abort();
        }
        while self.channels.values().any(StreamChannel::has_inflight) {
            let Some(req) = self.queue.next() else {
                break;
            };
            let (id, slot) = Slot::decode(req.token());
            match (self.channels.get_mut(&id), slot) {
                (Some(channel), Slot::Recv) => channel.on_recv(req),
                (Some(channel), Slot::Send) => channel.on_send(req),
                _ => {}
            }
        }
        self.stop_listening();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("listener", &self.listener)
            .field("channels", &self.channels.len())
            .field("config", &self.config)
            .finish()
    }
}
