//! Completion delivery onto the owning event loop.
//!
//! Workers never run consumer logic. They post the finished request to the
//! queue named by its [`CompletionTarget`], and the thread that owns the
//! [`EventQueue`] picks it up.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use tracing::debug;

use crate::request::AsyncRequest;

/// Identifies the consumer a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

/// Where a finished request is delivered.
#[derive(Debug, Clone)]
pub struct CompletionTarget {
    tx: Sender<AsyncRequest>,
    token: Token,
}

impl CompletionTarget {
    pub fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn post(&self, req: AsyncRequest) {
        if let Err(err) = self.tx.send(req) {
            debug!(token = ?self.token, kind = ?err.0.kind(), "event queue closed; completion dropped");
        }
    }
}

/// Completion queue owned by a single event-loop thread.
///
/// Completions arrive in the order workers posted them. [`wait_for`]
/// lets a consumer block for one specific token; completions for other
/// tokens seen meanwhile are kept and handed out first by the `next*`
/// methods, preserving arrival order.
///
/// [`wait_for`]: EventQueue::wait_for
#[derive(Debug)]
pub struct EventQueue {
    tx: Sender<AsyncRequest>,
    rx: Receiver<AsyncRequest>,
    deferred: RefCell<VecDeque<AsyncRequest>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            deferred: RefCell::new(VecDeque::new()),
        }
    }

    /// A completion target that reports to this queue under `token`.
    pub fn target(&self, token: Token) -> CompletionTarget {
        CompletionTarget {
            tx: self.tx.clone(),
            token,
        }
    }

    /// Block until the next completion arrives.
    ///
    /// Returns `None` only if the queue is disconnected, which cannot happen
    /// while the queue itself is alive.
    pub fn next(&self) -> Option<AsyncRequest> {
        if let Some(req) = self.deferred.borrow_mut().pop_front() {
            return Some(req);
        }
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for the next completion.
    pub fn next_timeout(&self, timeout: Duration) -> Option<AsyncRequest> {
        if let Some(req) = self.deferred.borrow_mut().pop_front() {
            return Some(req);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(req) => Some(req),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take a completion if one is ready.
    pub fn try_next(&self) -> Option<AsyncRequest> {
        if let Some(req) = self.deferred.borrow_mut().pop_front() {
            return Some(req);
        }
        match self.rx.try_recv() {
            Ok(req) => Some(req),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block until a completion for `token` arrives.
    ///
    /// Completions for other tokens received meanwhile are deferred.
    pub fn wait_for(&self, token: Token) -> Option<AsyncRequest> {
        {
            let mut deferred = self.deferred.borrow_mut();
            if let Some(pos) = deferred.iter().position(|req| req.token() == token) {
                return deferred.remove(pos);
            }
        }
        loop {
            let req = self.rx.recv().ok()?;
            if req.token() == token {
                return Some(req);
            }
            self.deferred.borrow_mut().push_back(req);
        }
    }

    /// Number of completions received but not yet handed out.
    pub fn deferred_len(&self) -> usize {
        self.deferred.borrow().len()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
