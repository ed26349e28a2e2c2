use std::os::fd::RawFd;

use bytes::{Bytes, BytesMut};

use crate::addr::SockAddr;
use crate::error::{AsyncReqError, Result};
use crate::events::{CompletionTarget, Token};

/// The kind of blocking call a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
    Recv,
    Send,
    RecvFrom,
    SendTo,
    Accept,
    Connect,
    WaitForProcess,
}

/// A blocking call together with the parameters it owns.
///
/// Input buffers are sized to the number of bytes requested; the worker
/// fills them in place and the request's `rval` says how many are valid.
#[derive(Debug)]
pub enum Operation {
    /// `read(fd, buf, buf.len())`
    Read { fd: RawFd, buf: BytesMut },
    /// `write(fd, data, data.len())`
    Write { fd: RawFd, data: Bytes },
    /// `recv(sock, buf, buf.len(), flags)`
    Recv {
        sock: RawFd,
        buf: BytesMut,
        flags: i32,
    },
    /// `send(sock, data, data.len(), flags)`
    Send { sock: RawFd, data: Bytes, flags: i32 },
    /// `recvfrom(sock, buf, buf.len(), flags, addr)`; `addr` receives the sender.
    RecvFrom {
        sock: RawFd,
        buf: BytesMut,
        flags: i32,
        addr: SockAddr,
    },
    /// `sendto(sock, data, data.len(), flags, addr)`
    SendTo {
        sock: RawFd,
        data: Bytes,
        flags: i32,
        addr: SockAddr,
    },
    /// `accept(sock, addr)`; the peer address is captured when `addr` is set.
    Accept {
        sock: RawFd,
        addr: Option<SockAddr>,
    },
    /// `connect(sock, addr)`
    Connect { sock: RawFd, addr: SockAddr },
    /// `waitpid(pid, &status, options)`
    WaitForProcess {
        pid: libc::pid_t,
        options: i32,
        status: i32,
    },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Read { .. } => OpKind::Read,
            Operation::Write { .. } => OpKind::Write,
            Operation::Recv { .. } => OpKind::Recv,
            Operation::Send { .. } => OpKind::Send,
            Operation::RecvFrom { .. } => OpKind::RecvFrom,
            Operation::SendTo { .. } => OpKind::SendTo,
            Operation::Accept { .. } => OpKind::Accept,
            Operation::Connect { .. } => OpKind::Connect,
            Operation::WaitForProcess { .. } => OpKind::WaitForProcess,
        }
    }
}

/// One blocking call in flight through the [`WorkerPool`](crate::WorkerPool).
///
/// The request is moved into the pool on submit and handed back, with
/// `rval` and `error` filled in, through its completion target. Exactly one
/// worker executes it and exactly one completion is posted.
#[derive(Debug)]
pub struct AsyncRequest {
    op: Operation,
    rval: isize,
    error: i32,
    /// Rejected by the pool without running; `error` is `ENOSYS`.
    unsupported: bool,
    done: CompletionTarget,
}

impl AsyncRequest {
    /// Create a request for an arbitrary operation.
    pub fn new(op: Operation, done: CompletionTarget) -> Self {
        Self {
            op,
            rval: 0,
            error: 0,
            unsupported: false,
            done,
        }
    }

    /// Read up to `len` bytes from a file descriptor.
    pub fn read(fd: RawFd, len: usize, done: CompletionTarget) -> Self {
        Self::new(
            Operation::Read {
                fd,
                buf: BytesMut::zeroed(len),
            },
            done,
        )
    }

    /// Write `data` to a file descriptor.
    pub fn write(fd: RawFd, data: impl Into<Bytes>, done: CompletionTarget) -> Self {
        Self::new(
            Operation::Write {
                fd,
                data: data.into(),
            },
            done,
        )
    }

    /// Receive up to `len` bytes from a connected socket.
    pub fn recv(sock: RawFd, len: usize, flags: i32, done: CompletionTarget) -> Self {
        Self::new(
            Operation::Recv {
                sock,
                buf: BytesMut::zeroed(len),
                flags,
            },
            done,
        )
    }

    /// Send `data` on a connected socket.
    pub fn send(sock: RawFd, data: impl Into<Bytes>, flags: i32, done: CompletionTarget) -> Self {
        Self::new(
            Operation::Send {
                sock,
                data: data.into(),
                flags,
            },
            done,
        )
    }

    /// Receive a datagram of up to `len` bytes and capture the sender address.
    pub fn recv_from(sock: RawFd, len: usize, flags: i32, done: CompletionTarget) -> Self {
        Self::new(
            Operation::RecvFrom {
                sock,
                buf: BytesMut::zeroed(len),
                flags,
                addr: SockAddr::empty(),
            },
            done,
        )
    }

    /// Send a datagram to `addr`.
    pub fn send_to(
        sock: RawFd,
        data: impl Into<Bytes>,
        flags: i32,
        addr: SockAddr,
        done: CompletionTarget,
    ) -> Self {
        Self::new(
            Operation::SendTo {
                sock,
                data: data.into(),
                flags,
                addr,
            },
            done,
        )
    }

    /// Accept a connection; the peer address is captured when `want_addr` is set.
    pub fn accept(sock: RawFd, want_addr: bool, done: CompletionTarget) -> Self {
        Self::new(
            Operation::Accept {
                sock,
                addr: want_addr.then(SockAddr::empty),
            },
            done,
        )
    }

    /// Connect a socket to `addr`.
    pub fn connect(sock: RawFd, addr: SockAddr, done: CompletionTarget) -> Self {
        Self::new(Operation::Connect { sock, addr }, done)
    }

    /// Wait for a state change of a child process.
    pub fn wait_for_process(pid: libc::pid_t, options: i32, done: CompletionTarget) -> Self {
        Self::new(
            Operation::WaitForProcess {
                pid,
                options,
                status: 0,
            },
            done,
        )
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    /// Token of the completion target this request reports to.
    pub fn token(&self) -> Token {
        self.done.token()
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Raw return value of the call (`-1` on failure).
    pub fn rval(&self) -> isize {
        self.rval
    }

    /// Platform error code; zero on success.
    pub fn error(&self) -> i32 {
        self.error
    }

    /// The outcome as a `Result`.
    pub fn result(&self) -> Result<isize> {
        if self.unsupported {
            Err(AsyncReqError::NotImplemented)
        } else if self.error == 0 {
            Ok(self.rval)
        } else {
            Err(AsyncReqError::from_errno(self.error))
        }
    }

    /// The executor does not support this kind, so no call was made.
    pub fn is_unsupported(&self) -> bool {
        self.unsupported
    }

    /// Bytes filled in by a successful `Read`, `Recv` or `RecvFrom`.
    ///
    /// Empty for any other kind or on failure.
    pub fn received(&self) -> &[u8] {
        let filled = if self.error == 0 && self.rval > 0 {
            self.rval as usize
        } else {
            0
        };
        match &self.op {
            Operation::Read { buf, .. }
            | Operation::Recv { buf, .. }
            | Operation::RecvFrom { buf, .. } => &buf[..filled.min(buf.len())],
            _ => &[],
        }
    }

    /// Address captured by `Accept` or `RecvFrom`, if any.
    pub fn peer_addr(&self) -> Option<SockAddr> {
        if self.error != 0 {
            return None;
        }
        match &self.op {
            Operation::Accept { addr, .. } => *addr,
            Operation::RecvFrom { addr, .. } => Some(*addr),
            _ => None,
        }
    }

    /// Exit status captured by `WaitForProcess`.
    pub fn wait_status(&self) -> Option<i32> {
        match &self.op {
            Operation::WaitForProcess { status, .. } if self.error == 0 => Some(*status),
            _ => None,
        }
    }

    /// Give the operation (and the buffers it owns) back to the caller.
    pub fn into_operation(self) -> Operation {
        self.op
    }

    pub(crate) fn operation_mut(&mut self) -> &mut Operation {
        &mut self.op
    }

    /// Record the outcome of the executed call. Called once, by the worker.
    pub(crate) fn set_outcome(&mut self, outcome: std::io::Result<isize>) {
        match outcome {
            Ok(rval) => {
                self.rval = rval;
                self.error = 0;
            }
            Err(err) => {
                self.rval = -1;
                self.error = err.raw_os_error().unwrap_or(libc::EIO);
                debug_assert!(self.error != 0);
            }
        }
    }

    pub(crate) fn fail(&mut self, errno: i32) {
        debug_assert!(errno != 0);
        self.rval = -1;
        self.error = errno;
    }

    pub(crate) fn reject_unsupported(&mut self) {
        self.fail(libc::ENOSYS);
        self.unsupported = true;
    }

    /// Post this request to its completion target.
    pub(crate) fn complete(self) {
        let target = self.done.clone();
        target.post(self);
    }
}
