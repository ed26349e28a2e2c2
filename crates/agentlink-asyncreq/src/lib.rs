//! Blocking syscall offload for the agent transport layer.
//!
//! Blocking POSIX calls (read, write, send, recv, accept, connect, waitpid)
//! are described as [`AsyncRequest`] records and submitted to a
//! [`WorkerPool`]. An idle worker thread executes the call, or a new one is
//! spawned when none is idle. The outcome travels back to the submitter as a
//! message on its [`EventQueue`], so completions are always handled on the
//! thread that owns the queue.
//!
//! The pool only grows: its size is the high-water mark of concurrently
//! in-flight requests.

pub mod addr;
pub mod error;
pub mod events;
pub mod exec;
pub mod pool;
pub mod request;

pub use addr::SockAddr;
pub use error::{AsyncReqError, Result};
pub use events::{CompletionTarget, EventQueue, Token};
pub use exec::{Executor, SystemExecutor};
pub use pool::{PoolConfig, WorkerPool};
pub use request::{AsyncRequest, OpKind, Operation};
