//! Escape-coded message framing for unbuffered stream transports.
//!
//! Messages travel as raw bytes separated by two-byte control sequences:
//! - `ESC 0`: a literal `ESC` byte inside a payload
//! - `ESC 1`: end of message (EOM)
//! - `ESC 2`: end of stream (EOS)
//!
//! where `ESC` is `0x03`. The receiving side is [`InputBuf`], a fixed
//! capacity ring buffer with an in-place decoder that is refilled by its
//! transport and tells the transport when a message is ready. Messages
//! larger than the buffer are streamed through it.

pub mod error;
pub mod escape;
pub mod inputbuf;
pub mod reader;
pub mod writer;

pub use error::{FrameError, Result};
pub use escape::{encode_eos, encode_message, Symbol, ESC, ESC_EOM, ESC_EOS, ESC_LITERAL};
pub use inputbuf::{
    HandleState, InputBuf, InputBufConfig, InputBufHost, MessageStart, DEFAULT_CAPACITY,
};
pub use reader::MessageReader;
pub use writer::MessageWriter;
