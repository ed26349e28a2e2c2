use bytes::{BufMut, BytesMut};

/// Escape sentinel: the following byte is a control code.
pub const ESC: u8 = 3;

/// Control code after `ESC`: a literal `ESC` byte.
pub const ESC_LITERAL: u8 = 0;

/// Control code after `ESC`: end of message.
pub const ESC_EOM: u8 = 1;

/// Control code after `ESC`: end of stream.
pub const ESC_EOS: u8 = 2;

/// One decoded unit of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// A payload byte.
    Byte(u8),
    /// End of the current message.
    Eom,
    /// End of the stream; no further messages follow.
    Eos,
}

/// Encode a message payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────────────────────────────┬───────────┐
/// │ Payload, each ESC byte as ESC 0x00 │ ESC 0x01  │
/// └────────────────────────────────────┴───────────┘
/// ```
pub fn encode_message(payload: &[u8], dst: &mut BytesMut) {
    let escapes = payload.iter().filter(|&&b| b == ESC).count();
    dst.reserve(payload.len() + escapes + 2);

    let mut rest = payload;
    while let Some(at) = rest.iter().position(|&b| b == ESC) {
        dst.put_slice(&rest[..at]);
        dst.put_u8(ESC);
        dst.put_u8(ESC_LITERAL);
        rest = &rest[at + 1..];
    }
    dst.put_slice(rest);
    dst.put_u8(ESC);
    dst.put_u8(ESC_EOM);
}

/// Append the end-of-stream marker.
pub fn encode_eos(dst: &mut BytesMut) {
    dst.reserve(2);
    dst.put_u8(ESC);
    dst.put_u8(ESC_EOS);
}
