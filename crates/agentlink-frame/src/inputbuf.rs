//! Circular input buffer with an in-place escape decoder.
//!
//! The transport writes raw bytes at the write cursor and reports them with
//! [`InputBuf::read_done`]. Each refill is pre-scanned to count complete
//! messages, so the consumer is only woken when it has something to decode.
//! The consumer then calls [`InputBuf::start_message`] followed by
//! [`InputBuf::read`] / [`InputBuf::peek`] until it sees [`Symbol::Eom`]
//! or [`Symbol::Eos`].
//!
//! Decoding happens directly in the storage: a run of plain bytes is
//! scanned once and then consumed without re-checking for escapes.
//!
//! A message that does not fit into the buffer is started anyway once the
//! buffer fills up ("long message"). The consumer drains it while the
//! transport keeps refilling behind it.

use bytes::{BufMut, BytesMut};
use tracing::{trace, warn};

use crate::escape::{Symbol, ESC, ESC_EOM, ESC_EOS, ESC_LITERAL};

/// Default buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 0x4000;

/// Smallest usable capacity; an escape sequence needs two bytes.
const MIN_CAPACITY: usize = 2;

/// Input buffer configuration.
#[derive(Debug, Clone)]
pub struct InputBufConfig {
    /// Size of the ring buffer in bytes. Default: 16 KiB.
    pub capacity: usize,
}

impl Default for InputBufConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Callbacks an [`InputBuf`] needs from its transport.
pub trait InputBufHost {
    /// Start receiving up to `len` bytes into the buffer at offset `pos`.
    ///
    /// Fire-and-forget: the transport reports the outcome later through
    /// [`InputBuf::read_done`] (or [`InputBuf::fill`]). May be called again
    /// while a read is outstanding; the transport keeps at most one in
    /// flight.
    fn post_read(&mut self, pos: usize, len: usize);

    /// Suspend until the outstanding read completes and copy its bytes into
    /// `dst`, which starts at the offset of the posted read.
    ///
    /// Returns the number of bytes written; zero means end of stream.
    fn wait_read(&mut self, dst: &mut [u8]) -> usize;

    /// A message (or end of stream) became available while the buffer was idle.
    fn trigger_message(&mut self);
}

/// Consumer-facing state of an [`InputBuf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// No pending notification and no decode in progress.
    Idle,
    /// `trigger_message` fired; the consumer has not called `start_message` yet.
    Triggered,
    /// The consumer is decoding a message.
    Active,
}

/// Outcome of [`InputBuf::start_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStart {
    /// Nothing to decode.
    None,
    /// The stream has ended and all messages have been consumed.
    EndOfStream,
    /// A message is ready; decoding may begin.
    Message,
}

/// Decode cursor: `cur..end` is a run of already scanned plain bytes.
#[derive(Debug, Clone, Copy, Default)]
struct InputStream {
    cur: usize,
    end: usize,
}

/// Fixed-capacity circular input buffer for one connection.
pub struct InputBuf<H> {
    buf: Box<[u8]>,
    /// Write cursor: where the next refill lands.
    inp: usize,
    /// Everything before this (circularly) has been handed to the consumer.
    out: usize,
    full: bool,
    eof: bool,
    /// The consumer has already been given `Symbol::Eos`.
    eos_delivered: bool,
    /// The last refill ended inside an escape sequence.
    esc: bool,
    message_count: usize,
    long_msg: bool,
    handling: HandleState,
    stream: InputStream,
    host: H,
}

impl<H: InputBufHost> InputBuf<H> {
    /// Create an input buffer with the default capacity.
    pub fn new(host: H) -> Self {
        Self::with_config(host, InputBufConfig::default())
    }

    /// Create an input buffer with explicit configuration.
    pub fn with_config(host: H, config: InputBufConfig) -> Self {
        let capacity = config.capacity.max(MIN_CAPACITY);
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            inp: 0,
            out: 0,
            full: false,
            eof: false,
            eos_delivered: false,
            esc: false,
            message_count: 0,
            long_msg: false,
            handling: HandleState::Idle,
            stream: InputStream::default(),
            host,
        }
    }

    /// Ask the transport for more data, if there is room and the stream is open.
    ///
    /// Never asks for more than fits before the physical end of the buffer.
    pub fn trigger_read(&mut self) {
        if self.full || self.eof {
            return;
        }
        let len = self.free_run();
        self.host.post_read(self.inp, len);
    }

    /// The slice an outstanding read should be written into.
    ///
    /// Empty while the buffer is full or the stream has ended.
    pub fn read_region_mut(&mut self) -> &mut [u8] {
        let len = if self.full || self.eof {
            0
        } else {
            self.free_run()
        };
        &mut self.buf[self.inp..self.inp + len]
    }

    /// Refill completion: `len` new bytes have been written at the write cursor.
    ///
    /// Zero signals end of stream, which is counted as a pseudo-message so
    /// the consumer learns about it even with a partial message buffered.
    pub fn read_done(&mut self, len: usize) {
        if len == 0 {
            self.record_eof();
            return;
        }
        debug_assert!(!self.eof, "refill after end of stream");
        debug_assert!(len <= self.free_run(), "refill overruns the read region");

        let cap = self.buf.len();
        let mut pos = self.inp;
        let mut esc = self.esc;
        for _ in 0..len {
            if self.eof {
                // Bytes after an end-of-stream marker are never decoded.
                break;
            }
            let ch = self.buf[pos];
            pos += 1;
            if pos == cap {
                pos = 0;
            }
            if esc {
                esc = false;
                match ch {
                    ESC_LITERAL => {}
                    ESC_EOM => {
                        if self.long_msg {
                            debug_assert_eq!(self.message_count, 1);
                            self.long_msg = false;
                        } else {
                            self.new_message();
                        }
                    }
                    ESC_EOS => self.record_eof(),
                    other => {
                        warn!(code = other, "protocol: invalid escape sequence");
                        self.record_eof();
                    }
                }
            } else if ch == ESC {
                esc = true;
            }
        }
        self.esc = esc;
        self.inp = (self.inp + len) % cap;
        trace!(
            len,
            inp = self.inp,
            messages = self.message_count,
            "input buffer refilled"
        );

        if self.inp == self.out {
            self.full = true;
            if self.message_count == 0 {
                // Full with no complete message: hand it out as a long message.
                self.long_msg = true;
                self.new_message();
            }
        } else {
            self.trigger_read();
        }
    }

    /// Copy `data` into the read region and complete the refill.
    ///
    /// Returns the number of bytes accepted, which is less than `data.len()`
    /// when the region is smaller. Nothing is accepted while the buffer is
    /// full. An empty `data` signals end of stream.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            self.read_done(0);
            return 0;
        }
        let region = self.read_region_mut();
        let n = data.len().min(region.len());
        if n == 0 {
            return 0;
        }
        region[..n].copy_from_slice(&data[..n]);
        self.read_done(n);
        n
    }

    /// Block on the transport for the next refill and apply it.
    ///
    /// Returns `false` without waiting when the buffer is full or the stream
    /// has ended.
    pub fn wait_refill(&mut self) -> bool {
        if self.full || self.eof {
            return false;
        }
        self.trigger_read();
        let start = self.inp;
        let len = self.free_run();
        let n = self.host.wait_read(&mut self.buf[start..start + len]);
        self.read_done(n.min(len));
        true
    }

    /// Begin decoding the next message.
    ///
    /// Called after `trigger_message`. A stream that has ended reports
    /// [`MessageStart::EndOfStream`] once every buffered message has been
    /// decoded, and keeps reporting it afterwards.
    pub fn start_message(&mut self) -> MessageStart {
        debug_assert!(
            self.handling != HandleState::Active,
            "start_message while a message is being decoded"
        );
        if self.message_count == 0 {
            self.handling = HandleState::Idle;
            return MessageStart::None;
        }
        if self.eof && (self.eos_delivered || !self.has_pending_data()) {
            self.handling = HandleState::Idle;
            return MessageStart::EndOfStream;
        }
        self.handling = HandleState::Active;
        MessageStart::Message
    }

    /// Consume the next symbol of the current message.
    pub fn read(&mut self) -> Symbol {
        if self.stream.cur < self.stream.end {
            let b = self.buf[self.stream.cur];
            self.stream.cur += 1;
            return Symbol::Byte(b);
        }
        self.get_more(false)
    }

    /// Return the next symbol of the current message without consuming it.
    pub fn peek(&mut self) -> Symbol {
        if self.stream.cur < self.stream.end {
            return Symbol::Byte(self.buf[self.stream.cur]);
        }
        self.get_more(true)
    }

    /// Decode the rest of the current message into `dst`.
    ///
    /// Returns the terminating symbol, [`Symbol::Eom`] or [`Symbol::Eos`].
    pub fn read_to_boundary(&mut self, dst: &mut BytesMut) -> Symbol {
        loop {
            if self.stream.cur < self.stream.end {
                dst.put_slice(&self.buf[self.stream.cur..self.stream.end]);
                self.stream.cur = self.stream.end;
            }
            match self.get_more(false) {
                Symbol::Byte(b) => dst.put_u8(b),
                boundary => return boundary,
            }
        }
    }

    /// Slow path of [`read`](Self::read) and [`peek`](Self::peek).
    ///
    /// Handles wraparound, escape sequences and waiting for more data.
    pub fn get_more(&mut self, peek: bool) -> Symbol {
        debug_assert!(self.message_count > 0, "decode without a message");
        debug_assert_eq!(self.handling, HandleState::Active, "decode outside a message");

        let cap = self.buf.len();
        let mut pos = self.stream.cur;
        let mut wrapped = false;
        if pos == cap {
            pos = 0;
            self.stream = InputStream { cur: 0, end: 0 };
            wrapped = true;
        }
        if wrapped || pos != self.out {
            // The consumer drained bytes since the last call.
            self.out = pos;
            self.full = false;
            self.trigger_read();
        }

        let mut esc = false;
        loop {
            if pos == self.inp && !self.full {
                debug_assert!(self.long_msg || self.eof);
                if self.eof {
                    if !peek {
                        self.finish_eos();
                    }
                    return Symbol::Eos;
                }
                self.wait_refill();
                continue;
            }

            let ch = self.buf[pos];
            if esc {
                let symbol = match ch {
                    ESC_LITERAL => Symbol::Byte(ESC),
                    ESC_EOM => Symbol::Eom,
                    ESC_EOS => Symbol::Eos,
                    other => {
                        warn!(code = other, "protocol: invalid escape sequence");
                        self.record_eof();
                        Symbol::Eos
                    }
                };
                if peek {
                    return symbol;
                }
                pos += 1;
                self.stream = InputStream { cur: pos, end: pos };
                match symbol {
                    Symbol::Eom => self.finish_message(),
                    Symbol::Eos => self.finish_eos(),
                    Symbol::Byte(_) => {}
                }
                return symbol;
            }

            if ch != ESC {
                let max = if pos < self.inp { self.inp } else { cap };
                let mut end = pos + 1;
                while end != max && self.buf[end] != ESC {
                    end += 1;
                }
                self.stream = InputStream {
                    cur: if peek { pos } else { pos + 1 },
                    end,
                };
                return Symbol::Byte(ch);
            }

            pos += 1;
            if pos == cap {
                pos = 0;
            }
            esc = true;
        }
    }

    /// Discard everything buffered.
    pub fn flush(&mut self) {
        self.stream = InputStream {
            cur: self.inp,
            end: self.inp,
        };
        self.out = self.inp;
        self.full = false;
        self.esc = false;
        self.long_msg = false;
        self.message_count = 0;
        self.handling = HandleState::Idle;
    }

    pub fn state(&self) -> HandleState {
        self.handling
    }

    /// Number of complete messages buffered (end of stream counts as one).
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    /// True while the current message is larger than the buffer.
    pub fn is_long_message(&self) -> bool {
        self.long_msg
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// True once end of stream has been recorded.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    fn free_run(&self) -> usize {
        if self.out <= self.inp {
            self.buf.len() - self.inp
        } else {
            self.out - self.inp
        }
    }

    fn has_pending_data(&self) -> bool {
        if self.full {
            return true;
        }
        let cur = if self.stream.cur == self.buf.len() {
            0
        } else {
            self.stream.cur
        };
        cur != self.inp
    }

    fn new_message(&mut self) {
        self.message_count += 1;
        self.trigger();
    }

    fn record_eof(&mut self) {
        if self.eof {
            return;
        }
        self.eof = true;
        self.new_message();
    }

    fn trigger(&mut self) {
        if self.handling == HandleState::Idle {
            self.handling = HandleState::Triggered;
            self.host.trigger_message();
        }
    }

    fn finish_message(&mut self) {
        self.message_count -= 1;
        self.handling = HandleState::Idle;
        self.release_consumed();
        if self.message_count > 0 {
            self.trigger();
        }
    }

    fn finish_eos(&mut self) {
        self.eos_delivered = true;
        self.handling = HandleState::Idle;
        self.release_consumed();
    }

    /// Hand the bytes of a finished message back to the transport.
    ///
    /// At least the terminator lies past `out`, so the buffer cannot be full.
    fn release_consumed(&mut self) {
        self.out = if self.stream.cur == self.buf.len() {
            0
        } else {
            self.stream.cur
        };
        self.full = false;
        self.trigger_read();
    }
}

impl<H> std::fmt::Debug for InputBuf<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBuf")
            .field("capacity", &self.buf.len())
            .field("inp", &self.inp)
            .field("out", &self.out)
            .field("full", &self.full)
            .field("eof", &self.eof)
            .field("message_count", &self.message_count)
            .field("long_msg", &self.long_msg)
            .field("handling", &self.handling)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::escape::{encode_eos, encode_message};

    #[derive(Debug, Default)]
    struct ScriptHost {
        posted: Vec<(usize, usize)>,
        triggers: usize,
        waits: usize,
        chunks: VecDeque<Vec<u8>>,
    }

    impl InputBufHost for ScriptHost {
        fn post_read(&mut self, pos: usize, len: usize) {
            self.posted.push((pos, len));
        }

        fn wait_read(&mut self, dst: &mut [u8]) -> usize {
            self.waits += 1;
            match self.chunks.pop_front() {
                Some(chunk) => {
                    assert!(chunk.len() <= dst.len(), "scripted chunk does not fit");
                    dst[..chunk.len()].copy_from_slice(&chunk);
                    chunk.len()
                }
                None => 0,
            }
        }

        fn trigger_message(&mut self) {
            self.triggers += 1;
        }
    }

    fn ibuf(capacity: usize) -> InputBuf<ScriptHost> {
        InputBuf::with_config(ScriptHost::default(), InputBufConfig { capacity })
    }

    fn take_message(ibuf: &mut InputBuf<ScriptHost>) -> (Vec<u8>, Symbol) {
        assert_eq!(ibuf.start_message(), MessageStart::Message);
        let mut payload = BytesMut::new();
        let end = ibuf.read_to_boundary(&mut payload);
        (payload.to_vec(), end)
    }

    #[test]
    fn counts_one_message_per_eom_marker() {
        let mut ibuf = ibuf(64);
        ibuf.fill(b"a\x03\x01bb\x03\x01ccc");

        assert_eq!(ibuf.message_count(), 2);
        assert_eq!(ibuf.state(), HandleState::Triggered);
        assert_eq!(ibuf.host().triggers, 1);
    }

    #[test]
    fn escaped_payload_round_trips() {
        let payload = [b'x', ESC, 0, 1, ESC, ESC, 2, b'y'];
        let mut wire = BytesMut::new();
        encode_message(&payload, &mut wire);

        let mut ibuf = ibuf(64);
        ibuf.fill(&wire);

        let (decoded, end) = take_message(&mut ibuf);
        assert_eq!(decoded, payload);
        assert_eq!(end, Symbol::Eom);
        assert_eq!(ibuf.message_count(), 0);
        assert_eq!(ibuf.state(), HandleState::Idle);
    }

    #[test]
    fn symbols_decode_one_at_a_time() {
        let mut ibuf = ibuf(64);
        ibuf.fill(&[b'a', ESC, ESC_LITERAL, b'b', ESC, ESC_EOM]);

        assert_eq!(ibuf.start_message(), MessageStart::Message);
        assert_eq!(ibuf.read(), Symbol::Byte(b'a'));
        assert_eq!(ibuf.read(), Symbol::Byte(ESC));
        assert_eq!(ibuf.read(), Symbol::Byte(b'b'));
        assert_eq!(ibuf.read(), Symbol::Eom);
    }

    #[test]
    fn peek_is_idempotent() {
        let mut ibuf = ibuf(64);
        ibuf.fill(&[b'q', ESC, ESC_LITERAL, ESC, ESC_EOM]);
        assert_eq!(ibuf.start_message(), MessageStart::Message);

        assert_eq!(ibuf.peek(), Symbol::Byte(b'q'));
        assert_eq!(ibuf.peek(), Symbol::Byte(b'q'));
        assert_eq!(ibuf.read(), Symbol::Byte(b'q'));

        assert_eq!(ibuf.peek(), Symbol::Byte(ESC));
        assert_eq!(ibuf.peek(), Symbol::Byte(ESC));
        assert_eq!(ibuf.read(), Symbol::Byte(ESC));

        assert_eq!(ibuf.peek(), Symbol::Eom);
        assert_eq!(ibuf.peek(), Symbol::Eom);
        assert_eq!(ibuf.message_count(), 1);
        assert_eq!(ibuf.read(), Symbol::Eom);
        assert_eq!(ibuf.message_count(), 0);
    }

    #[test]
    fn queued_messages_retrigger_after_each_eom() {
        let mut ibuf = ibuf(64);
        ibuf.fill(b"one\x03\x01two\x03\x01");
        assert_eq!(ibuf.host().triggers, 1);

        assert_eq!(take_message(&mut ibuf), (b"one".to_vec(), Symbol::Eom));
        assert_eq!(ibuf.state(), HandleState::Triggered);
        assert_eq!(ibuf.host().triggers, 2);

        assert_eq!(take_message(&mut ibuf), (b"two".to_vec(), Symbol::Eom));
        assert_eq!(ibuf.state(), HandleState::Idle);
        assert_eq!(ibuf.start_message(), MessageStart::None);
    }

    #[test]
    fn escape_split_across_refills() {
        let mut ibuf = ibuf(64);
        ibuf.fill(&[b'a', b'b', ESC]);
        assert_eq!(ibuf.message_count(), 0);
        assert_eq!(ibuf.host().triggers, 0);

        ibuf.fill(&[ESC_EOM]);
        assert_eq!(ibuf.message_count(), 1);
        assert_eq!(take_message(&mut ibuf), (b"ab".to_vec(), Symbol::Eom));
    }

    #[test]
    fn full_buffer_without_terminator_starts_long_message() {
        let mut ibuf = ibuf(8);
        assert_eq!(ibuf.fill(b"abcdefgh"), 8);

        assert!(ibuf.is_full());
        assert!(ibuf.is_long_message());
        assert_eq!(ibuf.message_count(), 1);
        assert_eq!(ibuf.host().triggers, 1);

        // The terminator arrives only after the consumer has drained the buffer.
        ibuf.host_mut().chunks.push_back(vec![ESC, ESC_EOM]);

        assert_eq!(ibuf.start_message(), MessageStart::Message);
        for expected in b"abcdefgh" {
            assert_eq!(ibuf.read(), Symbol::Byte(*expected));
        }
        assert_eq!(ibuf.host().waits, 0);

        assert_eq!(ibuf.read(), Symbol::Eom);
        assert_eq!(ibuf.host().waits, 1);
        assert!(!ibuf.is_long_message());
        assert_eq!(ibuf.message_count(), 0);
    }

    #[test]
    fn long_message_streams_through_multiple_refills() {
        let mut ibuf = ibuf(4);
        ibuf.fill(b"abcd");
        ibuf.host_mut().chunks.push_back(b"efgh".to_vec());
        ibuf.host_mut().chunks.push_back(vec![b'i', ESC, ESC_EOM]);

        let (payload, end) = take_message(&mut ibuf);
        assert_eq!(payload, b"abcdefghi");
        assert_eq!(end, Symbol::Eom);
        assert_eq!(ibuf.host().triggers, 1);
    }

    #[test]
    fn eos_mid_message_yields_eos_symbol() {
        let mut ibuf = ibuf(64);
        ibuf.fill(b"abc");
        assert_eq!(ibuf.host().triggers, 0);

        ibuf.read_done(0);
        assert!(ibuf.is_eof());
        assert_eq!(ibuf.host().triggers, 1);

        assert_eq!(take_message(&mut ibuf), (b"abc".to_vec(), Symbol::Eos));
        assert_eq!(ibuf.start_message(), MessageStart::EndOfStream);
        assert_eq!(ibuf.start_message(), MessageStart::EndOfStream);
    }

    #[test]
    fn eos_after_complete_messages_delivers_them_first() {
        let mut wire = BytesMut::new();
        encode_message(b"last", &mut wire);
        encode_eos(&mut wire);

        let mut ibuf = ibuf(64);
        ibuf.fill(&wire);
        assert_eq!(ibuf.message_count(), 2);

        assert_eq!(take_message(&mut ibuf), (b"last".to_vec(), Symbol::Eom));
        assert_eq!(take_message(&mut ibuf), (Vec::new(), Symbol::Eos));
        assert_eq!(ibuf.start_message(), MessageStart::EndOfStream);
    }

    #[test]
    fn bare_eos_reports_end_of_stream_without_decoding() {
        let mut ibuf = ibuf(64);
        ibuf.read_done(0);

        assert_eq!(ibuf.state(), HandleState::Triggered);
        assert_eq!(ibuf.start_message(), MessageStart::EndOfStream);
        assert_eq!(ibuf.state(), HandleState::Idle);
    }

    #[test]
    fn message_count_matches_markers_plus_implicit_eos() {
        let mut ibuf = ibuf(64);
        ibuf.fill(b"a\x03\x01b\x03\x01partial");
        ibuf.read_done(0);

        let mut messages = 0;
        loop {
            match ibuf.start_message() {
                MessageStart::Message => {
                    let mut sink = BytesMut::new();
                    ibuf.read_to_boundary(&mut sink);
                    messages += 1;
                }
                MessageStart::EndOfStream => break,
                MessageStart::None => panic!("stream ended without end-of-stream"),
            }
        }
        assert_eq!(messages, 3);
    }

    #[test]
    fn invalid_escape_forces_end_of_stream() {
        let mut ibuf = ibuf(64);
        ibuf.fill(&[b'x', ESC, 7, b'y', ESC, ESC_EOM]);

        assert!(ibuf.is_eof());
        assert_eq!(ibuf.message_count(), 1);
        assert_eq!(take_message(&mut ibuf), (b"x".to_vec(), Symbol::Eos));
        assert_eq!(ibuf.start_message(), MessageStart::EndOfStream);
    }

    #[test]
    fn read_ahead_requests_remaining_contiguous_space() {
        let mut ibuf = ibuf(16);
        ibuf.trigger_read();
        assert_eq!(ibuf.host().posted, vec![(0, 16)]);

        ibuf.fill(b"abcd");
        assert_eq!(ibuf.host().posted.last(), Some(&(4, 12)));
    }

    #[test]
    fn full_buffer_posts_no_read_until_drained() {
        let mut ibuf = ibuf(8);
        ibuf.fill(b"abcdef\x03\x01");
        assert!(ibuf.is_full());
        assert!(!ibuf.is_long_message());
        let posted = ibuf.host().posted.len();

        ibuf.trigger_read();
        assert_eq!(ibuf.host().posted.len(), posted);
        assert!(ibuf.read_region_mut().is_empty());
        assert_eq!(ibuf.fill(b"more"), 0);
        assert!(!ibuf.is_eof());

        let (payload, _) = take_message(&mut ibuf);
        assert_eq!(payload, b"abcdef");
        assert!(!ibuf.is_full());
        assert_eq!(ibuf.host().posted.last(), Some(&(0, 8)));
    }

    #[test]
    fn data_wraps_around_the_physical_end() {
        let mut ibuf = ibuf(8);
        ibuf.fill(b"abc\x03\x01");
        assert_eq!(take_message(&mut ibuf), (b"abc".to_vec(), Symbol::Eom));

        // Only the tail up to the physical end fits in one refill.
        assert_eq!(ibuf.fill(b"defgh"), 3);
        assert_eq!(ibuf.fill(b"g\x03\x01"), 3);

        assert_eq!(take_message(&mut ibuf), (b"defg".to_vec(), Symbol::Eom));
    }

    #[test]
    fn wrapped_long_message_does_not_reread_stale_bytes() {
        let mut ibuf = ibuf(4);
        ibuf.fill(b"wxyz");
        assert!(ibuf.is_long_message());
        ibuf.host_mut().chunks.push_back(vec![ESC, ESC_EOM]);

        assert_eq!(ibuf.start_message(), MessageStart::Message);
        for _ in 0..4 {
            assert!(matches!(ibuf.read(), Symbol::Byte(_)));
        }
        assert_eq!(ibuf.read(), Symbol::Eom);
    }

    #[test]
    fn flush_discards_buffered_messages() {
        let mut ibuf = ibuf(32);
        ibuf.fill(b"gone\x03\x01");
        ibuf.flush();

        assert_eq!(ibuf.message_count(), 0);
        assert_eq!(ibuf.start_message(), MessageStart::None);

        ibuf.fill(b"kept\x03\x01");
        assert_eq!(take_message(&mut ibuf), (b"kept".to_vec(), Symbol::Eom));
    }

    #[test]
    fn flush_forgets_a_dangling_escape() {
        let mut ibuf = ibuf(32);
        ibuf.fill(&[b'a', b'b', ESC]);
        ibuf.flush();

        ibuf.fill(&[ESC_EOM, b'x', ESC, ESC_EOM]);
        assert_eq!(ibuf.message_count(), 1);
        assert_eq!(
            take_message(&mut ibuf),
            (vec![ESC_EOM, b'x'], Symbol::Eom)
        );
        assert_eq!(ibuf.message_count(), 0);
        assert_eq!(ibuf.start_message(), MessageStart::None);
    }
}
