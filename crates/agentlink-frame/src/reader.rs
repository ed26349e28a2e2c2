use std::io::{self, ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::{FrameError, Result};
use crate::escape::Symbol;
use crate::inputbuf::{InputBuf, InputBufConfig, InputBufHost, MessageStart};

/// Feeds an [`InputBuf`] from a blocking `Read` stream.
///
/// Reads happen synchronously inside `wait_read`, so posting a read is a
/// no-op. A read error ends the stream; the error is kept for the reader.
struct ReadHost<T> {
    inner: T,
    error: Option<io::Error>,
}

impl<T: Read> InputBufHost for ReadHost<T> {
    fn post_read(&mut self, _pos: usize, _len: usize) {}

    fn wait_read(&mut self, dst: &mut [u8]) -> usize {
        loop {
            match self.inner.read(dst) {
                Ok(n) => return n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(error = %err, "read failed; treating as end of stream");
                    self.error = Some(err);
                    return 0;
                }
            }
        }
    }

    fn trigger_message(&mut self) {}
}

/// Reads complete messages from any `Read` stream.
///
/// Partial reads and messages larger than the buffer are handled
/// internally; callers always get whole payloads.
pub struct MessageReader<T> {
    ibuf: InputBuf<ReadHost<T>>,
}

impl<T: Read> MessageReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, InputBufConfig::default())
    }

    pub fn with_config(inner: T, config: InputBufConfig) -> Self {
        let host = ReadHost { inner, error: None };
        Self {
            ibuf: InputBuf::with_config(host, config),
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Ok(None)` once the stream has ended cleanly, either by an
    /// end-of-stream marker or by EOF on a message boundary. A stream that
    /// ends inside a message yields `Err(FrameError::ConnectionClosed)`.
    pub fn read_message(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.ibuf.start_message() {
                MessageStart::Message => {
                    let mut payload = BytesMut::new();
                    return match self.ibuf.read_to_boundary(&mut payload) {
                        Symbol::Eom => Ok(Some(payload.freeze())),
                        _ => {
                            self.take_error()?;
                            if payload.is_empty() {
                                Ok(None)
                            } else {
                                Err(FrameError::ConnectionClosed)
                            }
                        }
                    };
                }
                MessageStart::EndOfStream => {
                    self.take_error()?;
                    return Ok(None);
                }
                MessageStart::None => {
                    if !self.ibuf.wait_refill() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.ibuf.host().inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.ibuf.host_mut().inner
    }

    /// Consume the reader and return the inner stream. Buffered input is lost.
    pub fn into_inner(self) -> T {
        self.ibuf.into_host().inner
    }

    /// Capacity of the input buffer.
    pub fn capacity(&self) -> usize {
        self.ibuf.capacity()
    }

    fn take_error(&mut self) -> Result<()> {
        match self.ibuf.host_mut().error.take() {
            Some(err) => Err(FrameError::Io(err)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::escape::{encode_eos, encode_message};
    use crate::writer::MessageWriter;

    fn wire(messages: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for message in messages {
            encode_message(message, &mut buf);
        }
        buf.to_vec()
    }

    #[test]
    fn read_multiple_messages() {
        let mut reader = MessageReader::new(Cursor::new(wire(&[b"one", b"two", b"three"])));

        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), b"one");
        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), b"two");
        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), b"three");
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn message_larger_than_buffer() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let cfg = InputBufConfig { capacity: 64 };
        let mut reader = MessageReader::with_config(Cursor::new(wire(&[&payload])), cfg);

        let message = reader.read_message().unwrap().unwrap();
        assert_eq!(message.as_ref(), payload.as_slice());
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[b"slow", &[3, 3, 3]]),
            pos: 0,
        };
        let mut reader = MessageReader::new(byte_reader);

        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), b"slow");
        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), &[3, 3, 3]);
    }

    #[test]
    fn empty_stream_ends_cleanly() {
        let mut reader = MessageReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(reader.read_message().unwrap().is_none());
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn eos_marker_ends_stream() {
        let mut buf = BytesMut::new();
        encode_message(b"bye", &mut buf);
        encode_eos(&mut buf);
        encode_message(b"ignored", &mut buf);

        let mut reader = MessageReader::new(Cursor::new(buf.to_vec()));
        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), b"bye");
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn connection_closed_mid_message() {
        let mut reader = MessageReader::new(Cursor::new(b"only-part".to_vec()));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn read_error_is_surfaced() {
        let reader = FailingReader {
            bytes: wire(&[b"ok"]),
            served: false,
        };
        let mut framed = MessageReader::new(reader);

        assert_eq!(framed.read_message().unwrap().unwrap().as_ref(), b"ok");
        let err = framed.read_message().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::ConnectionReset));
    }

    #[test]
    fn roundtrip_over_socket_pair() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = MessageWriter::new(left);
        let mut reader = MessageReader::new(right);

        writer.send(b"ping").unwrap();
        writer.send(&[0, 3, 1, 2]).unwrap();
        writer.send_eos().unwrap();

        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), b"ping");
        assert_eq!(reader.read_message().unwrap().unwrap().as_ref(), &[0, 3, 1, 2]);
        assert!(reader.read_message().unwrap().is_none());
    }

    #[test]
    fn concurrent_reader_writer_threads() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = MessageWriter::new(left);
        let mut reader = MessageReader::with_config(right, InputBufConfig { capacity: 32 });

        let reader_thread = std::thread::spawn(move || {
            for expected in 0..64u32 {
                let message = reader.read_message().unwrap().unwrap();
                assert_eq!(message.as_ref(), format!("msg-{expected}").as_bytes());
            }
            assert!(reader.read_message().unwrap().is_none());
        });

        for i in 0..64u32 {
            writer.send(format!("msg-{i}").as_bytes()).unwrap();
        }
        drop(writer);

        reader_thread.join().unwrap();
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader = MessageReader::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(reader.capacity(), crate::DEFAULT_CAPACITY);

        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct FailingReader {
        bytes: Vec<u8>,
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.served {
                return Err(std::io::Error::from(ErrorKind::ConnectionReset));
            }
            self.served = true;
            let n = self.bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[..n]);
            Ok(n)
        }
    }
}
