/// Errors that can occur while reading or writing framed messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// An I/O error occurred while reading or writing messages.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before the current message was terminated.
    #[error("connection closed (incomplete message)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
