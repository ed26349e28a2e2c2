use std::io;

/// Errors reported through a completed [`AsyncRequest`](crate::AsyncRequest).
#[derive(Debug, thiserror::Error)]
pub enum AsyncReqError {
    /// The blocking call (or worker creation) failed with a platform error.
    #[error("system error: {0}")]
    Os(#[from] io::Error),

    /// The request kind is not supported by the executor on this platform.
    #[error("operation not implemented")]
    NotImplemented,
}

impl AsyncReqError {
    /// Build an error from a raw platform error code.
    ///
    /// `ENOSYS` from a real call stays an [`AsyncReqError::Os`]; only the
    /// pool reports [`AsyncReqError::NotImplemented`].
    pub fn from_errno(errno: i32) -> Self {
        AsyncReqError::Os(io::Error::from_raw_os_error(errno))
    }

    /// The platform error code carried by this error.
    pub fn errno(&self) -> i32 {
        match self {
            AsyncReqError::Os(err) => err.raw_os_error().unwrap_or(libc::EIO),
            AsyncReqError::NotImplemented => libc::ENOSYS,
        }
    }
}

pub type Result<T> = std::result::Result<T, AsyncReqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enosys_from_a_call_is_a_system_error() {
        let err = AsyncReqError::from_errno(libc::ENOSYS);
        assert!(matches!(err, AsyncReqError::Os(_)));
        assert_eq!(err.errno(), libc::ENOSYS);
    }

    #[test]
    fn not_implemented_carries_enosys() {
        assert_eq!(AsyncReqError::NotImplemented.errno(), libc::ENOSYS);
    }

    #[test]
    fn other_errno_is_preserved() {
        let err = AsyncReqError::from_errno(libc::ECONNRESET);
        assert!(matches!(err, AsyncReqError::Os(_)));
        assert_eq!(err.errno(), libc::ECONNRESET);
    }
}
