use std::io;

use crate::request::{OpKind, Operation};

/// Performs the blocking call described by an [`Operation`].
///
/// Runs on a worker thread. The pool consults [`supports`] first; a kind
/// that is not supported fails with `ENOSYS` and `execute` is never called.
///
/// [`supports`]: Executor::supports
pub trait Executor: Send + Sync + 'static {
    /// Whether this executor can perform `kind` on the current platform.
    fn supports(&self, kind: OpKind) -> bool {
        let _ = kind;
        true
    }

    /// Perform the call, filling any output buffers in place.
    fn execute(&self, op: &mut Operation) -> io::Result<isize>;
}

/// Executes operations with the platform's POSIX calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(&self, op: &mut Operation) -> io::Result<isize> {
        // SAFETY (all arms): every pointer passed below points into a buffer or
        // address owned by `op`, which stays borrowed for the whole call, and
        // every length matches the buffer it describes.
        let rval = match op {
            Operation::Read { fd, buf } => unsafe {
                libc::read(*fd, buf.as_mut_ptr().cast(), buf.len())
            },
            Operation::Write { fd, data } => unsafe {
                libc::write(*fd, data.as_ptr().cast(), data.len())
            },
            Operation::Recv { sock, buf, flags } => unsafe {
                libc::recv(*sock, buf.as_mut_ptr().cast(), buf.len(), *flags)
            },
            Operation::Send { sock, data, flags } => unsafe {
                libc::send(*sock, data.as_ptr().cast(), data.len(), *flags)
            },
            Operation::RecvFrom {
                sock,
                buf,
                flags,
                addr,
            } => {
                let (addr_ptr, addr_len) = addr.as_out_parts();
                unsafe {
                    libc::recvfrom(
                        *sock,
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        *flags,
                        addr_ptr,
                        addr_len,
                    )
                }
            }
            Operation::SendTo {
                sock,
                data,
                flags,
                addr,
            } => unsafe {
                libc::sendto(
                    *sock,
                    data.as_ptr().cast(),
                    data.len(),
                    *flags,
                    addr.as_ptr(),
                    addr.len(),
                )
            },
            Operation::Accept { sock, addr } => {
                let fd = match addr {
                    Some(addr) => {
                        let (addr_ptr, addr_len) = addr.as_out_parts();
                        unsafe { libc::accept(*sock, addr_ptr, addr_len) }
                    }
                    None => unsafe {
                        libc::accept(*sock, std::ptr::null_mut(), std::ptr::null_mut())
                    },
                };
                fd as isize
            }
            Operation::Connect { sock, addr } => {
                (unsafe { libc::connect(*sock, addr.as_ptr(), addr.len()) }) as isize
            }
            Operation::WaitForProcess {
                pid,
                options,
                status,
            } => (unsafe { libc::waitpid(*pid, status, *options) }) as isize,
        };

        if rval == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rval)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use bytes::{Bytes, BytesMut};

    use super::*;

    #[test]
    fn write_then_read_over_socket_pair() {
        let (left, right) = UnixStream::pair().unwrap();

        let mut write = Operation::Write {
            fd: left.as_raw_fd(),
            data: Bytes::from_static(b"offload"),
        };
        assert_eq!(SystemExecutor.execute(&mut write).unwrap(), 7);

        let mut read = Operation::Read {
            fd: right.as_raw_fd(),
            buf: BytesMut::zeroed(16),
        };
        let n = SystemExecutor.execute(&mut read).unwrap();
        assert_eq!(n, 7);
        match read {
            Operation::Read { buf, .. } => assert_eq!(&buf[..7], b"offload"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn send_and_recv_use_socket_calls() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(b"ping").unwrap();

        let mut recv = Operation::Recv {
            sock: right.as_raw_fd(),
            buf: BytesMut::zeroed(4),
            flags: 0,
        };
        assert_eq!(SystemExecutor.execute(&mut recv).unwrap(), 4);

        let mut send = Operation::Send {
            sock: right.as_raw_fd(),
            data: Bytes::from_static(b"pong"),
            flags: 0,
        };
        assert_eq!(SystemExecutor.execute(&mut send).unwrap(), 4);

        let mut reply = [0u8; 4];
        left.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
    }

    #[test]
    fn failed_call_reports_os_error() {
        let mut read = Operation::Read {
            fd: -1,
            buf: BytesMut::zeroed(1),
        };
        let err = SystemExecutor.execute(&mut read).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn connect_and_accept_over_loopback() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();

        // SAFETY: plain socket creation; the descriptor is closed below.
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(sock >= 0);

        let mut connect = Operation::Connect {
            sock,
            addr: crate::SockAddr::from_std(&target),
        };
        assert_eq!(SystemExecutor.execute(&mut connect).unwrap(), 0);

        let mut accept = Operation::Accept {
            sock: listener.as_raw_fd(),
            addr: Some(crate::SockAddr::empty()),
        };
        let fd = SystemExecutor.execute(&mut accept).unwrap();
        assert!(fd >= 0);
        if let Operation::Accept { addr: Some(addr), .. } = &accept {
            assert!(addr.to_std().unwrap().ip().is_loopback());
        }

        // SAFETY: both descriptors were created by this test and are not used afterwards.
        unsafe {
            libc::close(fd as libc::c_int);
            libc::close(sock);
        }
    }
}
