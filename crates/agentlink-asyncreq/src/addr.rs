use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// An owned socket address in the platform's `sockaddr_storage` layout.
///
/// Requests that take or return an address (`RecvFrom`, `SendTo`, `Accept`,
/// `Connect`) own one of these, so the worker thread never borrows memory
/// from the submitter.
#[derive(Clone, Copy)]
pub struct SockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl SockAddr {
    /// An empty address buffer sized for any address family.
    pub fn empty() -> Self {
        Self {
            // SAFETY: `sockaddr_storage` is plain old data; all-zero is a valid value.
            storage: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    /// Convert a std socket address.
    pub fn from_std(addr: &SocketAddr) -> Self {
        let mut out = Self::empty();
        match addr {
            SocketAddr::V4(v4) => {
                // SAFETY: `sockaddr_storage` is large and aligned enough for `sockaddr_in`.
                let sin = unsafe {
                    &mut *(&mut out.storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>()
                };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                out.len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            }
            SocketAddr::V6(v6) => {
                // SAFETY: `sockaddr_storage` is large and aligned enough for `sockaddr_in6`.
                let sin6 = unsafe {
                    &mut *(&mut out.storage as *mut libc::sockaddr_storage)
                        .cast::<libc::sockaddr_in6>()
                };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                out.len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            }
        }
        out
    }

    /// Convert back to a std socket address.
    ///
    /// Returns `None` for families other than IPv4/IPv6 (e.g. an `Accept`
    /// on a Unix domain socket).
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self.storage.ss_family as libc::c_int {
            libc::AF_INET => {
                // SAFETY: the family tag says the storage holds a `sockaddr_in`.
                let sin = unsafe {
                    &*(&self.storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
                };
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::V4(SocketAddrV4::new(
                    ip,
                    u16::from_be(sin.sin_port),
                )))
            }
            libc::AF_INET6 => {
                // SAFETY: the family tag says the storage holds a `sockaddr_in6`.
                let sin6 = unsafe {
                    &*(&self.storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>()
                };
                Some(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }

    /// Length of the stored address in bytes.
    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    /// True when no address has been stored yet.
    pub fn is_empty(&self) -> bool {
        self.storage.ss_family == 0
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        (&self.storage as *const libc::sockaddr_storage).cast()
    }

    /// Reset the length to the full capacity and return out-pointers for
    /// calls that fill the address in (`accept`, `recvfrom`).
    pub(crate) fn as_out_parts(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        self.len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        (
            (&mut self.storage as *mut libc::sockaddr_storage).cast(),
            &mut self.len,
        )
    }
}

impl Default for SockAddr {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::from_std(&addr)
    }
}

impl std::fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_std() {
            Some(addr) => write!(f, "SockAddr({addr})"),
            None => f
                .debug_struct("SockAddr")
                .field("family", &self.storage.ss_family)
                .field("len", &self.len)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_conversion_preserves_address() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let raw = SockAddr::from_std(&addr);
        assert_eq!(
            raw.len() as usize,
            std::mem::size_of::<libc::sockaddr_in>()
        );
        assert_eq!(raw.to_std(), Some(addr));
    }

    #[test]
    fn ipv6_conversion_preserves_address() {
        let addr: SocketAddr = "[::1]:1534".parse().unwrap();
        let raw = SockAddr::from(addr);
        assert_eq!(raw.to_std(), Some(addr));
    }

    #[test]
    fn empty_address_has_no_std_form() {
        let raw = SockAddr::empty();
        assert!(raw.is_empty());
        assert_eq!(raw.to_std(), None);
    }
}
