//! Byte-exact `IPV6_PKTINFO` ancillary data: capture on receive, verbatim
//! replay on send. `spec.md` §4.4 requires pseudo-flows to be keyed by the
//! raw ancillary bytes, not a reparsed/reconstructed struct, so this module
//! works with the wire bytes directly rather than exposing a typed
//! `in6_pktinfo`.
//!
//! No crate in the retrieval pack exposes `recvmsg`/`sendmsg` with control
//! messages directly; `vincentliu77-quinn/quinn-udp`'s `Cargo.toml` shows
//! `libc` + `socket2` used together for exactly this kind of cmsg work, so
//! we follow that combination here with our own thin wrapper.

use smallvec::SmallVec;
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Ancillary bytes as received, kept opaque. Flow identity is "these bytes,
/// byte for byte" (`spec.md` §4.4), so we never decode past what's needed
/// to replay them.
pub type PktInfoBytes = SmallVec<[u8; 32]>;

/// Enables `IPV6_RECVPKTINFO` so that every `recv_with_pktinfo` call
/// returns the inbound interface/destination-address ancillary data.
pub fn enable_recvpktinfo(fd: RawFd) -> io::Result<()> {
    let enable: libc::c_int = 1;
    // SAFETY: `fd` is a valid, open IPv6 UDP socket for the duration of this
    // call; `enable` is a valid `c_int` whose address and size match the
    // setsockopt signature mandated by `IPV6_RECVPKTINFO`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            &enable as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One packet received via `recvmsg`, with its source address and raw
/// `IPV6_PKTINFO` ancillary bytes (if the kernel attached one).
pub struct Received {
    pub len: usize,
    pub from: SocketAddr,
    pub pktinfo: Option<PktInfoBytes>,
}

const CMSG_BUF_LEN: usize = 128;

/// Receives one datagram into `buf`, capturing the `IPV6_PKTINFO` cmsg
/// verbatim. Mirrors `proxyudp.c`'s use of `recvmsg` with a
/// `CMSG_PKTINFO_SIZE` control buffer.
pub fn recv_with_pktinfo(fd: RawFd, buf: &mut [u8]) -> io::Result<Received> {
    let mut name: MaybeUninit<libc::sockaddr_in6> = MaybeUninit::zeroed();
    let mut cmsg_buf = [0u8; CMSG_BUF_LEN];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = name.as_mut_ptr() as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `msg` points at stack-local, correctly sized buffers that
    // outlive the call; `fd` is a valid socket.
    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `recvmsg` succeeded and filled `msg_namelen` bytes of `name`.
    let name = unsafe { name.assume_init() };
    let from = sockaddr_in6_to_std(&name);

    let pktinfo = extract_pktinfo(&msg);

    Ok(Received {
        len: n as usize,
        from,
        pktinfo,
    })
}

/// Sends `buf` to `to`, attaching `pktinfo` as the `IPV6_PKTINFO` ancillary
/// data verbatim — the captured bytes from the matching inbound packet,
/// replayed unchanged so the reply appears to originate from the same
/// local address/interface the request arrived on.
pub fn send_with_pktinfo(fd: RawFd, buf: &[u8], to: SocketAddr, pktinfo: &[u8]) -> io::Result<usize> {
    let SocketAddr::V6(to) = to else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pktinfo send requires an IPv6 destination"));
    };
    let name = sockaddr_in6_from_std(&to);

    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(pktinfo.len() as u32) as usize }];

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &name as *const _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    // SAFETY: `msg_control` has room for exactly one cmsg of `pktinfo`'s
    // length, computed via `CMSG_SPACE` immediately above.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        debug_assert!(!cmsg.is_null());
        (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
        (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(pktinfo.len() as u32) as libc::size_t;
        let data = libc::CMSG_DATA(cmsg);
        std::ptr::copy_nonoverlapping(pktinfo.as_ptr(), data, pktinfo.len());
        msg.msg_controllen = libc::CMSG_SPACE(pktinfo.len() as u32) as libc::size_t;
    }

    // SAFETY: `msg` and all buffers it points at are valid for the call.
    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn extract_pktinfo(msg: &libc::msghdr) -> Option<PktInfoBytes> {
    // SAFETY: `msg` was filled in by a successful `recvmsg` call with a
    // valid `msg_control` buffer of `msg_controllen` bytes.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IPV6 && (*cmsg).cmsg_type == libc::IPV6_PKTINFO {
                let data = libc::CMSG_DATA(cmsg);
                let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let bytes = std::slice::from_raw_parts(data, len);
                return Some(PktInfoBytes::from_slice(bytes));
            }
            cmsg = libc::CMSG_NXTHDR(msg as *const _ as *mut _, cmsg);
        }
    }
    None
}

fn sockaddr_in6_to_std(addr: &libc::sockaddr_in6) -> SocketAddr {
    let octets = addr.sin6_addr.s6_addr;
    let ip = std::net::Ipv6Addr::from(octets);
    let port = u16::from_be(addr.sin6_port);
    SocketAddr::V6(std::net::SocketAddrV6::new(ip, port, 0, addr.sin6_scope_id))
}

fn sockaddr_in6_from_std(addr: &std::net::SocketAddrV6) -> libc::sockaddr_in6 {
    let mut s: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    s.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    s.sin6_port = addr.port().to_be();
    s.sin6_addr = libc::in6_addr {
        s6_addr: addr.ip().octets(),
    };
    s.sin6_scope_id = addr.scope_id();
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddrV6, UdpSocket};
    use std::os::fd::AsRawFd;

    #[test]
    fn roundtrips_a_datagram_without_pktinfo_set() {
        let sender = UdpSocket::bind("[::1]:0").unwrap();
        let receiver = UdpSocket::bind("[::1]:0").unwrap();
        enable_recvpktinfo(receiver.as_raw_fd()).unwrap();

        let dest = receiver.local_addr().unwrap();
        sender.send_to(b"hello", dest).unwrap();

        let mut buf = [0u8; 16];
        let received = recv_with_pktinfo(receiver.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..received.len], b"hello");
        assert_eq!(received.from.port(), sender.local_addr().unwrap().port());
    }

    #[test]
    fn sockaddr_conversion_round_trips() {
        let original = SocketAddrV6::new("2001:db8::1".parse().unwrap(), 4242, 0, 0);
        let raw = sockaddr_in6_from_std(&original);
        let back = sockaddr_in6_to_std(&raw);
        assert_eq!(back, SocketAddr::V6(original));
    }
}
