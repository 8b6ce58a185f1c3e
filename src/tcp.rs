//! TCP listen/relay engine (`spec.md` §4.3): one listener thread per
//! forwarded port, one relay thread per accepted connection, splicing
//! bytes between the external and internal sides until either side closes
//! or the connection sits idle past `tcp_timeout`.

use crate::config::ProxyItem;
use crate::stack::UsageCounter;
use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv6Addr, SocketAddrV6, TcpListener, TcpStream};
use std::time::{Duration, Instant};

const RELAY_BUF_LEN: usize = 128 * 1024;
const POLL_EVENT_CAPACITY: usize = 8;

/// Everything one listener thread needs: which port to listen on, where to
/// forward, and the usage counter binding it to this epoch's external
/// stack.
pub struct TcpListenContext {
    pub item: ProxyItem,
    pub external_addr: Ipv6Addr,
    pub iface: String,
    /// Whether to `SO_BINDTODEVICE` the listen socket to `iface`. `false`
    /// for the [`crate::stack::NullStackFactory`] test path, whose
    /// loopback-bound sockets would otherwise need `CAP_NET_RAW`.
    pub bind_to_device: bool,
    pub internal_iface: Option<String>,
    pub counter: UsageCounter,
    pub tcp_timeout: Duration,
    pub tcp_listen_backlog: i32,
}

/// Binds and listens on `ctx.external_addr:ctx.item.external_port`, bound
/// to `ctx.iface` via `SO_BINDTODEVICE` so traffic only answers on this
/// epoch's stack. Accepts connections until `deadline`, spawning one relay
/// thread per connection; each relay thread holds its own counter
/// reference so in-flight connections outlive the listener itself.
///
/// Takes ownership of one `counter` reference for the listener's own
/// lifetime; the caller must have already called `counter.acquire()` for
/// it.
pub fn run_listener(ctx: TcpListenContext, deadline: Instant) {
    let listener = match bind_listener(&ctx) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(
                port = ctx.item.external_port,
                iface = %ctx.iface,
                error = %e,
                "failed to bind external TCP listener"
            );
            ctx.counter.release();
            return;
        }
    };

    if let Err(e) = listener.set_nonblocking(true) {
        tracing::warn!(error = %e, "failed to set listener nonblocking");
        ctx.counter.release();
        return;
    }

    let mut mio_listener = mio::net::TcpListener::from_std(listener);

    let poll = Poll::new();
    let mut poll = match poll {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create listener poll");
            ctx.counter.release();
            return;
        }
    };
    const LISTEN: Token = Token(0);
    if let Err(e) = poll
        .registry()
        .register(&mut mio_listener, LISTEN, Interest::READABLE)
    {
        tracing::warn!(error = %e, "failed to register listener with poll");
        ctx.counter.release();
        return;
    }

    let mut events = Events::with_capacity(POLL_EVENT_CAPACITY);
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let timeout = deadline.saturating_duration_since(now).min(Duration::from_secs(1));

        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(error = %e, "listener poll failed");
            break;
        }

        for event in &events {
            if event.token() != LISTEN {
                continue;
            }
            loop {
                match mio_listener.accept() {
                    Ok((stream, peer)) => {
                        ctx.counter.acquire();
                        spawn_relay(
                            stream,
                            ctx.item.internal_addr,
                            ctx.internal_iface.clone(),
                            ctx.tcp_timeout,
                            ctx.counter.clone(),
                            peer.to_string(),
                        );
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(port = ctx.item.external_port, "listener reached epoch deadline, stopping");
    ctx.counter.release();
}

fn bind_listener(ctx: &TcpListenContext) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    if ctx.bind_to_device {
        socket.bind_device(Some(ctx.iface.as_bytes()))?;
    }
    let addr: std::net::SocketAddr = SocketAddrV6::new(ctx.external_addr, ctx.item.external_port, 0, 0).into();
    socket.bind(&addr.into())?;
    socket.listen(ctx.tcp_listen_backlog)?;
    Ok(socket.into())
}

fn spawn_relay(
    external: TcpStream,
    internal_addr: SocketAddrV6,
    internal_iface: Option<String>,
    tcp_timeout: Duration,
    counter: UsageCounter,
    peer: String,
) {
    std::thread::spawn(move || {
        let internal = match connect_internal(internal_addr, internal_iface.as_deref()) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "failed to connect to internal endpoint");
                counter.release();
                return;
            }
        };

        if let Err(e) = relay(external, internal, tcp_timeout) {
            tracing::debug!(%peer, error = %e, "relay ended with an error");
        }
        counter.release();
    });
}

fn connect_internal(addr: SocketAddrV6, iface: Option<&str>) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?;
    #[cfg(target_os = "linux")]
    if let Some(iface) = iface {
        socket.bind_device(Some(iface.as_bytes()))?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = iface;
    socket.connect(&std::net::SocketAddr::V6(addr).into())?;
    Ok(socket.into())
}

/// Splices `external` and `internal` bidirectionally until both sides have
/// reached EOF or the connection has been idle for `idle_timeout`.
fn relay(external: TcpStream, internal: TcpStream, idle_timeout: Duration) -> io::Result<()> {
    external.set_nonblocking(true)?;
    internal.set_nonblocking(true)?;

    let mut ext = MioTcpStream::from_std(external);
    let mut int = MioTcpStream::from_std(internal);

    const EXT: Token = Token(0);
    const INT: Token = Token(1);

    let mut poll = Poll::new()?;
    poll.registry().register(&mut ext, EXT, Interest::READABLE)?;
    poll.registry().register(&mut int, INT, Interest::READABLE)?;

    let mut events = Events::with_capacity(POLL_EVENT_CAPACITY);
    let mut buf = vec![0u8; RELAY_BUF_LEN];

    let mut ext_open = true;
    let mut int_open = true;

    while ext_open || int_open {
        poll.poll(&mut events, Some(idle_timeout))?;
        if events.is_empty() {
            tracing::debug!("connection idle past tcp_timeout, closing");
            break;
        }

        for event in &events {
            match event.token() {
                EXT if ext_open => match pump(&mut ext, &mut int, &mut buf)? {
                    PumpOutcome::Eof => {
                        ext_open = false;
                        let _ = int.shutdown(std::net::Shutdown::Write);
                        poll.registry().deregister(&mut ext).ok();
                    }
                    PumpOutcome::WouldBlock | PumpOutcome::Progressed => {}
                },
                INT if int_open => match pump(&mut int, &mut ext, &mut buf)? {
                    PumpOutcome::Eof => {
                        int_open = false;
                        let _ = ext.shutdown(std::net::Shutdown::Write);
                        poll.registry().deregister(&mut int).ok();
                    }
                    PumpOutcome::WouldBlock | PumpOutcome::Progressed => {}
                },
                _ => {}
            }
        }
    }

    Ok(())
}

enum PumpOutcome {
    Progressed,
    WouldBlock,
    Eof,
}

/// Drains everything currently readable on `src` into `dst`, looping on
/// short writes. Unlike the original's single `write()` call per read,
/// we loop until every byte is sent — `spec.md` §9 flags the original's
/// assumption that datagram-sized writes never come back short as
/// unsafe to carry forward for a generic relay.
fn pump(src: &mut MioTcpStream, dst: &mut MioTcpStream, buf: &mut [u8]) -> io::Result<PumpOutcome> {
    let mut progressed = false;
    loop {
        match src.read(buf) {
            Ok(0) => return Ok(PumpOutcome::Eof),
            Ok(n) => {
                write_all_looping(dst, &buf[..n])?;
                progressed = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Ok(if progressed {
                    PumpOutcome::Progressed
                } else {
                    PumpOutcome::WouldBlock
                });
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn write_all_looping(dst: &mut MioTcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match dst.write(data) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener as StdTcpListener;

    #[test]
    fn relay_forwards_both_directions_until_close() {
        let ext_listener = StdTcpListener::bind("[::1]:0").unwrap();
        let int_listener = StdTcpListener::bind("[::1]:0").unwrap();
        let ext_addr = ext_listener.local_addr().unwrap();
        let int_addr = int_listener.local_addr().unwrap();

        let client = std::thread::spawn(move || -> Vec<u8> {
            let mut s = TcpStream::connect(ext_addr).unwrap();
            s.write_all(b"ping").unwrap();
            s.shutdown(std::net::Shutdown::Write).unwrap();
            let mut out = Vec::new();
            s.read_to_end(&mut out).unwrap();
            out
        });

        let backend = std::thread::spawn(move || {
            let (mut s, _) = int_listener.accept().unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            s.write_all(b"pong").unwrap();
        });

        let (ext_stream, _) = ext_listener.accept().unwrap();
        let int_stream = TcpStream::connect(int_addr).unwrap();
        relay(ext_stream, int_stream, Duration::from_secs(5)).unwrap();

        backend.join().unwrap();
        assert_eq!(client.join().unwrap(), b"pong");
    }
}
