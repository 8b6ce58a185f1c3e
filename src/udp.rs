//! UDP pseudo-flow engine (`spec.md` §4.4): demultiplexes inbound
//! datagrams into per-`(peer, pktinfo)` flows, each backed by its own
//! connected internal socket, and replays the exact ancillary bytes on the
//! way back out so replies appear to originate from the interface/address
//! the request arrived on.
//!
//! Event tagging uses `mio::Token` ranges (fixed tokens for the external
//! listening sockets, dynamically allocated tokens above them for flows)
//! rather than the original's pointer-arithmetic discriminator — the
//! alternative `spec.md` §9's Open Question #1 explicitly sanctions.

use crate::config::ProxyItem;
use crate::pktinfo::{self, PktInfoBytes};
use crate::stack::UsageCounter;
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

const DATAGRAM_BUF_LEN: usize = 64 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One forwarded UDP port: which external port to listen on and where
/// unseen peers get forwarded.
pub struct UdpPort {
    pub item: ProxyItem,
    pub external_addr: Ipv6Addr,
    pub iface: String,
    /// Whether to `SO_BINDTODEVICE` the external socket to `iface`. `false`
    /// for the [`crate::stack::NullStackFactory`] test path, whose
    /// loopback-bound sockets would otherwise need `CAP_NET_RAW`.
    pub bind_to_device: bool,
}

/// Everything the UDP engine needs for one epoch.
pub struct UdpEngineContext {
    pub ports: Vec<UdpPort>,
    pub internal_iface: Option<String>,
    pub udp_timeout: Duration,
    pub counter: UsageCounter,
}

/// `(external port index, peer address, raw IPV6_PKTINFO bytes)` —
/// compared byte-for-byte, per `spec.md` §4.4.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    port_index: usize,
    peer: SocketAddr,
    pktinfo: PktInfoBytes,
}

struct Flow {
    key: FlowKey,
    socket: MioUdpSocket,
    last_activity: Instant,
}

/// Runs the UDP engine for one epoch until `deadline` has passed *and*
/// every admitted flow has idled out. Takes ownership of one `counter`
/// reference, acquired by the caller before spawning this.
pub fn run_udp_engine(ctx: UdpEngineContext, deadline: Instant) {
    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create UDP poll");
            ctx.counter.release();
            return;
        }
    };

    let mut externals: Vec<Option<MioUdpSocket>> = Vec::with_capacity(ctx.ports.len());
    let mut bound_any = false;
    for (index, port) in ctx.ports.iter().enumerate() {
        match bind_external(port) {
            Ok(mut sock) => {
                let token = Token(index);
                if let Err(e) = poll.registry().register(&mut sock, token, Interest::READABLE) {
                    tracing::warn!(error = %e, "failed to register external UDP socket");
                    externals.push(None);
                    continue;
                }
                bound_any = true;
                externals.push(Some(sock));
            }
            Err(e) => {
                tracing::warn!(port = port.item.external_port, error = %e, "failed to bind external UDP socket");
                externals.push(None);
            }
        }
    }

    if !bound_any {
        tracing::warn!("no external UDP sockets bound, exiting engine");
        ctx.counter.release();
        return;
    }

    let mut flows: HashMap<Token, Flow> = HashMap::new();
    let mut flow_tokens: HashMap<FlowKey, Token> = HashMap::new();
    let mut next_token = externals.len();

    let mut events = Events::with_capacity(64);
    let mut buf = vec![0u8; DATAGRAM_BUF_LEN];
    let mut last_sweep = Instant::now();
    let mut admitting = true;

    loop {
        let now = Instant::now();
        if admitting && now >= deadline {
            admitting = false;
            tracing::debug!("UDP engine epoch deadline reached, admission closed");
        }
        if !admitting && flows.is_empty() {
            break;
        }

        if let Err(e) = poll.poll(&mut events, Some(SWEEP_INTERVAL)) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(error = %e, "UDP poll failed");
            break;
        }

        for event in &events {
            let token = event.token();
            if token.0 < externals.len() {
                handle_external_readable(
                    token,
                    &mut externals,
                    &ctx,
                    admitting,
                    &mut poll,
                    &mut flows,
                    &mut flow_tokens,
                    &mut next_token,
                    &mut buf,
                );
            } else if let Some(flow) = flows.get_mut(&token) {
                handle_internal_readable(flow, &mut externals, &mut buf);
            }
        }

        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            sweep_idle_flows(&mut poll, &mut flows, &mut flow_tokens, ctx.udp_timeout);
            last_sweep = Instant::now();
        }
    }

    tracing::debug!("UDP engine drained all flows, exiting");
    ctx.counter.release();
}

#[allow(clippy::too_many_arguments)]
fn handle_external_readable(
    token: Token,
    externals: &mut [Option<MioUdpSocket>],
    ctx: &UdpEngineContext,
    admitting: bool,
    poll: &mut Poll,
    flows: &mut HashMap<Token, Flow>,
    flow_tokens: &mut HashMap<FlowKey, Token>,
    next_token: &mut usize,
    buf: &mut [u8],
) {
    let port_index = token.0;
    let Some(external) = externals[port_index].as_ref() else {
        return;
    };
    let fd = external.as_raw_fd();

    loop {
        let received = match pktinfo::recv_with_pktinfo(fd, buf) {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::debug!(error = %e, "external UDP recv failed");
                return;
            }
        };

        let key = FlowKey {
            port_index,
            peer: received.from,
            pktinfo: received.pktinfo.clone().unwrap_or_default(),
        };

        let flow_token = match flow_tokens.get(&key) {
            Some(t) => *t,
            None => {
                if !admitting {
                    continue; // admission closed: drop datagrams from unseen peers.
                }
                match open_flow(ctx, port_index, key.clone()) {
                    Ok(mut flow) => {
                        let new_token = Token(*next_token);
                        *next_token += 1;
                        if let Err(e) = poll.registry().register(&mut flow.socket, new_token, Interest::READABLE) {
                            tracing::debug!(error = %e, "failed to register flow socket");
                            continue;
                        }
                        flows.insert(new_token, flow);
                        flow_tokens.insert(key.clone(), new_token);
                        new_token
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "failed to open internal flow");
                        continue;
                    }
                }
            }
        };

        if let Some(flow) = flows.get_mut(&flow_token) {
            if let Err(e) = flow.socket.send(&buf[..received.len]) {
                tracing::debug!(error = %e, "failed to forward datagram to internal endpoint");
            }
            flow.last_activity = Instant::now();
        }
    }
}

fn handle_internal_readable(flow: &mut Flow, externals: &mut [Option<MioUdpSocket>], buf: &mut [u8]) {
    loop {
        match flow.socket.recv(buf) {
            Ok(n) => {
                flow.last_activity = Instant::now();
                let Some(ext) = externals[flow.key.port_index].as_ref() else {
                    continue;
                };
                if let Err(e) = pktinfo::send_with_pktinfo(ext.as_raw_fd(), &buf[..n], flow.key.peer, &flow.key.pktinfo) {
                    tracing::debug!(error = %e, "failed to relay reply to external peer");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                tracing::debug!(error = %e, "internal UDP recv failed");
                return;
            }
        }
    }
}

fn sweep_idle_flows(
    poll: &mut Poll,
    flows: &mut HashMap<Token, Flow>,
    flow_tokens: &mut HashMap<FlowKey, Token>,
    udp_timeout: Duration,
) {
    let now = Instant::now();
    let expired: Vec<Token> = flows
        .iter()
        .filter(|(_, flow)| now.duration_since(flow.last_activity) >= udp_timeout)
        .map(|(token, _)| *token)
        .collect();

    for token in expired {
        if let Some(mut flow) = flows.remove(&token) {
            poll.registry().deregister(&mut flow.socket).ok();
            flow_tokens.remove(&flow.key);
        }
    }
}

fn open_flow(ctx: &UdpEngineContext, port_index: usize, key: FlowKey) -> io::Result<Flow> {
    let internal_addr = ctx.ports[port_index].item.internal_addr;
    let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, None)?;
    #[cfg(target_os = "linux")]
    if let Some(iface) = &ctx.internal_iface {
        socket.bind_device(Some(iface.as_bytes()))?;
    }
    socket.connect(&std::net::SocketAddr::V6(internal_addr).into())?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    let socket = MioUdpSocket::from_std(std_socket);

    Ok(Flow {
        key,
        socket,
        last_activity: Instant::now(),
    })
}

fn bind_external(port: &UdpPort) -> io::Result<MioUdpSocket> {
    let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, None)?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    #[cfg(target_os = "linux")]
    if port.bind_to_device {
        socket.bind_device(Some(port.iface.as_bytes()))?;
    }
    let addr: std::net::SocketAddr = SocketAddrV6::new(port.external_addr, port.item.external_port, 0, 0).into();
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    pktinfo::enable_recvpktinfo(socket.as_raw_fd())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(MioUdpSocket::from_std(std_socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{NullStackFactory, StackFactory, UsageCounter};
    use std::sync::Arc;

    fn loopback_port(internal: SocketAddrV6) -> UdpPort {
        UdpPort {
            item: ProxyItem {
                external_port: 0,
                internal_addr: internal,
            },
            external_addr: Ipv6Addr::LOCALHOST,
            iface: "lo".to_string(),
            bind_to_device: false,
        }
    }

    #[test]
    fn flow_key_distinguishes_different_pktinfo_bytes() {
        let peer: SocketAddr = "[::1]:4000".parse().unwrap();
        let a = FlowKey {
            port_index: 0,
            peer,
            pktinfo: PktInfoBytes::from_slice(&[1, 2, 3]),
        };
        let b = FlowKey {
            port_index: 0,
            peer,
            pktinfo: PktInfoBytes::from_slice(&[1, 2, 4]),
        };
        assert_ne!(a, b);
    }

    #[test]
    fn engine_forwards_a_datagram_round_trip() {
        let backend = std::net::UdpSocket::bind("[::1]:0").unwrap();
        let backend_addr = match backend.local_addr().unwrap() {
            SocketAddr::V6(v6) => v6,
            _ => unreachable!(),
        };

        let external_listener = std::net::UdpSocket::bind("[::1]:0").unwrap();
        let external_port = match external_listener.local_addr().unwrap() {
            SocketAddr::V6(v6) => v6.port(),
            _ => unreachable!(),
        };
        drop(external_listener);

        let mut port = loopback_port(backend_addr);
        port.item.external_port = external_port;

        let factory = NullStackFactory::default();
        let stack = factory.create_external_stack(&crate::config::ExtStackConfig {
            stack: None,
            vnl: None,
            iface: "lo".to_string(),
        }).unwrap();
        let counter = UsageCounter::new(stack, Arc::new(factory));
        counter.acquire();

        let ctx = UdpEngineContext {
            ports: vec![port],
            internal_iface: None,
            udp_timeout: Duration::from_millis(200),
            counter: counter.clone(),
        };

        let deadline = Instant::now() + Duration::from_millis(150);
        let handle = std::thread::spawn(move || run_udp_engine(ctx, deadline));

        std::thread::sleep(Duration::from_millis(20));
        let client = std::net::UdpSocket::bind("[::1]:0").unwrap();
        client
            .send_to(b"hi", ("::1", external_port))
            .unwrap();

        let mut buf = [0u8; 16];
        backend.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let (n, from) = backend.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");

        backend.send_to(b"yo", from).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"yo");

        handle.join().unwrap();
    }
}
