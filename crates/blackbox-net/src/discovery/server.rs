use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use blackbox_protocol::{
    DiscoveryPacket, DiscoveryPacketType, DiscoveryRequest, MAX_DISCOVERY_PACKET_SIZE,
};
use blackbox_timing::{Duration, Instant};
use mio::{Events, Interest, Poll, Token, net::TcpListener, net::UdpSocket};
use tracing::{debug, error, warn};

use crate::{conn::bind_ephemeral_listener, sockets::bind_udp_reuse};

const V4: Token = Token(0);
const V6: Token = Token(1);

const RESPONSE_INTERVAL: Duration = Duration::from_millis(50);
const MAX_RESPONSES: usize = 64;
const MAX_PENDING_CONNECTIONS: usize = 64;
const DISCOVERY_RETRIES: u32 = 1;

/// Which answer the authorization layer chose for a request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    AnnouncePresence,
    ReservationAccept,
}

struct ResponseSlot {
    client_addr: SocketAddr,
    next_send_time: Option<Instant>,
    times_sent: u32,
    max_times_sent: u32,
    packet: DiscoveryPacket,
}

/// A reserved TCP listener waiting to be handed to an ingestion worker.
pub struct PendingConnection {
    pub listener: TcpListener,
    pub port: u16,
    pub application_name: String,
}

/// UDP side of the discovery protocol: one socket per address family, a
/// bounded response schedule, and the listener handoff queue. Single
/// threaded; the owning discovery thread drives `tick_responses` and
/// `recv_request`.
pub struct DiscoveryServer {
    poll: Poll,
    events: Events,
    sock_v4: Option<UdpSocket>,
    sock_v6: Option<UdpSocket>,
    readable_v4: bool,
    readable_v6: bool,
    responses: Vec<ResponseSlot>,
    pending: Vec<PendingConnection>,
}

fn bind_family(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = bind_udp_reuse(addr)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket))
}

impl DiscoveryServer {
    /// Binds the discovery port on the requested families. Succeeds if at
    /// least one family binds.
    pub fn bind(port: u16, want_v4: bool, want_v6: bool) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut sock_v4 = None;
        if want_v4 {
            match bind_family(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)) {
                Ok(mut socket) => {
                    poll.registry().register(&mut socket, V4, Interest::READABLE)?;
                    debug!(port, "bound v4 for discovery");
                    sock_v4 = Some(socket);
                }
                Err(err) => error!(?err, port, "discovery server failed to bind v4"),
            }
        }
        let mut sock_v6 = None;
        if want_v6 {
            match bind_family(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)) {
                Ok(mut socket) => {
                    poll.registry().register(&mut socket, V6, Interest::READABLE)?;
                    debug!(port, "bound v6 for discovery");
                    sock_v6 = Some(socket);
                }
                Err(err) => error!(?err, port, "discovery server failed to bind v6"),
            }
        }
        if sock_v4.is_none() && sock_v6.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "discovery server failed to bind any address family",
            ));
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(8),
            sock_v4,
            sock_v6,
            readable_v4: false,
            readable_v6: false,
            responses: Vec::with_capacity(MAX_RESPONSES),
            pending: Vec::with_capacity(MAX_PENDING_CONNECTIONS),
        })
    }

    /// Sends every due response, dropping slots whose retransmits are spent.
    pub fn tick_responses(&mut self) {
        let now = Instant::now();
        let mut i = self.responses.len();
        while i != 0 {
            i -= 1;
            let due = match self.responses[i].next_send_time {
                Some(at) => at <= now,
                None => true,
            };
            if !due {
                continue;
            }
            let slot = &mut self.responses[i];
            slot.times_sent += 1;
            slot.next_send_time = Some(now + RESPONSE_INTERVAL);

            let socket = if slot.client_addr.is_ipv6() { &self.sock_v6 } else { &self.sock_v4 };
            let sent = socket.as_ref().is_some_and(|socket| {
                let mut buf = [0u8; MAX_DISCOVERY_PACKET_SIZE];
                match slot.packet.serialize(&mut buf) {
                    Ok(len) => match socket.send_to(&buf[..len], slot.client_addr) {
                        Ok(n) => n == len,
                        Err(err) => {
                            debug!(?err, addr = %slot.client_addr, "discovery response send failed");
                            false
                        }
                    },
                    Err(err) => {
                        error!(?err, "failed to encode discovery response");
                        false
                    }
                }
            });
            if !sent || self.responses[i].times_sent >= self.responses[i].max_times_sent {
                self.responses.swap_remove(i);
            }
        }
    }

    /// Waits up to 100ms for a datagram and decodes it. Datagrams that do not
    /// carry a request (bad magic, responses, garbage) are dropped silently.
    pub fn recv_request(&mut self) -> Option<(DiscoveryPacketType, DiscoveryRequest, SocketAddr)> {
        if !self.readable_v4 && !self.readable_v6 {
            if let Err(err) =
                self.poll.poll(&mut self.events, Some(std::time::Duration::from_millis(100)))
            {
                if err.kind() != io::ErrorKind::Interrupted {
                    warn!(?err, "discovery poll failed");
                }
                return None;
            }
            for ev in self.events.iter() {
                match ev.token() {
                    V4 => self.readable_v4 = true,
                    V6 => self.readable_v6 = true,
                    _ => {}
                }
            }
        }

        let mut buf = [0u8; MAX_DISCOVERY_PACKET_SIZE];
        for (socket, readable) in [
            (&self.sock_v4, &mut self.readable_v4),
            (&self.sock_v6, &mut self.readable_v6),
        ] {
            if !*readable {
                continue;
            }
            let Some(socket) = socket else {
                *readable = false;
                continue;
            };
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    match DiscoveryPacket::deserialize(&buf[..n]) {
                        Ok(DiscoveryPacket::Request { ty, request }) => {
                            return Some((ty, request, from));
                        }
                        Ok(DiscoveryPacket::Response { .. }) | Err(_) => {}
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    *readable = false;
                }
                Err(err) => {
                    warn!(?err, "discovery recvfrom failed");
                    *readable = false;
                }
            }
        }
        None
    }

    /// Queues the chosen response for a validated request. A reservation
    /// accept also binds the dedicated listener and parks it until
    /// [`take_pending`] hands it off.
    ///
    /// [`take_pending`]: DiscoveryServer::take_pending
    pub fn process_request(
        &mut self,
        from: SocketAddr,
        request: &DiscoveryRequest,
        response: ResponseKind,
        delay: Duration,
    ) {
        self.remove_response(from);

        if self.responses.len() >= MAX_RESPONSES {
            error!(%from, "response queue overflowed - ignoring request");
            return;
        }
        let next_send_time =
            if delay > Duration::ZERO { Some(Instant::now() + delay) } else { None };

        let packet = match response {
            ResponseKind::AnnouncePresence => {
                DiscoveryPacket::response(DiscoveryPacketType::AnnouncePresence, 0)
            }
            ResponseKind::ReservationAccept => {
                if self.pending.len() >= MAX_PENDING_CONNECTIONS {
                    error!(%from, "too many pending connections - ignoring reservation");
                    return;
                }
                let bind_ip: IpAddr = if from.is_ipv6() {
                    Ipv6Addr::UNSPECIFIED.into()
                } else {
                    Ipv4Addr::UNSPECIFIED.into()
                };
                let (listener, port) = match bind_ephemeral_listener(bind_ip) {
                    Ok(bound) => bound,
                    Err(err) => {
                        error!(?err, %from, "couldn't bind listener for reservation");
                        return;
                    }
                };
                debug!(port, app = %request.application_name, "pending connection reserved");
                self.pending.push(PendingConnection {
                    listener,
                    port,
                    application_name: request.application_name.clone(),
                });
                DiscoveryPacket::response(DiscoveryPacketType::ReservationAccept, port)
            }
        };

        self.responses.push(ResponseSlot {
            client_addr: from,
            next_send_time,
            times_sent: 0,
            max_times_sent: DISCOVERY_RETRIES,
            packet,
        });
    }

    /// Drains reservations whose listeners are waiting for their client.
    pub fn take_pending(&mut self) -> Vec<PendingConnection> {
        std::mem::take(&mut self.pending)
    }

    /// Responses queued but not yet fully sent.
    pub fn queued_response_count(&self) -> usize {
        self.responses.len()
    }

    /// The bound discovery port (useful when constructed with port 0).
    pub fn port(&self) -> u16 {
        self.sock_v4
            .as_ref()
            .or(self.sock_v6.as_ref())
            .and_then(|socket| socket.local_addr().ok())
            .map_or(0, |addr| addr.port())
    }

    /// A repeat request from one address replaces its stale response.
    fn remove_response(&mut self, from: SocketAddr) {
        self.responses.retain(|slot| slot.client_addr.ip() != from.ip());
    }
}
