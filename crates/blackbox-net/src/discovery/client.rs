use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use blackbox_protocol::{
    DISCOVERY_PORT, DiscoveryPacket, DiscoveryPacketType, DiscoveryRequest,
    MAX_DISCOVERY_PACKET_SIZE, PROTOCOL_VERSION, Platform,
};
use blackbox_timing::{Duration, Instant};
use tracing::{debug, error, warn};

const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(500);
const DISCOVERY_REQUEST_INTERVAL: Duration = Duration::from_millis(100);
const RESERVATION_TIMEOUT: Duration = Duration::from_secs(2);
const RECV_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default)]
pub struct DiscoveryParams {
    pub application_name: String,
    pub source_application_name: String,
    pub device_code: String,
    pub source_ip: u32,
    /// None broadcasts on the subnet.
    pub search_addr: Option<Ipv4Addr>,
    /// 0 uses the default discovery port.
    pub search_port: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

fn send_request(
    socket: &UdpSocket,
    ty: DiscoveryPacketType,
    params: &DiscoveryParams,
    target: SocketAddrV4,
) -> bool {
    let packet = DiscoveryPacket::request(
        ty,
        DiscoveryRequest {
            protocol_version: PROTOCOL_VERSION,
            source_ip: params.source_ip,
            platform: Platform::current() as u32,
            device_code: params.device_code.clone(),
            source_application_name: params.source_application_name.clone(),
            application_name: params.application_name.clone(),
        },
    );
    let mut buf = [0u8; MAX_DISCOVERY_PACKET_SIZE];
    let len = match packet.serialize(&mut buf) {
        Ok(len) => len,
        Err(err) => {
            error!(?err, "failed to encode discovery request");
            return false;
        }
    };
    match socket.send_to(&buf[..len], target) {
        Ok(sent) => {
            debug!(bytes = sent, %target, "sent discovery request");
            sent == len
        }
        Err(err) => {
            // A broadcast on a machine without a default route errors here;
            // surface it and keep looping.
            debug!(?err, %target, "failed to send discovery request");
            false
        }
    }
}

/// Receives discovery responses until one decodes or `window` expires.
fn recv_response(socket: &UdpSocket, window: Duration) -> Option<(DiscoveryPacket, SocketAddr)> {
    let deadline = Instant::now() + window;
    let mut buf = [0u8; MAX_DISCOVERY_PACKET_SIZE];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let remaining: std::time::Duration = (deadline - now).into();
        if socket.set_read_timeout(Some(remaining.max(std::time::Duration::from_millis(1)))).is_err()
        {
            return None;
        }
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if let Ok(packet) = DiscoveryPacket::deserialize(&buf[..n]) {
                    if packet.ty().is_response() {
                        return Some((packet, from));
                    }
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                warn!(?err, "discovery recv failed");
            }
        }
    }
}

/// Locates a server and reserves a dedicated TCP port. Blocks for at most
/// ~500ms of discovery plus one 2s reservation window.
pub fn client_start(params: &DiscoveryParams) -> Option<ServerEndpoint> {
    let target_ip = params.search_addr.unwrap_or(Ipv4Addr::BROADCAST);
    let target_port = if params.search_port == 0 { DISCOVERY_PORT } else { params.search_port };
    let target = SocketAddrV4::new(target_ip, target_port);

    debug!("client discovery started");
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
        Ok(socket) => socket,
        Err(err) => {
            error!(?err, "client discovery failed to bind");
            return None;
        }
    };
    if let Err(err) = socket.set_broadcast(true) {
        error!(?err, "client discovery failed to enable broadcast");
        return None;
    }

    let deadline = Instant::now() + DISCOVERY_TIMEOUT;
    let mut prev_request = Instant::ZERO;
    while Instant::now() <= deadline {
        if Instant::now() >= prev_request + DISCOVERY_REQUEST_INTERVAL {
            send_request(&socket, DiscoveryPacketType::RequestDiscovery, params, target);
            prev_request = Instant::now();
        }

        let Some((packet, from)) = recv_response(&socket, RECV_SLICE) else { continue };
        let SocketAddr::V4(from) = from else { continue };
        if packet.ty() != DiscoveryPacketType::AnnouncePresence {
            // reservation responses here are stale, maybe from a previous run
            debug!(ty = ?packet.ty(), "ignoring unexpected discovery response");
            continue;
        }

        let server_ip = *from.ip();
        debug!(%server_ip, "sending reservation request");
        send_request(
            &socket,
            DiscoveryPacketType::RequestReservation,
            params,
            SocketAddrV4::new(server_ip, target_port),
        );

        let reservation_deadline = Instant::now() + RESERVATION_TIMEOUT;
        while Instant::now() < reservation_deadline {
            let Some((packet, from)) = recv_response(&socket, RECV_SLICE) else { continue };
            let SocketAddr::V4(from) = from else { continue };
            if *from.ip() != server_ip {
                debug!(got = %from.ip(), want = %server_ip, "ignoring response from other server");
                continue;
            }
            if let DiscoveryPacket::Response { ty: DiscoveryPacketType::ReservationAccept, response } =
                packet
            {
                debug!(%server_ip, port = response.port, "reserved server");
                return Some(ServerEndpoint { addr: server_ip, port: response.port });
            }
        }
        warn!(%server_ip, "timed out waiting for reservation response");
    }

    error!("client discovery failed");
    None
}
