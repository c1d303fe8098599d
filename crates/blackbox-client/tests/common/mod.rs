use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    thread,
    time::{Duration, Instant},
};

use blackbox_net::{Connection, bind_ephemeral_listener};
use blackbox_protocol::Packet;

/// In-process stand-in for a recording server: one listener, one connection.
pub struct FakeServer {
    pub conn: Connection,
    pub addr: SocketAddr,
}

pub fn start() -> FakeServer {
    let (listener, port) = bind_ephemeral_listener(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
    let conn = Connection::new();
    assert!(conn.adopt_listener(listener));
    FakeServer { conn, addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port) }
}

impl FakeServer {
    pub fn accept(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.conn.tick_listening() {
            assert!(Instant::now() < deadline, "client never connected");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Collects packets until `count` arrive or the wait times out.
    pub fn recv_packets(&self, count: usize) -> Vec<Packet> {
        let mut packets = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while packets.len() < count {
            assert!(
                Instant::now() < deadline,
                "timed out with {} of {count} packets",
                packets.len()
            );
            self.conn.tick();
            while let Some(packet) = self.conn.decode_packet().unwrap() {
                packets.push(packet);
            }
        }
        packets
    }
}
