use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use blackbox_net::{
    Connection,
    discovery::{DiscoveryParams, DiscoveryServer, ResponseKind, client_start},
};

/// One discovery handshake over loopback: request, announce, reservation,
/// accept, TCP session on the reserved port.
#[test]
fn reservation_handshake_hands_off_listener() {
    let mut server = DiscoveryServer::bind(0, true, false).unwrap();
    let port = server.port();
    assert_ne!(port, 0);

    let shutdown = Arc::new(AtomicBool::new(false));
    let server_shutdown = Arc::clone(&shutdown);

    let server_thread = thread::spawn(move || {
        let mut accepted_app = None;
        while !server_shutdown.load(Ordering::Relaxed) {
            server.tick_responses();
            if let Some((ty, request, from)) = server.recv_request() {
                let response = if ty.is_request_discovery() {
                    ResponseKind::AnnouncePresence
                } else {
                    ResponseKind::ReservationAccept
                };
                server.process_request(from, &request, response, blackbox_timing::Duration::ZERO);
            }
            for pending in server.take_pending() {
                accepted_app = Some(pending.application_name.clone());
                let conn = Connection::new();
                assert!(conn.adopt_listener(pending.listener));
                let deadline = Instant::now() + Duration::from_secs(5);
                while !conn.tick_listening() {
                    // the accept datagram may still be queued
                    server.tick_responses();
                    assert!(Instant::now() < deadline, "client never connected to reservation");
                }
                assert!(conn.is_connected());
                conn.disconnect();
            }
        }
        accepted_app
    });

    let params = DiscoveryParams {
        application_name: "demo".into(),
        search_addr: Some(Ipv4Addr::LOCALHOST),
        search_port: port,
        ..DiscoveryParams::default()
    };
    let endpoint = client_start(&params).expect("discovery should reserve a port");
    assert_eq!(endpoint.addr, Ipv4Addr::LOCALHOST);
    assert_ne!(endpoint.port, 0);

    // the announced port accepts a TCP connection within the window
    let client = Connection::new();
    assert!(client.connect_async(SocketAddr::from((endpoint.addr, endpoint.port))));
    let deadline = Instant::now() + Duration::from_secs(5);
    while !client.tick_connecting() {
        assert!(Instant::now() < deadline, "reserved port never accepted");
        if !client.is_connecting() && !client.is_connected() {
            panic!("connect to reserved port failed");
        }
    }

    shutdown.store(true, Ordering::Relaxed);
    let accepted_app = server_thread.join().unwrap();
    assert_eq!(accepted_app.as_deref(), Some("demo"));
    client.disconnect();
}

/// A second request from the same address replaces the stale response slot
/// rather than queueing a duplicate.
#[test]
fn repeat_requests_do_not_accumulate_responses() {
    let mut server = DiscoveryServer::bind(0, true, false).unwrap();
    let port = server.port();

    let client = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let request = blackbox_protocol::DiscoveryPacket::request(
        blackbox_protocol::DiscoveryPacketType::RequestDiscovery,
        blackbox_protocol::DiscoveryRequest {
            application_name: "demo".into(),
            ..blackbox_protocol::DiscoveryRequest::default()
        },
    );
    let mut buf = [0u8; blackbox_protocol::MAX_DISCOVERY_PACKET_SIZE];
    let len = request.serialize(&mut buf).unwrap();

    for _ in 0..3 {
        client.send_to(&buf[..len], (Ipv4Addr::LOCALHOST, port)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "request never arrived");
            if let Some((ty, request, from)) = server.recv_request() {
                assert!(ty.is_request_discovery());
                // a large delay keeps the response queued so repeats can evict it
                server.process_request(
                    from,
                    &request,
                    ResponseKind::AnnouncePresence,
                    blackbox_timing::Duration::from_secs(60),
                );
                break;
            }
        }
    }

    // responses are delayed, so eviction is observable
    assert_eq!(server.queued_response_count(), 1);
    server.tick_responses();
    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut scratch = [0u8; 64];
    assert!(client.recv_from(&mut scratch).is_err(), "delayed responses must not send early");
}
