mod common;

use std::net::{Ipv4Addr, SocketAddr};

use blackbox_client::{Client, InitConfig, InitFlags};
use blackbox_net::discovery::ResponseKind;
use blackbox_protocol::{DiscoveryPacketType, DiscoveryRequest, PROTOCOL_VERSION};
use blackbox_server::{
    AddressFamily, DeviceCodes, Server, ServerConfig, SharedWhitelist, WhitelistEntryConfig,
    authorize_request, resolved_entry,
};
use blackbox_timing::Duration;

fn request(app: &str, device_code: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        protocol_version: PROTOCOL_VERSION,
        application_name: app.to_string(),
        device_code: device_code.to_string(),
        ..DiscoveryRequest::default()
    }
}

fn from(ip: [u8; 4]) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::from(ip), 4242))
}

fn whitelist_of(entries: Vec<blackbox_server::ResolvedWhitelistEntry>) -> SharedWhitelist {
    let shared = SharedWhitelist::default();
    shared.publish(entries);
    shared
}

#[test]
fn allowed_subnet_with_app_filter() {
    let whitelist = whitelist_of(vec![resolved_entry(
        Ipv4Addr::new(10, 0, 0, 0).into(),
        8,
        "foo",
        true,
        Duration::ZERO,
    )]);
    let codes = DeviceCodes::default();

    let decision = authorize_request(
        &whitelist,
        &codes,
        DiscoveryPacketType::RequestDiscovery,
        &request("foo", ""),
        from([10, 1, 2, 3]),
    );
    assert_eq!(decision, Some((ResponseKind::AnnouncePresence, Duration::ZERO)));

    // outside the subnet
    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &request("foo", ""),
            from([11, 0, 0, 1]),
        ),
        None
    );
    // wrong application
    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &request("bar", ""),
            from([10, 1, 2, 3]),
        ),
        None
    );
}

#[test]
fn deny_beats_later_allow() {
    let whitelist = whitelist_of(vec![
        resolved_entry(Ipv4Addr::new(192, 168, 0, 0).into(), 16, "", false, Duration::ZERO),
        resolved_entry(Ipv4Addr::UNSPECIFIED.into(), 0, "", true, Duration::ZERO),
    ]);
    let codes = DeviceCodes::default();

    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &request("demo", ""),
            from([192, 168, 5, 1]),
        ),
        None
    );
    assert!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &request("demo", ""),
            from([10, 1, 1, 1]),
        )
        .is_some()
    );
}

#[test]
fn reservation_maps_to_accept_and_delay_only_staggers_discovery() {
    let whitelist = whitelist_of(vec![resolved_entry(
        Ipv4Addr::new(10, 0, 0, 0).into(),
        8,
        "",
        true,
        Duration::from_millis(150),
    )]);
    let codes = DeviceCodes::default();

    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &request("demo", ""),
            from([10, 0, 0, 1]),
        ),
        Some((ResponseKind::AnnouncePresence, Duration::from_millis(150)))
    );
    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestReservation,
            &request("demo", ""),
            from([10, 0, 0, 1]),
        ),
        Some((ResponseKind::ReservationAccept, Duration::ZERO))
    );
}

#[test]
fn device_code_authorizes_past_a_deny() {
    let whitelist = whitelist_of(vec![resolved_entry(
        Ipv4Addr::UNSPECIFIED.into(),
        0,
        "",
        false,
        Duration::ZERO,
    )]);
    let codes = DeviceCodes::default();
    codes.set_codes(vec!["devkit-7".into()]);

    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &request("demo", "devkit-7"),
            from([203, 0, 113, 9]),
        ),
        Some((ResponseKind::AnnouncePresence, Duration::ZERO))
    );
    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &request("demo", "unknown"),
            from([203, 0, 113, 9]),
        ),
        None
    );
}

#[test]
fn wrong_protocol_version_is_dropped() {
    let whitelist = whitelist_of(vec![resolved_entry(
        Ipv4Addr::UNSPECIFIED.into(),
        0,
        "",
        true,
        Duration::ZERO,
    )]);
    let codes = DeviceCodes::default();
    let mut req = request("demo", "");
    req.protocol_version = 0x0002_0000;
    assert_eq!(
        authorize_request(
            &whitelist,
            &codes,
            DiscoveryPacketType::RequestDiscovery,
            &req,
            from([10, 0, 0, 1]),
        ),
        None
    );
}

/// End to end: a denied subnet gets no discovery response, so the client
/// never connects.
#[test]
fn denied_client_gets_no_response() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        whitelist: vec![WhitelistEntryConfig::deny("127.0.0.0/8")],
        discovery_port: 0,
        address_family: AddressFamily::V4,
        ..ServerConfig::default()
    };
    let server = Server::start(&config, dir.path().to_path_buf(), None);
    let port = common::wait_for_port(&server);
    common::wait_for_whitelist(&server);

    let client = Client::new();
    client.init(InitConfig::new("denied").with_flags(InitFlags::NO_CONNECT));
    client.connect(Some(Ipv4Addr::LOCALHOST), port);
    assert!(!client.is_connected());

    server.shutdown();
}
