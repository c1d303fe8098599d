mod common;

use std::net::Ipv4Addr;

use blackbox_client::{Client, InitConfig, InitFlags, LogLevel};
use blackbox_protocol::PacketKind;
use blackbox_server::{
    AddressFamily, Server, ServerConfig, UiCommand, WhitelistEntryConfig,
};

/// The full path: discovery over loopback, reservation, TCP session,
/// ingestion into a `.bbox` file, and lifecycle messages to the UI queue.
#[test]
fn discovery_to_recording_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        whitelist: vec![WhitelistEntryConfig::allow("127.0.0.0/8")],
        discovery_port: 0,
        address_family: AddressFamily::V4,
        ..ServerConfig::default()
    };
    let server = Server::start(&config, dir.path().to_path_buf(), None);
    let port = common::wait_for_port(&server);
    common::wait_for_whitelist(&server);

    let client = Client::new();
    client.set_initial_buffer(1 << 20);
    client.init(InitConfig::new("demo").with_flags(InitFlags::NO_CONNECT));
    let path_id = client.resolve_path_id(file!(), line!());
    client.thread_start(path_id, line!(), "main");
    client.trace_dynamic(file!(), line!(), "startup", LogLevel::Log, 0, format_args!("hello {}", 42));

    client.connect(Some(Ipv4Addr::LOCALHOST), port);
    assert!(client.is_connected(), "client should reach the reserved port");
    client.flush();

    let start = common::wait_for_ui(server.queues(), "RecordingStart", |cmd| {
        matches!(cmd, UiCommand::RecordingStart(_))
    });
    let UiCommand::RecordingStart(info) = start else { unreachable!() };
    assert_eq!(info.application_name, "demo");
    assert!(info.open_view, "no NoOpenView flag was set");
    assert!(info.filename.ends_with("demo.bbox"));

    client.shutdown(file!(), line!());

    common::wait_for_ui(server.queues(), "RecordingStop", |cmd| {
        matches!(cmd, UiCommand::RecordingStop { .. })
    });

    let bytes = std::fs::read(&info.path).unwrap();
    let packets = common::parse_stream(&bytes);

    let PacketKind::AppInfo(app) = &packets[0].kind else {
        panic!("recording must start with AppInfo");
    };
    assert_eq!(app.application_name, "demo");

    let mut names = Vec::new();
    let mut logs = Vec::new();
    for packet in &packets {
        match &packet.kind {
            PacketKind::FileId(r) => names.push(format!("file:{}", r.name)),
            PacketKind::CategoryId(r) => names.push(format!("category:{}", r.name)),
            PacketKind::ThreadStart(t) => names.push(format!("thread:{}", t.text)),
            PacketKind::LogText(t) => logs.push(t.text.clone()),
            _ => {}
        }
    }
    assert!(names.contains(&format!("file:{}", file!())));
    assert!(names.contains(&"category:startup".to_string()));
    assert!(names.contains(&"thread:main".to_string()));
    assert_eq!(logs, ["hello 42\n"]);

    server.shutdown();
}

/// The recording directory is per application, sanitized.
#[test]
fn recordings_are_grouped_per_application() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        whitelist: vec![WhitelistEntryConfig::allow("127.0.0.0/8")],
        discovery_port: 0,
        address_family: AddressFamily::V4,
        ..ServerConfig::default()
    };
    let server = Server::start(&config, dir.path().to_path_buf(), None);
    let port = common::wait_for_port(&server);
    common::wait_for_whitelist(&server);

    let client = Client::new();
    client.init(InitConfig::new("My/Game:2").with_flags(InitFlags::NO_CONNECT));
    client.connect(Some(Ipv4Addr::LOCALHOST), port);
    assert!(client.is_connected());
    client.flush();

    let start = common::wait_for_ui(server.queues(), "RecordingStart", |cmd| {
        matches!(cmd, UiCommand::RecordingStart(_))
    });
    let UiCommand::RecordingStart(info) = start else { unreachable!() };
    assert_eq!(info.path.parent().unwrap(), dir.path().join("MyGame2"));

    client.shutdown(file!(), line!());
    server.shutdown();
}
