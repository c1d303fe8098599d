mod common;

use std::{net::Ipv4Addr, thread, time::Duration};

use blackbox_client::{Client, InitConfig, InitFlags, LogLevel};
use blackbox_server::{AddressFamily, Server, ServerConfig, UiCommand, WhitelistEntryConfig};

/// Shutting down mid-burst from several producer threads must still leave a
/// recording that parses frame-by-frame to the end.
#[test]
fn shutdown_under_load_leaves_a_valid_recording() {
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
    client.init(InitConfig::new("burst").with_flags(InitFlags::NO_CONNECT));
    client.connect(Some(Ipv4Addr::LOCALHOST), port);
    assert!(client.is_connected());
    client.flush();

    let start = common::wait_for_ui(server.queues(), "RecordingStart", |cmd| {
        matches!(cmd, UiCommand::RecordingStart(_))
    });
    let UiCommand::RecordingStart(info) = start else { unreachable!() };

    thread::scope(|scope| {
        for t in 0..3 {
            let client = &client;
            scope.spawn(move || {
                for i in 0..400u32 {
                    client.trace_dynamic(
                        file!(),
                        line!(),
                        "load",
                        LogLevel::Log,
                        0,
                        format_args!("thread {t} message {i}"),
                    );
                    if i % 16 == 0 {
                        thread::sleep(Duration::from_micros(200));
                    }
                }
            });
        }
        // cut the session while producers are mid-burst
        thread::sleep(Duration::from_millis(10));
        client.shutdown(file!(), line!());
    });

    common::wait_for_ui(server.queues(), "RecordingStop", |cmd| {
        matches!(cmd, UiCommand::RecordingStop { .. })
    });

    let bytes = std::fs::read(&info.path).unwrap();
    // parse_stream asserts no frame is cut short
    let packets = common::parse_stream(&bytes);
    assert!(packets[0].kind.is_app_info());
    assert!(packets.iter().any(|p| p.kind.is_log_text()));

    server.shutdown();
}
