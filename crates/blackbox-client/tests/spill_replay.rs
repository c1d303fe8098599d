mod common;

use blackbox_client::{Client, InitConfig, InitFlags, LogLevel};
use blackbox_protocol::PacketKind;

/// Messages logged while disconnected survive in the spill buffer and replay
/// after the registrations, in order, exactly once.
#[test]
fn disconnected_logs_replay_on_connect() {
    let server = common::start();

    let client = Client::new();
    client.set_initial_buffer(1 << 20);
    client.init(InitConfig::new("spill").with_flags(InitFlags::NO_CONNECT));

    for i in 0..10 {
        client.trace_dynamic(
            file!(),
            line!(),
            "boot",
            LogLevel::Log,
            0,
            format_args!("message {i}"),
        );
    }

    client.connect_direct(server.addr, None);
    assert!(client.is_connected());
    client.flush();

    server.accept();
    // AppInfo + FileId + CategoryId + 10 buffered logs
    let packets = server.recv_packets(13);

    assert!(packets[0].kind.is_app_info());
    assert!(matches!(packets[1].kind, PacketKind::FileId(_)));
    assert!(matches!(&packets[2].kind, PacketKind::CategoryId(r) if r.name == "boot"));

    let logs: Vec<&str> = packets[3..]
        .iter()
        .map(|p| match &p.kind {
            PacketKind::LogText(t) => t.text.as_str(),
            other => panic!("unexpected packet after replay: {other:?}"),
        })
        .collect();
    assert_eq!(logs.len(), 10);
    for (i, log) in logs.iter().enumerate() {
        assert_eq!(*log, format!("message {i}\n"));
    }
}

/// Once the spill buffer fills it latches off; the overflowing and later
/// messages are dropped from the replay but logging keeps working.
#[test]
fn full_spill_buffer_latches_and_drops() {
    let server = common::start();

    let client = Client::new();
    // room for roughly two small frames
    client.set_initial_buffer(128);
    client.init(InitConfig::new("tiny").with_flags(InitFlags::NO_CONNECT));

    client.trace_dynamic(file!(), line!(), "boot", LogLevel::Log, 0, format_args!("kept"));
    for i in 0..20 {
        client.trace_dynamic(
            file!(),
            line!(),
            "boot",
            LogLevel::Log,
            0,
            format_args!("dropped {i}"),
        );
    }

    client.connect_direct(server.addr, None);
    client.trace_dynamic(file!(), line!(), "boot", LogLevel::Log, 0, format_args!("live"));
    client.flush();

    server.accept();
    // AppInfo + FileId + CategoryId + the one live log; the latched buffer
    // contributed nothing
    let packets = server.recv_packets(4);
    let logs: Vec<_> = packets
        .iter()
        .filter_map(|p| match &p.kind {
            PacketKind::LogText(t) => Some(t.text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(logs, ["live\n"]);
}
