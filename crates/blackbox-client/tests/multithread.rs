mod common;

use std::collections::HashSet;
use std::thread;

use blackbox_client::{Client, InitConfig, InitFlags, LogLevel};
use blackbox_protocol::PacketKind;

/// Interleaved logging from several threads: every category registers exactly
/// once, and every log referencing an id appears after that id's
/// registration on the wire.
#[test]
fn registrations_precede_references_across_threads() {
    const THREADS: usize = 3;
    const LOGS_PER_THREAD: usize = 50;
    let categories = ["alpha", "beta", "gamma", "delta"];

    let server = common::start();

    let client = Client::new();
    client.init(InitConfig::new("mt").with_flags(InitFlags::NO_CONNECT));
    client.connect_direct(server.addr, None);
    server.accept();

    thread::scope(|scope| {
        for t in 0..THREADS {
            let client = &client;
            scope.spawn(move || {
                for i in 0..LOGS_PER_THREAD {
                    let category = categories[(t + i) % categories.len()];
                    client.trace_dynamic(
                        file!(),
                        line!(),
                        category,
                        LogLevel::Log,
                        0,
                        format_args!("t{t} i{i}"),
                    );
                }
            });
        }
    });
    client.flush();

    // 1 AppInfo + 1 FileId + 4 CategoryIds + 150 logs
    let packets = server.recv_packets(2 + categories.len() + THREADS * LOGS_PER_THREAD);

    let mut registered = HashSet::new();
    let mut registration_names = Vec::new();
    let mut log_count = 0usize;
    for packet in &packets {
        match &packet.kind {
            PacketKind::CategoryId(r) => {
                assert!(registered.insert(r.id), "category {} registered twice", r.name);
                registration_names.push(r.name.clone());
            }
            PacketKind::LogText(t) => {
                assert!(
                    registered.contains(&t.category_id),
                    "log referenced category {} before its registration",
                    t.category_id
                );
                log_count += 1;
            }
            _ => {}
        }
    }
    assert_eq!(log_count, THREADS * LOGS_PER_THREAD);
    let names: HashSet<_> = registration_names.iter().map(String::as_str).collect();
    assert_eq!(names, categories.iter().copied().collect::<HashSet<_>>());
}

/// Hierarchical categories intern every ancestor, parents first.
#[test]
fn category_parents_register_first() {
    let server = common::start();

    let client = Client::new();
    client.init(InitConfig::new("tree").with_flags(InitFlags::NO_CONNECT));
    client.connect_direct(server.addr, None);
    server.accept();

    client.trace_dynamic(
        file!(),
        line!(),
        "net::http::client",
        LogLevel::Log,
        0,
        format_args!("request"),
    );
    client.flush();

    // AppInfo + FileId + 3 CategoryIds + LogText
    let packets = server.recv_packets(6);
    let categories: Vec<_> = packets
        .iter()
        .filter_map(|p| match &p.kind {
            PacketKind::CategoryId(r) => Some((r.id, r.name.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        categories,
        vec![
            (1, "net".to_string()),
            (2, "net::http".to_string()),
            (3, "net::http::client".to_string()),
        ]
    );
}
