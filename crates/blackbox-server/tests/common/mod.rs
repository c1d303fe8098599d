#![allow(dead_code)] // each test binary uses its own subset

use std::time::{Duration, Instant};

use blackbox_protocol::{FRAME_PREFIX_SIZE, Packet, decode_frame};
use blackbox_server::{MessageQueues, Server, TO_UI, UiCommand};

/// Parses a recording file, asserting it is a valid framed stream ending at
/// a packet boundary.
pub fn parse_stream(bytes: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut at = 0usize;
    while at + FRAME_PREFIX_SIZE <= bytes.len() {
        let len = ((bytes[at] as usize) << 8) + bytes[at + 1] as usize;
        assert!(at + len <= bytes.len(), "recording ends mid-frame");
        packets.push(decode_frame(&bytes[at..at + len]).unwrap());
        at += len;
    }
    assert_eq!(at, bytes.len(), "trailing bytes after the last frame");
    packets
}

pub fn wait_for_port(server: &Server) -> u16 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let port = server.discovery_port();
        if port != 0 {
            return port;
        }
        assert!(Instant::now() < deadline, "discovery never bound");
        std::thread::sleep(Duration::from_millis(1));
    }
}

pub fn wait_for_whitelist(server: &Server) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.whitelist().with(std::vec::Vec::is_empty) {
        assert!(Instant::now() < deadline, "whitelist never resolved");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Drains the to-UI queue until a command matches, returning it.
pub fn wait_for_ui<F>(queues: &MessageQueues, what: &str, mut matches: F) -> UiCommand
where
    F: FnMut(&UiCommand) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(command) = queues.consume(TO_UI) {
            if matches(&command) {
                return command;
            }
            continue;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
