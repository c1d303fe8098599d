use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use blackbox_net::Connection;
use blackbox_protocol::{InitFlags, Packet, PacketHeader, PacketKind, Platform, Text};
use blackbox_timing::{Duration, Instant};
use blackbox_utils::sanitize_app_filename;
use chrono::Utc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::message_queue::{
    MessageQueues, QueueId, RecordingStartInfo, RecordingType, UiCommand,
};

const DIRTY_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

fn recording_uuid() -> Uuid {
    let node_id: [u8; 6] = rand::random();
    Uuid::new_v1(uuid::Timestamp::now(uuid::NoContext), &node_id)
}

fn recording_path(base_dir: &Path, sanitized: &str) -> PathBuf {
    let uuid = recording_uuid();
    base_dir.join(sanitized).join(format!("{}{sanitized}.bbox", uuid.braced()))
}

/// Drains one accepted client into one `.bbox` file until the peer goes away
/// or the shared shutdown flag trips. Bytes hit the file exactly as they
/// were framed on the wire.
pub fn recorder_thread(
    conn: &Connection,
    application_name: &str,
    base_dir: &Path,
    shutdown: &Arc<AtomicBool>,
    queues: &Arc<MessageQueues>,
) {
    let sanitized = sanitize_app_filename(application_name);
    let dir = base_dir.join(&sanitized);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        error!(?err, dir = %dir.display(), "couldn't create recording directory");
        return;
    }
    let path = recording_path(base_dir, &sanitized);
    debug!(path = %path.display(), "recorder opening");
    let file = match File::create(&path) {
        Ok(file) => file,
        Err(err) => {
            error!(?err, path = %path.display(), "couldn't open recording file");
            return;
        }
    };
    let mut file = BufWriter::new(file);

    let mut info = RecordingStartInfo {
        application_name: application_name.to_string(),
        filename: path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default(),
        path: path.clone(),
        file_time: Utc::now(),
        open_view: false,
        mq_id: None,
        platform: Platform::Unknown,
        recording_type: RecordingType::Normal,
    };
    let mut sent_recording_start = false;
    let mut dirty = false;
    let mut last_flush = Instant::now();
    let mut raw = Vec::with_capacity(4096);

    while !shutdown.load(Ordering::Relaxed) {
        if conn.is_connected() {
            forward_console_commands(conn, queues, info.mq_id);
            conn.tick();
            loop {
                raw.clear();
                match conn.decode_packet_raw(&mut raw) {
                    Ok(Some(packet)) => {
                        if let Err(err) = file.write_all(&raw) {
                            warn!(?err, "recording write failed");
                        }
                        if packet.kind.is_app_info() {
                            let _ = file.flush();
                            last_flush = Instant::now();
                            if !sent_recording_start {
                                sent_recording_start = true;
                                publish_recording_start(queues, &mut info, &packet);
                            }
                        } else {
                            dirty = true;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        // past this point the stream cannot be re-framed
                        error!(?err, "malformed frame in recording stream");
                        conn.disconnect_no_flush();
                        break;
                    }
                }
            }
            if dirty && last_flush.elapsed() > DIRTY_FLUSH_INTERVAL {
                let _ = file.flush();
                last_flush = Instant::now();
                dirty = false;
            }
        } else if conn.is_listening() {
            conn.tick_listening();
        } else if conn.is_connecting() {
            conn.tick_connecting();
        } else {
            break;
        }
    }

    // the peer may have closed with complete frames still buffered
    loop {
        raw.clear();
        match conn.decode_packet_raw(&mut raw) {
            Ok(Some(_)) => {
                if let Err(err) = file.write_all(&raw) {
                    warn!(?err, "recording write failed");
                }
            }
            _ => break,
        }
    }

    let _ = file.flush();
    drop(file);
    if !sent_recording_start {
        queues.to_ui(UiCommand::RecordingStart(Box::new(info.clone())));
    }
    queues.to_ui(UiCommand::RecordingStop {
        application_name: application_name.to_string(),
        path,
    });
    if let Some(mq_id) = info.mq_id {
        queues.release(mq_id);
    }
    conn.disconnect();
}

fn publish_recording_start(
    queues: &Arc<MessageQueues>,
    info: &mut RecordingStartInfo,
    packet: &Packet,
) {
    if let PacketKind::AppInfo(app_info) = &packet.kind {
        let flags = InitFlags::from_bits_truncate(app_info.init_flags);
        info.open_view = !flags.contains(InitFlags::NO_OPEN_VIEW);
        if flags.contains(InitFlags::CONSOLE_COMMANDS) {
            info.mq_id = queues.acquire();
        }
        info.platform = Platform::from_u32(app_info.platform);
    }
    queues.to_ui(UiCommand::RecordingStart(Box::new(info.clone())));
}

/// One queued console command per pass; unconsumable entries are dropped so
/// the queue cannot wedge.
fn forward_console_commands(
    conn: &Connection,
    queues: &Arc<MessageQueues>,
    mq_id: Option<QueueId>,
) {
    let Some(mq_id) = mq_id else {
        return;
    };
    let Some(command) = queues.peek(mq_id) else {
        return;
    };
    match command {
        UiCommand::ConsoleCommand(text) => {
            let packet =
                Packet::new(PacketHeader::default(), PacketKind::ConsoleCommand(Text::new(text)));
            if conn.try_send(&packet) {
                queues.consume(mq_id);
            }
        }
        _ => {
            queues.consume(mq_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_filename_is_braced_uuid_plus_app() {
        let path = recording_path(Path::new("/tmp/bb"), "demo");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with('{'));
        let close = name.find('}').unwrap();
        assert_eq!(&name[close + 1..], "demo.bbox");
        let uuid: Uuid = name[1..close].parse().unwrap();
        assert_eq!(uuid.get_version_num(), 1);
        assert_eq!(path.parent().unwrap(), Path::new("/tmp/bb/demo"));
    }
}
