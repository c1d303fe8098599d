use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
    thread::JoinHandle,
};

use blackbox_net::{
    Connection,
    discovery::{DiscoveryServer, PendingConnection, ResponseKind},
};
use blackbox_protocol::{DiscoveryPacketType, DiscoveryRequest, PROTOCOL_VERSION};
use blackbox_timing::Duration;
use blackbox_utils::spawn_named;
use tracing::{debug, error, warn};

use crate::{
    config::AddressFamily,
    device_codes::DeviceCodes,
    message_queue::{MessageQueues, UiCommand},
    recorder::recorder_thread,
    whitelist::{SharedWhitelist, find_match},
};

const MAX_LIVE_RECORDERS: usize = 64;
const BIND_RETRY: std::time::Duration = std::time::Duration::from_secs(1);

/// Decides how (and whether) to answer a discovery request: whitelist first
/// with first-match-wins, then the device-code list as a fallback
/// authorization path. `None` means drop silently.
pub fn authorize_request(
    whitelist: &SharedWhitelist,
    device_codes: &DeviceCodes,
    ty: DiscoveryPacketType,
    request: &DiscoveryRequest,
    from: SocketAddr,
) -> Option<(ResponseKind, Duration)> {
    if request.protocol_version != PROTOCOL_VERSION {
        debug!(%from, version = request.protocol_version, "wrong protocol version");
        return None;
    }

    let verdict = whitelist.with(|whitelist| {
        find_match(whitelist, from, request).map(|entry| (entry.allow, entry.delay))
    });
    if let Some((true, delay)) = verdict {
        if ty.is_request_discovery() {
            return Some((ResponseKind::AnnouncePresence, delay));
        }
        if ty.is_request_reservation() {
            return Some((ResponseKind::ReservationAccept, Duration::ZERO));
        }
        return None;
    }

    // a deny entry blocks the whitelist path but not a matching device code
    if device_codes.contains(&request.device_code) {
        match ty {
            DiscoveryPacketType::RequestDiscovery => {
                return Some((ResponseKind::AnnouncePresence, Duration::ZERO));
            }
            DiscoveryPacketType::RequestReservation => {
                return Some((ResponseKind::ReservationAccept, Duration::ZERO));
            }
            _ => {}
        }
    }
    None
}

pub struct DiscoveryThreadConfig {
    pub port: u16,
    pub address_family: AddressFamily,
    pub base_dir: PathBuf,
}

/// Owns the discovery socket loop and spawns one recorder per reserved
/// connection.
pub struct DiscoveryThread {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    bound_port: Arc<AtomicU16>,
}

impl DiscoveryThread {
    pub fn start(
        config: DiscoveryThreadConfig,
        whitelist: SharedWhitelist,
        device_codes: Arc<DeviceCodes>,
        queues: Arc<MessageQueues>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let bound_port = Arc::new(AtomicU16::new(0));

        let thread_shutdown = Arc::clone(&shutdown);
        let thread_port = Arc::clone(&bound_port);
        let handle = spawn_named("discovery", move || {
            run(&config, &whitelist, &device_codes, &queues, &thread_shutdown, &thread_port);
        });

        Self { handle: Some(handle), shutdown, bound_port }
    }

    /// The actual discovery port once bound; 0 while still retrying.
    pub fn port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    config: &DiscoveryThreadConfig,
    whitelist: &SharedWhitelist,
    device_codes: &Arc<DeviceCodes>,
    queues: &Arc<MessageQueues>,
    shutdown: &Arc<AtomicBool>,
    bound_port: &Arc<AtomicU16>,
) {
    queues.to_ui(UiCommand::DiscoveryStatus("Starting".into()));

    let mut server = None;
    while !shutdown.load(Ordering::Relaxed) {
        match DiscoveryServer::bind(
            config.port,
            config.address_family.wants_v4(),
            config.address_family.wants_v6(),
        ) {
            Ok(bound) => {
                bound_port.store(bound.port(), Ordering::Release);
                server = Some(bound);
                break;
            }
            Err(err) => {
                warn!(?err, port = config.port, "discovery bind failed");
                queues.to_ui(UiCommand::DiscoveryStatus("Retrying".into()));
                std::thread::sleep(BIND_RETRY);
            }
        }
    }
    let Some(mut server) = server else {
        return;
    };

    queues.to_ui(UiCommand::DiscoveryStatus("Running".into()));
    let mut recorders: Vec<JoinHandle<()>> = Vec::new();

    while !shutdown.load(Ordering::Relaxed) {
        server.tick_responses();

        if let Some((ty, request, from)) = server.recv_request() {
            let decision = authorize_request(whitelist, device_codes, ty, &request, from);
            debug!(
                ?ty,
                %from,
                application = %request.application_name,
                ?decision,
                "discovery request"
            );
            if let Some((response, delay)) = decision {
                server.process_request(from, &request, response, delay);
            }
        }

        for pending in server.take_pending() {
            recorders.retain(|handle| !handle.is_finished());
            if recorders.len() >= MAX_LIVE_RECORDERS {
                error!("no free connections to start listening for client connection");
                continue;
            }
            spawn_recorder(pending, &config.base_dir, shutdown, queues, &mut recorders);
        }
    }

    queues.to_ui(UiCommand::DiscoveryStatus("Shutting down".into()));
    for handle in recorders {
        let _ = handle.join();
    }
}

fn spawn_recorder(
    pending: PendingConnection,
    base_dir: &std::path::Path,
    shutdown: &Arc<AtomicBool>,
    queues: &Arc<MessageQueues>,
    recorders: &mut Vec<JoinHandle<()>>,
) {
    let conn = Connection::new();
    if !conn.adopt_listener(pending.listener) {
        error!(port = pending.port, "failed to start listening for client connection");
        return;
    }
    debug!(port = pending.port, app = %pending.application_name, "recorder starting");

    let base_dir = base_dir.to_path_buf();
    let shutdown = Arc::clone(shutdown);
    let queues = Arc::clone(queues);
    let name = format!("recorder-{}", pending.port);
    recorders.push(spawn_named(&name, move || {
        recorder_thread(&conn, &pending.application_name, &base_dir, &shutdown, &queues);
    }));
}
