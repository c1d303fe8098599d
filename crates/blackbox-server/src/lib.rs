mod config;
mod device_codes;
mod discovery_thread;
mod message_queue;
mod recorder;
mod whitelist;

use std::{path::PathBuf, sync::Arc};

pub use config::{AddressFamily, ServerConfig, WhitelistEntryConfig};
pub use device_codes::DeviceCodes;
pub use discovery_thread::{DiscoveryThread, DiscoveryThreadConfig, authorize_request};
pub use message_queue::{
    MessageQueues, QueueId, RecordingStartInfo, RecordingType, TO_UI, UiCommand,
};
pub use recorder::recorder_thread;
pub use whitelist::{
    ResolvedWhitelist, ResolvedWhitelistEntry, SharedWhitelist, WhitelistResolver, find_match,
    resolved_entry,
};

/// The assembled server core: discovery loop, whitelist resolution, device
/// codes, and the UI message queues. The embedding UI drains
/// [`MessageQueues`] for lifecycle events.
pub struct Server {
    queues: Arc<MessageQueues>,
    device_codes: Arc<DeviceCodes>,
    whitelist: SharedWhitelist,
    resolver: WhitelistResolver,
    discovery: DiscoveryThread,
}

impl Server {
    /// Starts the discovery thread and kicks off whitelist resolution.
    /// Recordings land under `base_dir/<application>/`.
    pub fn start(config: &ServerConfig, base_dir: PathBuf, device_codes_path: Option<PathBuf>) -> Self {
        let queues = Arc::new(MessageQueues::new());
        let device_codes = Arc::new(DeviceCodes::new(device_codes_path));
        let whitelist = SharedWhitelist::default();
        let resolver = WhitelistResolver::new(whitelist.clone());
        let _ = resolver.push(config.whitelist.clone());

        let discovery = DiscoveryThread::start(
            DiscoveryThreadConfig {
                port: config.discovery_port,
                address_family: config.address_family,
                base_dir,
            },
            whitelist.clone(),
            Arc::clone(&device_codes),
            Arc::clone(&queues),
        );

        Self { queues, device_codes, whitelist, resolver, discovery }
    }

    pub fn queues(&self) -> &Arc<MessageQueues> {
        &self.queues
    }

    pub fn device_codes(&self) -> &Arc<DeviceCodes> {
        &self.device_codes
    }

    pub fn whitelist(&self) -> &SharedWhitelist {
        &self.whitelist
    }

    /// Re-resolves and republishes the whitelist, e.g. after a config edit.
    pub fn push_whitelist(&self, entries: Vec<WhitelistEntryConfig>) {
        let _ = self.resolver.push(entries);
    }

    /// The bound discovery port; 0 until the bind succeeds.
    pub fn discovery_port(&self) -> u16 {
        self.discovery.port()
    }

    pub fn shutdown(self) {
        self.discovery.shutdown();
    }
}
