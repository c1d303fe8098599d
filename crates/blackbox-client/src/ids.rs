use blackbox_protocol::{Packet, PacketHeader};

/// One interned name. The registration header is retained so the exact
/// packet can be replayed to any sink that attaches later.
pub struct IdRecord {
    pub header: PacketHeader,
    pub id: u32,
    pub name: String,
}

/// Monotonic id table; ids start at 1 and never rebind.
#[derive(Default)]
pub struct IdTable {
    pub records: Vec<IdRecord>,
    last_id: u32,
}

impl IdTable {
    pub fn find(&self, name: &str) -> Option<u32> {
        self.records.iter().find(|r| r.name.eq_ignore_ascii_case(name)).map(|r| r.id)
    }

    /// The id the next insert will take; registrations reference their own
    /// id in the packet header before the insert happens.
    pub fn peek_next_id(&self) -> u32 {
        self.last_id + 1
    }

    /// Allocates the next id and retains the registration. The caller emits
    /// the registration packet under the same lock.
    pub fn insert(&mut self, name: &str, header: PacketHeader) -> u32 {
        self.last_id += 1;
        self.records.push(IdRecord { header, id: self.last_id, name: name.to_string() });
        self.last_id
    }
}

/// Everything guarded by the id lock: interned tables, retained thread
/// packets, the app-info snapshot, and which sinks already saw it.
#[derive(Default)]
pub struct IdState {
    pub path_ids: IdTable,
    pub category_ids: IdTable,
    pub thread_packets: Vec<Packet>,
    pub initial_app_info: Option<Packet>,
    pub callback_sent_app_info: bool,
    pub file_sent_app_info: bool,
    pub store_thread_packets: bool,
}

impl IdState {
    pub fn new() -> Self {
        Self { store_thread_packets: true, ..Self::default() }
    }
}
