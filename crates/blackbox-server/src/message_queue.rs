use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use blackbox_protocol::Platform;
use chrono::{DateTime, Utc};
use tracing::warn;

const DYNAMIC_QUEUES: usize = 10;
const QUEUE_LENGTH: usize = 128;

/// Index into the fixed queue table. Queue 0 always feeds the UI; the rest
/// are acquired per recording for console-command back-channels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueId(pub u32);

pub const TO_UI: QueueId = QueueId(0);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordingType {
    Normal,
    ExistingFile,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordingStartInfo {
    pub application_name: String,
    pub filename: String,
    pub path: PathBuf,
    pub file_time: DateTime<Utc>,
    pub open_view: bool,
    pub mq_id: Option<QueueId>,
    pub platform: Platform,
    pub recording_type: RecordingType,
}

/// Commands crossing between the core and the UI collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum UiCommand {
    RecordingStart(Box<RecordingStartInfo>),
    RecordingStop { application_name: String, path: PathBuf },
    DiscoveryStatus(String),
    AddExistingFile(PathBuf),
    AddInvalidExistingFile(PathBuf),
    ConsoleCommand(String),
}

struct Ring {
    refcount: u32,
    entries: VecDeque<UiCommand>,
}

impl Ring {
    fn new(refcount: u32) -> Self {
        Self { refcount, entries: VecDeque::with_capacity(QUEUE_LENGTH) }
    }
}

/// Fixed-slot message queues: single producer, single consumer per queue,
/// short lock around each operation. Enqueue fails when the queue is full so
/// producers can retry rather than block.
pub struct MessageQueues {
    queues: Vec<Mutex<Ring>>,
}

impl Default for MessageQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueues {
    pub fn new() -> Self {
        let mut queues = Vec::with_capacity(1 + DYNAMIC_QUEUES);
        // the to-UI queue is always live
        queues.push(Mutex::new(Ring::new(1)));
        for _ in 0..DYNAMIC_QUEUES {
            queues.push(Mutex::new(Ring::new(0)));
        }
        Self { queues }
    }

    fn ring(&self, id: QueueId) -> Option<std::sync::MutexGuard<'_, Ring>> {
        self.queues
            .get(id.0 as usize)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn enqueue(&self, id: QueueId, command: UiCommand) -> bool {
        let Some(mut ring) = self.ring(id) else {
            return false;
        };
        if ring.entries.len() >= QUEUE_LENGTH {
            warn!(queue = id.0, "message queue full, dropping");
            return false;
        }
        ring.entries.push_back(command);
        true
    }

    pub fn to_ui(&self, command: UiCommand) -> bool {
        self.enqueue(TO_UI, command)
    }

    pub fn consume(&self, id: QueueId) -> Option<UiCommand> {
        self.ring(id)?.entries.pop_front()
    }

    /// Reads without consuming; consumers that might fail to forward the
    /// message call [`consume`] only after success.
    ///
    /// [`consume`]: MessageQueues::consume
    pub fn peek(&self, id: QueueId) -> Option<UiCommand> {
        self.ring(id)?.entries.front().cloned()
    }

    /// Claims a free dynamic queue, or None when all are in use.
    pub fn acquire(&self) -> Option<QueueId> {
        for (i, queue) in self.queues.iter().enumerate().skip(1) {
            let mut ring = queue.lock().unwrap_or_else(PoisonError::into_inner);
            if ring.refcount == 0 {
                ring.refcount = 1;
                ring.entries.clear();
                return Some(QueueId(i as u32));
            }
        }
        None
    }

    pub fn add_ref(&self, id: QueueId) {
        if let Some(mut ring) = self.ring(id) {
            ring.refcount += 1;
        }
    }

    pub fn release(&self, id: QueueId) {
        if id == TO_UI {
            return;
        }
        if let Some(mut ring) = self.ring(id) {
            ring.refcount = ring.refcount.saturating_sub(1);
            if ring.refcount == 0 {
                ring.entries.clear();
            }
        }
    }
}
