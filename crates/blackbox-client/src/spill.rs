use tracing::debug;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpillState {
    Unset,
    Set,
    Done,
}

/// Pre-connection spill area. Holds whole length-prefixed frames; once full
/// it latches to `Done` and stops recording for the life of the process.
pub struct SpillBuffer {
    state: SpillState,
    data: Vec<u8>,
    capacity: usize,
}

impl Default for SpillBuffer {
    fn default() -> Self {
        Self { state: SpillState::Unset, data: Vec::new(), capacity: 0 }
    }
}

impl SpillBuffer {
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity > 0 {
            self.capacity = capacity;
            self.data = Vec::with_capacity(capacity.min(64 * 1024));
            self.state = SpillState::Set;
        } else {
            self.state = SpillState::Done;
        }
    }

    #[inline]
    pub fn active(&self) -> bool {
        self.state == SpillState::Set
    }

    pub fn record(&mut self, frames: &[u8]) {
        if self.state != SpillState::Set {
            return;
        }
        if self.data.len() + frames.len() <= self.capacity {
            self.data.extend_from_slice(frames);
        } else {
            debug!(capacity = self.capacity, "filled initial buffer - discarding");
            self.data = Vec::new();
            self.capacity = 0;
            self.state = SpillState::Done;
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}
