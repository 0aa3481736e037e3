use crate::clock::{SharedClock, unix_millis};
use std::sync::Mutex;
use thiserror::Error;

/// 2013-01-01 minus leap days, kept for compatibility with already issued IDs.
pub const FLAKE_EPOCH_MS: u64 = 1_356_048_000_000;
pub const MAX_NODE_ID: u64 = (1 << NODE_BITS) - 1;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << 41) - 1;
const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlakeError {
    #[error("node id {0} out of range (0..=1023)")]
    NodeOutOfRange(u64),
}

pub struct Flake {
    node_id: u64,
    clock: SharedClock,
    state: Mutex<FlakeState>,
}

#[derive(Debug, Default)]
struct FlakeState {
    last_ms: u64,
    sequence: u64,
}

impl Flake {
    pub fn new(node_id: u64, clock: SharedClock) -> Result<Self, FlakeError> {
        if node_id > MAX_NODE_ID {
            return Err(FlakeError::NodeOutOfRange(node_id));
        }
        Ok(Self {
            node_id,
            clock,
            state: Mutex::new(FlakeState::default()),
        })
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn generate(&self) -> i64 {
        let now_ms = unix_millis(self.clock.now()).saturating_sub(FLAKE_EPOCH_MS);
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        if now_ms > state.last_ms {
            state.last_ms = now_ms;
            state.sequence = 0;
        } else {
            // Same millisecond or a clock step backwards: keep counting from the
            // logical timestamp, borrowing the next millisecond on overflow.
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                state.last_ms += 1;
            }
        }
        let timestamp = state.last_ms & TIMESTAMP_MASK;
        ((timestamp << TIMESTAMP_SHIFT) | (self.node_id << NODE_SHIFT) | state.sequence) as i64
    }
}
