use std::num::NonZeroU32;
use std::sync::Arc;

use crate::params::{Mode, ParameterStore};

pub const DEFAULT_PERIOD: NonZeroU32 = NonZeroU32::new(16).unwrap();

/// Sent to the peer every `period` note-ons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMessage {
    /// Note-ons counted since the last reset, including this one.
    pub beat_count: u64,
    /// Host timestamp of the note-on that crossed the threshold.
    pub timestamp: u64,
    pub mode: Mode,
    pub intensity: u8,
}

/// Counts note-ons and raises a trigger every `period` of them.
///
/// The gating parameters (sync and mode) are read from the store at the
/// moment of each increment, never cached, so enabling sync mid-stream takes
/// effect on the very next threshold.
#[derive(Debug)]
pub struct BeatTracker {
    counter: u64,
    period: NonZeroU32,
    params: Arc<ParameterStore>,
}

impl BeatTracker {
    pub fn new(params: Arc<ParameterStore>, period: NonZeroU32) -> Self {
        Self {
            counter: 0,
            period,
            params,
        }
    }

    pub fn on_note_on(&mut self, timestamp: u64) -> Option<TriggerMessage> {
        self.counter = self.counter.wrapping_add(1);

        if self.counter % self.period.get() as u64 != 0 || !self.params.triggers_enabled() {
            return None;
        }

        Some(TriggerMessage {
            beat_count: self.counter,
            timestamp,
            mode: self.params.mode(),
            intensity: self.params.intensity(),
        })
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }

    pub fn count(&self) -> u64 {
        self.counter
    }

    pub fn period(&self) -> NonZeroU32 {
        self.period
    }

    pub fn set_period(&mut self, period: NonZeroU32) {
        self.period = period;
    }
}
