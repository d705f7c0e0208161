use crate::channel::TriggerSender;
use crate::events::TimedEvent;
use crate::timing::BeatTracker;

/// Destination for forwarded events: the host's MIDI output.
pub trait MidiOutput {
    fn send(&mut self, event: &TimedEvent);
}

impl MidiOutput for Vec<TimedEvent> {
    fn send(&mut self, event: &TimedEvent) {
        self.push(event.clone());
    }
}

/// What happened to an event besides being forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDecision {
    Forwarded,
    /// The event crossed a beat threshold and a trigger was queued.
    Triggered { beat_count: u64 },
    /// A trigger was due but the outbound queue was full.
    TriggerDropped { beat_count: u64 },
}

/// Real-time entry point for host MIDI.
///
/// Everything here runs inside the host's callback: no locks, no I/O, no
/// logging, no allocation beyond what the output itself does.
pub struct EventIngress {
    tracker: BeatTracker,
    triggers: TriggerSender,
    blocks_processed: u64,
    last_block_time: u64,
}

impl EventIngress {
    pub fn new(tracker: BeatTracker, triggers: TriggerSender) -> Self {
        Self {
            tracker,
            triggers,
            blocks_processed: 0,
            last_block_time: 0,
        }
    }

    pub fn on_event<O>(&mut self, event: TimedEvent, output: &mut O) -> ForwardDecision
    where
        O: MidiOutput + ?Sized,
    {
        // Forward first: the host expects its output before anything else.
        output.send(&event);

        if !event.event.starts_note() {
            return ForwardDecision::Forwarded;
        }

        match self.tracker.on_note_on(event.timestamp) {
            Some(trigger) => {
                let beat_count = trigger.beat_count;
                if self.triggers.try_send_trigger(trigger) {
                    ForwardDecision::Triggered { beat_count }
                } else {
                    ForwardDecision::TriggerDropped { beat_count }
                }
            }
            None => ForwardDecision::Forwarded,
        }
    }

    /// Per-block host callback.
    pub fn process_block(&mut self, block_time: u64) {
        self.blocks_processed = self.blocks_processed.wrapping_add(1);
        self.last_block_time = block_time;
    }

    pub fn reset(&mut self) {
        self.tracker.reset();
    }

    pub fn tracker(&self) -> &BeatTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut BeatTracker {
        &mut self.tracker
    }

    pub fn triggers(&self) -> &TriggerSender {
        &self.triggers
    }

    pub fn blocks_processed(&self) -> u64 {
        self.blocks_processed
    }

    pub fn last_block_time(&self) -> u64 {
        self.last_block_time
    }
}
