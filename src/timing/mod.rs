mod beat_tracker;

pub use beat_tracker::{BeatTracker, DEFAULT_PERIOD, TriggerMessage};
