/// A MIDI event paired with the host time it arrived at, in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub timestamp: u64,
    pub event: MidiEvent,
}

impl TimedEvent {
    pub fn new(timestamp: u64, event: MidiEvent) -> Self {
        Self { timestamp, event }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiEvent {
    /// A note-on as it appeared on the wire. Velocity 0 is kept as-is; it only
    /// means "note off" to consumers that care (see [`MidiEvent::starts_note`]).
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8, velocity: u8 },
    /// Anything else, including messages that failed to parse.
    Other { raw: RawMidi },
}

impl MidiEvent {
    /// Classifies raw wire bytes. Never fails: malformed input is kept
    /// verbatim in `Other` so it can still be forwarded.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if let &[status, pitch, velocity] = bytes {
            if pitch < 0x80 && velocity < 0x80 {
                let channel = status & 0x0F;
                match status & 0xF0 {
                    0x90 => {
                        return MidiEvent::NoteOn {
                            channel,
                            pitch,
                            velocity,
                        };
                    }
                    0x80 => {
                        return MidiEvent::NoteOff {
                            channel,
                            pitch,
                            velocity,
                        };
                    }
                    _ => {}
                }
            }
        }

        MidiEvent::Other {
            raw: RawMidi::new(bytes),
        }
    }

    /// True for a note-on that actually starts a note (velocity > 0).
    pub fn starts_note(&self) -> bool {
        matches!(self, MidiEvent::NoteOn { velocity, .. } if *velocity > 0)
    }

    /// Calls `f` with the wire bytes of this event without allocating.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            MidiEvent::NoteOn {
                channel,
                pitch,
                velocity,
            } => f(&[0x90 | (channel & 0x0F), *pitch, *velocity]),
            MidiEvent::NoteOff {
                channel,
                pitch,
                velocity,
            } => f(&[0x80 | (channel & 0x0F), *pitch, *velocity]),
            MidiEvent::Other { raw } => f(raw.as_bytes()),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(|bytes| bytes.to_vec())
    }
}

/// Raw message storage. Short messages (the vast majority: CC, pitch bend,
/// clock) live inline so classifying them never touches the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMidi {
    Short { bytes: [u8; 3], len: u8 },
    Long(Box<[u8]>),
}

impl RawMidi {
    pub fn new(bytes: &[u8]) -> Self {
        if bytes.len() <= 3 {
            let mut inline = [0u8; 3];
            inline[..bytes.len()].copy_from_slice(bytes);
            RawMidi::Short {
                bytes: inline,
                len: bytes.len() as u8,
            }
        } else {
            RawMidi::Long(bytes.into())
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            RawMidi::Short { bytes, len } => &bytes[..*len as usize],
            RawMidi::Long(bytes) => bytes,
        }
    }
}
