//! Beat-synchronized bridge between a real-time MIDI stream and an external
//! control peer.
//!
//! MIDI events enter through [`EventIngress`], are forwarded untouched, and
//! every `P`th note-on raises a [`TriggerMessage`] that the [`ControlChannel`]
//! ships to the peer over OSC/UDP. Suggestions coming back from the peer are
//! applied to the shared [`ParameterStore`] from the host's idle slot.

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod ingress;
pub mod params;
pub mod protocol;
pub mod timing;
pub mod transport;

pub use bridge::{Bridge, HostCallbacks, IdleHandle};
pub use channel::{ChannelConfig, ChannelStatus, ControlChannel, TriggerSender};
pub use config::{BridgeConfig, ConfigWatcher, TransportConfig};
pub use error::{BridgeError, ConfigError, ProtocolError, TransportError};
pub use events::{MidiEvent, RawMidi, TimedEvent};
pub use ingress::{EventIngress, ForwardDecision, MidiOutput};
pub use params::{Mode, ParameterState, ParameterStore};
pub use protocol::{ParameterChange, Suggestion};
pub use timing::{BeatTracker, TriggerMessage};
pub use transport::{Backoff, Transport, UdpTransport};
