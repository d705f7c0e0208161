use arc_swap::ArcSwap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, ChannelStatus, ControlChannel};
use crate::config::{BridgeConfig, TransportConfig};
use crate::error::BridgeError;
use crate::events::TimedEvent;
use crate::ingress::{EventIngress, ForwardDecision, MidiOutput};
use crate::params::{PARAM_MODE, ParameterStore};
use crate::timing::BeatTracker;
use crate::transport::{Transport, UdpTransport};

/// The callback surface a host drives the bridge through.
pub trait HostCallbacks {
    /// One MIDI event; must forward it before returning.
    fn handle_midi(&mut self, event: TimedEvent, output: &mut dyn MidiOutput) -> ForwardDecision;

    /// Once per processing block.
    fn process_midi(&mut self, block_time: u64);

    fn parameter_changed(&mut self, index: usize, value: f64);

    /// Opportunistic background slot; never called from the real-time path.
    fn idle(&mut self);

    fn reset(&mut self);
}

/// The complete component: real-time ingress plus the idle-side handle.
///
/// A host that calls every callback from one thread can use the bridge as is.
/// A host with separate real-time and background threads should call
/// [`Bridge::into_parts`] and move each half to its own thread.
pub struct Bridge {
    ingress: EventIngress,
    idle: IdleHandle,
}

impl Bridge {
    /// Builds a bridge talking OSC over UDP to the configured peer.
    pub fn new(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let transport_config = Arc::new(ArcSwap::from_pointee(config.transport.clone()));
        let transport = UdpTransport::new(transport_config.clone());
        Self::assemble(config, Box::new(transport), transport_config)
    }

    pub fn with_transport(
        config: &BridgeConfig,
        transport: Box<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        let transport_config = Arc::new(ArcSwap::from_pointee(config.transport.clone()));
        Self::assemble(config, transport, transport_config)
    }

    fn assemble(
        config: &BridgeConfig,
        transport: Box<dyn Transport>,
        transport_config: Arc<ArcSwap<TransportConfig>>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let params = Arc::new(ParameterStore::new(config.parameters));
        let (sender, channel) = ControlChannel::spawn(ChannelConfig::from(config), transport)?;
        let tracker = BeatTracker::new(params.clone(), config.beat_period());

        info!(
            period = config.beat_period,
            peer = %config.transport.peer_addr,
            listen = %config.transport.listen_addr,
            mode = %params.mode(),
            "bridge ready"
        );

        Ok(Self {
            ingress: EventIngress::new(tracker, sender),
            idle: IdleHandle {
                params,
                channel,
                transport_config,
                was_connected: false,
            },
        })
    }

    pub fn params(&self) -> &Arc<ParameterStore> {
        &self.idle.params
    }

    pub fn ingress(&self) -> &EventIngress {
        &self.ingress
    }

    /// Changes the number of note-ons between triggers. The running count is
    /// kept, so the next trigger fires at the next multiple of `period`.
    pub fn set_beat_period(&mut self, period: NonZeroU32) {
        self.ingress.tracker_mut().set_period(period);
    }

    pub fn status(&self) -> ChannelStatus {
        self.idle.channel.status()
    }

    pub fn into_parts(self) -> (EventIngress, IdleHandle) {
        (self.ingress, self.idle)
    }
}

impl HostCallbacks for Bridge {
    fn handle_midi(&mut self, event: TimedEvent, output: &mut dyn MidiOutput) -> ForwardDecision {
        self.ingress.on_event(event, output)
    }

    fn process_midi(&mut self, block_time: u64) {
        self.ingress.process_block(block_time);
    }

    fn parameter_changed(&mut self, index: usize, value: f64) {
        let params = &self.idle.params;
        if !params.parameter_changed(index, value) {
            debug!(index, value, "ignoring invalid parameter change");
        } else if index == PARAM_MODE {
            debug!(mode = %params.mode(), "mode changed by host");
        } else {
            debug!(index, value, state = ?params.snapshot(), "parameter changed by host");
        }
    }

    fn idle(&mut self) {
        self.idle.idle();
    }

    fn reset(&mut self) {
        self.ingress.reset();
    }
}

/// Background-side half of the bridge.
pub struct IdleHandle {
    params: Arc<ParameterStore>,
    channel: ControlChannel,
    transport_config: Arc<ArcSwap<TransportConfig>>,
    was_connected: bool,
}

impl IdleHandle {
    /// Applies every suggestion received since the last call and reports
    /// connectivity changes. Returns the number of suggestions applied.
    pub fn idle(&mut self) -> usize {
        let connected = self.channel.is_connected();
        if connected != self.was_connected {
            if connected {
                info!("peer link up");
            } else {
                warn!("peer link down, triggers will queue until it recovers");
            }
            self.was_connected = connected;
        }

        let suggestions = self.channel.poll_suggestions();
        for suggestion in &suggestions {
            self.params.apply_suggestion(suggestion);
            info!(
                kind = %suggestion.kind,
                changes = ?suggestion.changes,
                "applied suggestion from peer"
            );
        }
        if !suggestions.is_empty() {
            debug!(state = ?self.params.snapshot(), "parameters after suggestions");
        }
        suggestions.len()
    }

    pub fn params(&self) -> &Arc<ParameterStore> {
        &self.params
    }

    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    /// Shared transport settings; storing a new value retargets the peer.
    pub fn transport_config(&self) -> &Arc<ArcSwap<TransportConfig>> {
        &self.transport_config
    }

    pub fn status(&self) -> ChannelStatus {
        self.channel.status()
    }

    /// Stops the channel without waiting for it.
    pub fn shutdown(&self) {
        self.channel.shutdown();
    }
}
