//! OSC wire format between the bridge and the external peer.
//!
//! One OSC packet per UDP datagram. The bridge sends
//!
//! ```text
//! /beatbridge/trigger  beat_count:Long  timestamp:Long  mode:String  intensity:Int
//! ```
//!
//! and accepts
//!
//! ```text
//! /beatbridge/suggest  kind:String  (name:String value)*
//! ```
//!
//! where `name` is `mode`, `intensity`, `intensity_delta` or `sync`. Bundles
//! are flattened, so a peer may batch several suggestions in one datagram.

use rosc::{OscMessage, OscPacket, OscType};

use crate::error::ProtocolError;
use crate::params::Mode;
use crate::timing::TriggerMessage;

pub const TRIGGER_ADDR: &str = "/beatbridge/trigger";
pub const SUGGEST_ADDR: &str = "/beatbridge/suggest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterChange {
    Mode(Mode),
    /// Absolute intensity, clamped on apply.
    Intensity(i64),
    IntensityDelta(i64),
    Sync(bool),
}

/// A parameter change proposed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suggestion {
    pub kind: String,
    pub changes: Vec<ParameterChange>,
}

pub fn encode_trigger(trigger: &TriggerMessage) -> Result<Vec<u8>, ProtocolError> {
    let packet = OscPacket::Message(OscMessage {
        addr: TRIGGER_ADDR.to_string(),
        args: vec![
            OscType::Long(trigger.beat_count as i64),
            OscType::Long(trigger.timestamp as i64),
            OscType::String(trigger.mode.name().to_string()),
            OscType::Int(trigger.intensity as i32),
        ],
    });
    rosc::encoder::encode(&packet).map_err(ProtocolError::Encode)
}

/// Inverse of [`encode_trigger`]. The bridge never receives triggers; the
/// peer side (and the tests) do.
pub fn decode_trigger(bytes: &[u8]) -> Result<TriggerMessage, ProtocolError> {
    let (_, packet) = rosc::decoder::decode_udp(bytes).map_err(ProtocolError::Decode)?;
    let msg = match packet {
        OscPacket::Message(msg) => msg,
        OscPacket::Bundle(_) => {
            return Err(ProtocolError::BadArgument("trigger sent as a bundle".into()));
        }
    };
    if msg.addr != TRIGGER_ADDR {
        return Err(ProtocolError::UnknownAddress(msg.addr));
    }
    match msg.args.as_slice() {
        [
            OscType::Long(beat_count),
            OscType::Long(timestamp),
            OscType::String(mode),
            OscType::Int(intensity),
        ] => Ok(TriggerMessage {
            beat_count: *beat_count as u64,
            timestamp: *timestamp as u64,
            mode: mode
                .parse()
                .map_err(|e| ProtocolError::BadArgument(format!("{e}")))?,
            intensity: (*intensity).clamp(0, u8::MAX as i32) as u8,
        }),
        other => Err(ProtocolError::BadArgument(format!(
            "unexpected trigger arguments {other:?}"
        ))),
    }
}

/// Decodes one datagram into the suggestions it carries.
pub fn decode_suggestions(bytes: &[u8]) -> Result<Vec<Suggestion>, ProtocolError> {
    let (_, packet) = rosc::decoder::decode_udp(bytes).map_err(ProtocolError::Decode)?;
    let mut suggestions = Vec::new();
    collect_suggestions(packet, &mut suggestions)?;
    Ok(suggestions)
}

fn collect_suggestions(packet: OscPacket, out: &mut Vec<Suggestion>) -> Result<(), ProtocolError> {
    match packet {
        OscPacket::Message(msg) => {
            out.push(parse_suggestion(msg)?);
            Ok(())
        }
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                collect_suggestions(inner, out)?;
            }
            Ok(())
        }
    }
}

fn parse_suggestion(msg: OscMessage) -> Result<Suggestion, ProtocolError> {
    if msg.addr != SUGGEST_ADDR {
        return Err(ProtocolError::UnknownAddress(msg.addr));
    }

    let mut args = msg.args.into_iter();
    let kind = match args.next() {
        Some(OscType::String(kind)) => kind,
        other => {
            return Err(ProtocolError::BadArgument(format!(
                "expected suggestion kind, got {other:?}"
            )));
        }
    };

    let mut changes = Vec::new();
    while let Some(name) = args.next() {
        let OscType::String(name) = name else {
            return Err(ProtocolError::BadArgument(format!(
                "expected parameter name, got {name:?}"
            )));
        };
        let value = args
            .next()
            .ok_or_else(|| ProtocolError::BadArgument(format!("'{name}' has no value")))?;
        changes.push(parse_change(&name, value)?);
    }

    Ok(Suggestion { kind, changes })
}

fn parse_change(name: &str, value: OscType) -> Result<ParameterChange, ProtocolError> {
    let bad = |value: &OscType| ProtocolError::BadArgument(format!("'{name}' = {value:?}"));
    match name {
        "mode" => match &value {
            OscType::String(s) => s.parse().map(ParameterChange::Mode).map_err(|_| bad(&value)),
            _ => as_integer(&value)
                .and_then(Mode::from_index)
                .map(ParameterChange::Mode)
                .ok_or_else(|| bad(&value)),
        },
        "intensity" => as_integer(&value)
            .map(ParameterChange::Intensity)
            .ok_or_else(|| bad(&value)),
        "intensity_delta" => as_integer(&value)
            .map(ParameterChange::IntensityDelta)
            .ok_or_else(|| bad(&value)),
        "sync" => match value {
            OscType::Bool(b) => Ok(ParameterChange::Sync(b)),
            OscType::Float(f) => Ok(ParameterChange::Sync(f >= 0.5)),
            OscType::Double(f) => Ok(ParameterChange::Sync(f >= 0.5)),
            OscType::Int(i) => Ok(ParameterChange::Sync(i != 0)),
            OscType::Long(i) => Ok(ParameterChange::Sync(i != 0)),
            other => Err(bad(&other)),
        },
        _ => Err(ProtocolError::BadArgument(format!(
            "unknown parameter '{name}'"
        ))),
    }
}

fn as_integer(value: &OscType) -> Option<i64> {
    match *value {
        OscType::Int(i) => Some(i as i64),
        OscType::Long(i) => Some(i),
        OscType::Float(f) if f.is_finite() => Some(f.round() as i64),
        OscType::Double(f) if f.is_finite() => Some(f.round() as i64),
        _ => None,
    }
}

/// Encodes a suggestion the way a peer would send it.
pub fn encode_suggestion(suggestion: &Suggestion) -> Result<Vec<u8>, ProtocolError> {
    let mut args = vec![OscType::String(suggestion.kind.clone())];
    for change in &suggestion.changes {
        let (name, value) = match *change {
            ParameterChange::Mode(mode) => ("mode", OscType::String(mode.name().to_string())),
            ParameterChange::Intensity(v) => ("intensity", OscType::Long(v)),
            ParameterChange::IntensityDelta(v) => ("intensity_delta", OscType::Long(v)),
            ParameterChange::Sync(b) => ("sync", OscType::Bool(b)),
        };
        args.push(OscType::String(name.to_string()));
        args.push(value);
    }
    let packet = OscPacket::Message(OscMessage {
        addr: SUGGEST_ADDR.to_string(),
        args,
    });
    rosc::encoder::encode(&packet).map_err(ProtocolError::Encode)
}
