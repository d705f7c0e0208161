use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors surfaced when building the bridge. Nothing on the real-time path
/// returns one of these: out-of-range parameters are clamped, queue overflow
/// is counted, malformed MIDI is forwarded untouched. Protocol errors stay
/// inside the channel worker and only show up in its counters.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] ron::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport cannot be set up at all (bad address, port in use).
    #[error("cannot open transport on {addr}: {source}")]
    Setup {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("peer {addr} unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("send failed: {0}")]
    Send(#[source] io::Error),
    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),
    #[error("transport not connected")]
    NotConnected,
    #[error("failed to start transport worker: {0}")]
    Worker(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to decode OSC packet: {0:?}")]
    Decode(rosc::OscError),
    #[error("failed to encode OSC packet: {0:?}")]
    Encode(rosc::OscError),
    #[error("unknown OSC address '{0}'")]
    UnknownAddress(String),
    #[error("bad OSC arguments: {0}")]
    BadArgument(String),
}
