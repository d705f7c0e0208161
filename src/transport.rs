use arc_swap::ArcSwap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::error::TransportError;

/// The link between the channel worker and the external peer. Only ever used
/// from the worker thread, never from the real-time context.
pub trait Transport: Send {
    /// Establishes the link. Called again after any failure, on the backoff
    /// schedule.
    fn connect(&mut self) -> Result<(), TransportError>;

    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError>;

    /// Waits at most one poll interval for an inbound packet.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// True when the link should be torn down and rebuilt, e.g. because the
    /// configured peer changed.
    fn needs_reconnect(&self) -> bool {
        false
    }

    /// Sleep used by the worker while disconnected.
    fn idle_wait(&self) -> Duration {
        Duration::from_millis(5)
    }

    /// Reconnect schedule `(initial, max)` when the transport carries its own
    /// live settings. `None` keeps the schedule the channel was spawned with.
    fn reconnect_bounds(&self) -> Option<(Duration, Duration)> {
        None
    }
}

/// OSC-over-UDP link. Binds `listen_addr` and connects the socket to
/// `peer_addr`.
///
/// Only datagrams from the peer address are received. A connected socket gets
/// the ICMP port-unreachable reports for a dead peer, which surface as
/// [`TransportError::Unreachable`] from the next `send` or `recv`.
pub struct UdpTransport {
    config: Arc<ArcSwap<TransportConfig>>,
    socket: Option<UdpSocket>,
    active: Option<Arc<TransportConfig>>,
    peer: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(config: Arc<ArcSwap<TransportConfig>>) -> Self {
        Self {
            config,
            socket: None,
            active: None,
            peer: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn unreachable(peer: SocketAddr, source: io::Error) -> TransportError {
        TransportError::Unreachable { addr: peer, source }
    }

    fn socket(&self) -> Result<(&UdpSocket, SocketAddr), TransportError> {
        match (&self.socket, self.peer) {
            (Some(socket), Some(peer)) => Ok((socket, peer)),
            _ => Err(TransportError::NotConnected),
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.to_socket_addrs()
        .and_then(|mut addrs| {
            addrs
                .next()
                .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no address resolved"))
        })
        .map_err(|source| TransportError::Setup {
            addr: addr.to_string(),
            source,
        })
}

fn is_unreachable(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
    )
}

impl Transport for UdpTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.disconnect();

        let config = self.config.load_full();
        let peer = resolve(&config.peer_addr)?;
        let socket =
            UdpSocket::bind(&config.listen_addr).map_err(|source| TransportError::Setup {
                addr: config.listen_addr.clone(),
                source,
            })?;
        socket
            .set_read_timeout(Some(config.poll_interval()))
            .map_err(|source| TransportError::Setup {
                addr: config.listen_addr.clone(),
                source,
            })?;
        socket.connect(peer).map_err(|source| TransportError::Setup {
            addr: config.peer_addr.clone(),
            source,
        })?;

        self.socket = Some(socket);
        self.peer = Some(peer);
        self.active = Some(config);
        Ok(())
    }

    fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
        let (socket, peer) = self.socket()?;
        match socket.send(packet) {
            Ok(_) => Ok(()),
            Err(source) if is_unreachable(source.kind()) => Err(Self::unreachable(peer, source)),
            Err(source) => Err(TransportError::Send(source)),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let (socket, peer) = self.socket()?;
        match socket.recv(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            // ICMP port-unreachable for an earlier send.
            Err(e) if is_unreachable(e.kind()) => Err(Self::unreachable(peer, e)),
            Err(e) => Err(TransportError::Recv(e)),
        }
    }

    fn disconnect(&mut self) {
        self.socket = None;
        self.peer = None;
        self.active = None;
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn needs_reconnect(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| **self.config.load() != **active)
    }

    fn idle_wait(&self) -> Duration {
        self.config.load().poll_interval()
    }

    fn reconnect_bounds(&self) -> Option<(Duration, Duration)> {
        let config = self.config.load();
        Some((config.reconnect_initial(), config.reconnect_max()))
    }
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay before the next attempt; doubles each call up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.initial, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(peer: &str, listen: &str) -> Arc<ArcSwap<TransportConfig>> {
        Arc::new(ArcSwap::from_pointee(TransportConfig {
            peer_addr: peer.to_string(),
            listen_addr: listen.to_string(),
            ..TransportConfig::default()
        }))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn sends_and_receives_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer.local_addr().unwrap().to_string();
        let mut transport = UdpTransport::new(config(&peer_addr, "127.0.0.1:0"));

        assert!(matches!(
            transport.send(b"x"),
            Err(TransportError::NotConnected)
        ));
        transport.connect().unwrap();
        assert!(transport.is_connected());

        transport.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        peer.send_to(b"back", from).unwrap();
        let mut received = None;
        for _ in 0..200 {
            if let Some(n) = transport.recv(&mut buf).unwrap() {
                received = Some(buf[..n].to_vec());
                break;
            }
        }
        assert_eq!(received.as_deref(), Some(&b"back"[..]));
    }

    #[test]
    fn bad_listen_address_is_a_setup_error() {
        let mut transport = UdpTransport::new(config("127.0.0.1:9", "not-an-address"));
        assert!(matches!(
            transport.connect(),
            Err(TransportError::Setup { .. })
        ));
        assert!(!transport.is_connected());
    }

    #[test]
    fn closed_peer_port_is_reported_unreachable() {
        let closed = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let mut transport = UdpTransport::new(config(&closed.to_string(), "127.0.0.1:0"));
        transport.connect().unwrap();

        let mut buf = [0u8; 16];
        let mut reported = None;
        for _ in 0..50 {
            let result = transport.send(b"beat").and_then(|()| transport.recv(&mut buf));
            if let Err(e) = result {
                reported = Some(e);
                break;
            }
        }
        assert!(
            matches!(reported, Some(TransportError::Unreachable { addr, .. }) if addr == closed),
            "{reported:?}"
        );
    }

    #[test]
    fn any_transport_setting_change_requests_a_reconnect() {
        let shared = config("127.0.0.1:9", "127.0.0.1:0");
        let mut transport = UdpTransport::new(shared.clone());
        transport.connect().unwrap();
        assert_eq!(
            transport.reconnect_bounds(),
            Some((Duration::from_millis(100), Duration::from_millis(5000)))
        );

        shared.rcu(|current| TransportConfig {
            poll_interval_ms: 20,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 1000,
            ..TransportConfig::clone(current)
        });
        assert!(transport.needs_reconnect());
        assert_eq!(transport.idle_wait(), Duration::from_millis(20));
        assert_eq!(
            transport.reconnect_bounds(),
            Some((Duration::from_millis(250), Duration::from_millis(1000)))
        );
        transport.connect().unwrap();
        assert!(!transport.needs_reconnect());
    }

    #[test]
    fn retargeting_the_peer_requests_a_reconnect() {
        let shared = config("127.0.0.1:9", "127.0.0.1:0");
        let mut transport = UdpTransport::new(shared.clone());
        transport.connect().unwrap();
        assert!(!transport.needs_reconnect());

        shared.rcu(|current| TransportConfig {
            peer_addr: "127.0.0.1:10".to_string(),
            ..TransportConfig::clone(current)
        });
        assert!(transport.needs_reconnect());
        transport.connect().unwrap();
        assert!(!transport.needs_reconnect());
    }
}
