//! Non-blocking bridge between the real-time context and the external peer.
//!
//! The real-time side owns a [`TriggerSender`], the producer half of a bounded
//! SPSC ring. A dedicated worker thread owns the consumer half and the
//! [`Transport`]: it drains triggers onto the wire and pushes decoded
//! suggestions into a bounded inbound channel that the idle context polls via
//! [`ControlChannel::poll_suggestions`].

use crossbeam::channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{BridgeConfig, DEFAULT_INBOUND_CAPACITY, DEFAULT_OUTBOUND_CAPACITY};
use crate::error::TransportError;
use crate::protocol::{self, Suggestion};
use crate::timing::TriggerMessage;
use crate::transport::{Backoff, Transport};

/// Largest inbound datagram accepted from the peer.
const MAX_DATAGRAM: usize = 8192;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(5),
        }
    }
}

impl From<&BridgeConfig> for ChannelConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            outbound_capacity: config.outbound_capacity.max(1),
            inbound_capacity: config.inbound_capacity.max(1),
            reconnect_initial: config.transport.reconnect_initial(),
            reconnect_max: config.transport.reconnect_max(),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelStats {
    connected: AtomicBool,
    setup_failed: AtomicBool,
    triggers_sent: AtomicU64,
    triggers_dropped: AtomicU64,
    suggestions_received: AtomicU64,
    suggestions_dropped: AtomicU64,
    send_failures: AtomicU64,
    connect_attempts: AtomicU64,
    protocol_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of the channel's health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    pub connected: bool,
    /// The transport could not be opened at all (bad address, port taken).
    pub setup_failed: bool,
    pub triggers_sent: u64,
    pub triggers_dropped: u64,
    pub suggestions_received: u64,
    pub suggestions_dropped: u64,
    pub send_failures: u64,
    pub connect_attempts: u64,
    pub protocol_errors: u64,
    pub last_error: Option<String>,
}

/// Real-time half of the channel.
pub struct TriggerSender {
    producer: HeapProd<TriggerMessage>,
    stats: Arc<ChannelStats>,
}

impl TriggerSender {
    /// Queues a trigger without blocking. When the queue is full the incoming
    /// trigger is dropped (already-queued ones keep their order) and false is
    /// returned.
    pub fn try_send_trigger(&mut self, msg: TriggerMessage) -> bool {
        match self.producer.try_push(msg) {
            Ok(()) => true,
            Err(_) => {
                bump(&self.stats.triggers_dropped);
                false
            }
        }
    }

    /// Triggers waiting for the worker.
    pub fn queued(&self) -> usize {
        self.producer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity().get()
    }
}

/// Idle-context half of the channel: inbound suggestions, status, teardown.
pub struct ControlChannel {
    inbound: Receiver<Suggestion>,
    stats: Arc<ChannelStats>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ControlChannel {
    pub fn spawn(
        config: ChannelConfig,
        transport: Box<dyn Transport>,
    ) -> Result<(TriggerSender, ControlChannel), TransportError> {
        let ring = HeapRb::<TriggerMessage>::new(config.outbound_capacity.max(1));
        let (producer, consumer) = ring.split();
        let (inbound_tx, inbound_rx) = crossbeam::channel::bounded(config.inbound_capacity.max(1));
        let stats = Arc::new(ChannelStats::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            transport,
            outbound: consumer,
            pending: None,
            inbound: inbound_tx,
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            backoff: Backoff::new(config.reconnect_initial, config.reconnect_max),
            next_attempt: Instant::now(),
            failed_attempts: 0,
        };

        let handle = thread::Builder::new()
            .name("beatbridge-channel".into())
            .spawn(move || worker.run())
            .map_err(TransportError::Worker)?;

        Ok((
            TriggerSender {
                producer,
                stats: stats.clone(),
            },
            ControlChannel {
                inbound: inbound_rx,
                stats,
                shutdown,
                worker: Some(handle),
            },
        ))
    }

    /// Everything received from the peer since the last poll. Never blocks.
    pub fn poll_suggestions(&self) -> Vec<Suggestion> {
        self.inbound.try_iter().collect()
    }

    pub fn status(&self) -> ChannelStatus {
        let s = &self.stats;
        ChannelStatus {
            connected: s.connected.load(Ordering::Relaxed),
            setup_failed: s.setup_failed.load(Ordering::Relaxed),
            triggers_sent: s.triggers_sent.load(Ordering::Relaxed),
            triggers_dropped: s.triggers_dropped.load(Ordering::Relaxed),
            suggestions_received: s.suggestions_received.load(Ordering::Relaxed),
            suggestions_dropped: s.suggestions_dropped.load(Ordering::Relaxed),
            send_failures: s.send_failures.load(Ordering::Relaxed),
            connect_attempts: s.connect_attempts.load(Ordering::Relaxed),
            protocol_errors: s.protocol_errors.load(Ordering::Relaxed),
            last_error: s.last_error.lock().clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    /// Tells the worker to stop and returns immediately. Queued triggers are
    /// discarded and any in-flight send is abandoned.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// True once the worker thread has exited.
    pub fn is_stopped(&self) -> bool {
        self.worker.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Polls [`Self::is_stopped`] for up to `timeout`. Never joins.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_stopped() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
        // Detach rather than join: teardown must not wait on the network.
        self.worker.take();
    }
}

struct Worker {
    transport: Box<dyn Transport>,
    outbound: HeapCons<TriggerMessage>,
    /// Encoded trigger taken off the ring but not yet sent. Retried after
    /// every reconnect so an outage neither loses nor duplicates it.
    pending: Option<Vec<u8>>,
    inbound: Sender<Suggestion>,
    stats: Arc<ChannelStats>,
    shutdown: Arc<AtomicBool>,
    backoff: Backoff,
    next_attempt: Instant,
    failed_attempts: u64,
}

impl Worker {
    fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while !self.shutdown.load(Ordering::Acquire) {
            if self.transport.is_connected() && self.transport.needs_reconnect() {
                info!("peer configuration changed, reconnecting");
                self.transport.disconnect();
                self.stats.connected.store(false, Ordering::Relaxed);
                self.backoff.reset();
                self.next_attempt = Instant::now();
            }

            if !self.transport.is_connected() {
                let now = Instant::now();
                if now < self.next_attempt {
                    thread::sleep((self.next_attempt - now).min(self.transport.idle_wait()));
                    continue;
                }
                if !self.connect() {
                    continue;
                }
            }

            self.drain_outbound();
            if self.transport.is_connected() {
                self.receive_inbound(&mut buf);
            }
        }

        self.transport.disconnect();
        self.outbound.clear();
        self.pending = None;
        self.stats.connected.store(false, Ordering::Relaxed);
        debug!("control channel worker stopped");
    }

    /// Picks up reconnect settings changed since the channel was spawned.
    fn refresh_schedule(&mut self) {
        let Some((initial, max)) = self.transport.reconnect_bounds() else {
            return;
        };
        let fresh = Backoff::new(initial, max);
        if fresh.bounds() != self.backoff.bounds() {
            debug!(?initial, ?max, "reconnect schedule updated");
            self.backoff = fresh;
        }
    }

    fn connect(&mut self) -> bool {
        self.refresh_schedule();
        bump(&self.stats.connect_attempts);
        match self.transport.connect() {
            Ok(()) => {
                if self.failed_attempts > 0 {
                    info!(
                        failed_attempts = self.failed_attempts,
                        "control channel transport recovered"
                    );
                } else {
                    info!("control channel transport connected");
                }
                self.failed_attempts = 0;
                self.backoff.reset();
                self.stats.connected.store(true, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    /// Drops the link and schedules the next connection attempt. Only the
    /// first failure of an outage is logged above debug level.
    fn fail(&mut self, e: TransportError) {
        self.transport.disconnect();
        self.stats.connected.store(false, Ordering::Relaxed);
        let retry_in = self.backoff.next_delay();
        self.next_attempt = Instant::now() + retry_in;

        if self.failed_attempts == 0 {
            match &e {
                TransportError::Setup { .. } => {
                    self.stats.setup_failed.store(true, Ordering::Relaxed);
                    error!(error = %e, ?retry_in, "cannot open control channel transport");
                }
                _ => warn!(error = %e, ?retry_in, "control channel transport failed"),
            }
        } else {
            debug!(
                error = %e,
                ?retry_in,
                attempt = self.failed_attempts + 1,
                "transport still down"
            );
        }
        self.failed_attempts += 1;
        *self.stats.last_error.lock() = Some(e.to_string());
    }

    fn drain_outbound(&mut self) {
        loop {
            if self.pending.is_none() {
                let Some(trigger) = self.outbound.try_pop() else {
                    return;
                };
                match protocol::encode_trigger(&trigger) {
                    Ok(bytes) => self.pending = Some(bytes),
                    Err(e) => {
                        bump(&self.stats.protocol_errors);
                        error!(
                            error = %e,
                            beat_count = trigger.beat_count,
                            "dropping unencodable trigger"
                        );
                        continue;
                    }
                }
            }

            let Some(packet) = self.pending.as_deref() else {
                return;
            };
            match self.transport.send(packet) {
                Ok(()) => {
                    self.pending = None;
                    bump(&self.stats.triggers_sent);
                }
                Err(e) => {
                    bump(&self.stats.send_failures);
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn receive_inbound(&mut self, buf: &mut [u8]) {
        match self.transport.recv(buf) {
            Ok(Some(n)) => self.handle_datagram(&buf[..n]),
            Ok(None) => {}
            Err(e) => {
                // A dead peer is reported on the receive path for earlier sends.
                if matches!(e, TransportError::Unreachable { .. }) {
                    bump(&self.stats.send_failures);
                }
                self.fail(e);
            }
        }
    }

    fn handle_datagram(&mut self, datagram: &[u8]) {
        let suggestions = match protocol::decode_suggestions(datagram) {
            Ok(suggestions) => suggestions,
            Err(e) => {
                bump(&self.stats.protocol_errors);
                warn!(error = %e, len = datagram.len(), "dropping malformed packet from peer");
                return;
            }
        };

        for suggestion in suggestions {
            match self.inbound.try_send(suggestion) {
                Ok(()) => bump(&self.stats.suggestions_received),
                Err(TrySendError::Full(dropped)) => {
                    bump(&self.stats.suggestions_dropped);
                    debug!(kind = %dropped.kind, "inbound queue full, dropping suggestion");
                }
                // Idle side is gone; the shutdown flag follows shortly.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Mode;
    use crate::protocol::ParameterChange;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// In-memory transport whose failures are scripted by the test.
    #[derive(Clone, Default)]
    struct Scripted {
        connect_failures: Arc<AtomicUsize>,
        send_failures: Arc<AtomicUsize>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
        connected: Arc<AtomicBool>,
        disconnects: Arc<AtomicUsize>,
        bounds: Arc<Mutex<Option<(Duration, Duration)>>>,
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl Transport for Scripted {
        fn connect(&mut self) -> Result<(), TransportError> {
            if take_one(&self.connect_failures) {
                return Err(TransportError::NotConnected);
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn send(&mut self, packet: &[u8]) -> Result<(), TransportError> {
            if take_one(&self.send_failures) {
                return Err(TransportError::Send(std::io::Error::other("scripted")));
            }
            self.sent.lock().push(packet.to_vec());
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
            match self.incoming.lock().pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(Some(packet.len()))
                }
                None => {
                    thread::sleep(Duration::from_millis(1));
                    Ok(None)
                }
            }
        }

        fn disconnect(&mut self) {
            if self.connected.swap(false, Ordering::SeqCst) {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn idle_wait(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn reconnect_bounds(&self) -> Option<(Duration, Duration)> {
            *self.bounds.lock()
        }
    }

    fn fast_config(outbound: usize, inbound: usize) -> ChannelConfig {
        ChannelConfig {
            outbound_capacity: outbound,
            inbound_capacity: inbound,
            reconnect_initial: Duration::from_millis(1),
            reconnect_max: Duration::from_millis(4),
        }
    }

    fn trigger(beat_count: u64) -> TriggerMessage {
        TriggerMessage {
            beat_count,
            timestamp: beat_count * 1000,
            mode: Mode::Analyze,
            intensity: 50,
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn full_queue_drops_the_newest_trigger() {
        let transport = Scripted::default();
        transport.connect_failures.store(usize::MAX, Ordering::SeqCst);
        let config = ChannelConfig {
            reconnect_initial: Duration::from_secs(60),
            reconnect_max: Duration::from_secs(60),
            ..fast_config(8, 4)
        };
        let (mut sender, channel) = ControlChannel::spawn(config, Box::new(transport)).unwrap();

        let accepted: Vec<bool> = (1..=9).map(|n| sender.try_send_trigger(trigger(n))).collect();
        assert_eq!(accepted.iter().filter(|ok| **ok).count(), 8);
        assert!(!accepted[8]);
        assert_eq!(sender.queued(), 8);
        assert_eq!(sender.capacity(), 8);
        assert_eq!(channel.status().triggers_dropped, 1);
        assert!(!channel.is_connected());
    }

    #[test]
    fn outage_keeps_messages_and_sends_each_once() {
        let transport = Scripted::default();
        transport.send_failures.store(3, Ordering::SeqCst);
        let sent = transport.sent.clone();
        let (mut sender, channel) =
            ControlChannel::spawn(fast_config(8, 4), Box::new(transport.clone())).unwrap();

        for n in 1..=5 {
            assert!(sender.try_send_trigger(trigger(n)));
        }

        assert!(wait_until(|| sent.lock().len() == 5));
        let counts: Vec<u64> = sent
            .lock()
            .iter()
            .map(|bytes| protocol::decode_trigger(bytes).unwrap().beat_count)
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);

        assert!(wait_until(|| channel.status().triggers_sent == 5));
        let status = channel.status();
        assert_eq!(status.send_failures, 3);
        assert_eq!(status.triggers_dropped, 0);
        assert!(status.connect_attempts >= 4);
        assert!(status.last_error.is_some());
        assert!(!status.setup_failed);
        assert!(transport.disconnects.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn unreachable_peer_keeps_triggers_queued_until_recovery() {
        let transport = Scripted::default();
        transport.connect_failures.store(3, Ordering::SeqCst);
        let sent = transport.sent.clone();
        let (mut sender, channel) =
            ControlChannel::spawn(fast_config(4, 4), Box::new(transport)).unwrap();

        for n in 1..=4 {
            assert!(sender.try_send_trigger(trigger(n)));
        }

        assert!(wait_until(|| sent.lock().len() == 4));
        assert!(wait_until(|| channel.is_connected()));
        assert_eq!(channel.status().connect_attempts, 4);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sent.lock().len(), 4);
    }

    #[test]
    fn reconnect_schedule_follows_live_settings() {
        let transport = Scripted::default();
        transport.connect_failures.store(usize::MAX, Ordering::SeqCst);
        let bounds = transport.bounds.clone();
        let (_sender, channel) =
            ControlChannel::spawn(fast_config(4, 4), Box::new(transport)).unwrap();

        assert!(wait_until(|| channel.status().connect_attempts >= 3));
        *bounds.lock() = Some((Duration::from_secs(60), Duration::from_secs(60)));

        // At most one more attempt on the old schedule, then a 60s wait.
        thread::sleep(Duration::from_millis(50));
        let settled = channel.status().connect_attempts;
        thread::sleep(Duration::from_millis(100));
        assert_eq!(channel.status().connect_attempts, settled);
        assert!(!channel.is_connected());
    }

    #[test]
    fn unreachable_reports_on_receive_count_as_send_failures() {
        struct DeadPeer {
            connected: bool,
        }

        impl Transport for DeadPeer {
            fn connect(&mut self) -> Result<(), TransportError> {
                self.connected = true;
                Ok(())
            }
            fn send(&mut self, _: &[u8]) -> Result<(), TransportError> {
                Ok(())
            }
            fn recv(&mut self, _: &mut [u8]) -> Result<Option<usize>, TransportError> {
                Err(TransportError::Unreachable {
                    addr: "127.0.0.1:9".parse().unwrap(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                })
            }
            fn disconnect(&mut self) {
                self.connected = false;
            }
            fn is_connected(&self) -> bool {
                self.connected
            }
            fn idle_wait(&self) -> Duration {
                Duration::from_millis(1)
            }
        }

        let (_sender, channel) =
            ControlChannel::spawn(fast_config(4, 4), Box::new(DeadPeer { connected: false }))
                .unwrap();
        assert!(wait_until(|| channel.status().send_failures >= 3));
        let status = channel.status();
        assert!(status.connect_attempts >= 3);
        assert!(status.last_error.is_some_and(|e| e.contains("unreachable")));
    }

    #[test]
    fn suggestions_reach_the_idle_side() {
        let transport = Scripted::default();
        let suggestion = Suggestion {
            kind: "mix".into(),
            changes: vec![ParameterChange::Intensity(80)],
        };
        {
            let mut incoming = transport.incoming.lock();
            incoming.push_back(b"garbage".to_vec());
            incoming.push_back(protocol::encode_suggestion(&suggestion).unwrap());
        }
        let (_sender, channel) =
            ControlChannel::spawn(fast_config(4, 4), Box::new(transport)).unwrap();

        let mut received = Vec::new();
        assert!(wait_until(|| {
            received.extend(channel.poll_suggestions());
            !received.is_empty()
        }));
        assert_eq!(received, vec![suggestion]);
        assert_eq!(channel.status().protocol_errors, 1);
        assert!(channel.poll_suggestions().is_empty());
    }

    #[test]
    fn inbound_overflow_drops_newest_suggestions() {
        let transport = Scripted::default();
        {
            let mut incoming = transport.incoming.lock();
            for kind in ["first", "second", "third"] {
                let s = Suggestion {
                    kind: kind.into(),
                    changes: vec![],
                };
                incoming.push_back(protocol::encode_suggestion(&s).unwrap());
            }
        }
        let (_sender, channel) =
            ControlChannel::spawn(fast_config(4, 1), Box::new(transport)).unwrap();

        assert!(wait_until(|| {
            let s = channel.status();
            s.suggestions_received + s.suggestions_dropped == 3
        }));
        let polled = channel.poll_suggestions();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].kind, "first");
        assert_eq!(channel.status().suggestions_dropped, 2);
    }

    #[test]
    fn shutdown_returns_immediately_and_stops_the_worker() {
        let transport = Scripted::default();
        let probe = transport.clone();
        let (mut sender, channel) =
            ControlChannel::spawn(fast_config(4, 4), Box::new(transport)).unwrap();
        assert!(wait_until(|| channel.is_connected()));

        channel.shutdown();
        assert!(channel.wait_stopped(Duration::from_secs(5)));
        assert!(!probe.is_connected());
        assert!(!channel.is_connected());

        // The real-time side keeps working after teardown; nothing drains it.
        assert!(sender.try_send_trigger(trigger(1)));
    }
}
