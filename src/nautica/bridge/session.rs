use std::{
    fmt, io,
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::time;

use crate::nautica::{
    bridge::{
        channel::{Channel, MessageSink, MessageSource},
        transport::Dialer,
    },
    router::TunnelRequest,
    telemetry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Relaying,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Inbound,
    Outbound,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Inbound => "inbound",
            Side::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended abnormally. Never escapes the session task except in its report.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dial {target}: {reason}")]
    Dial { target: String, reason: String },
    #[error("{side} channel: {source}")]
    Channel {
        side: Side,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Zero waits for the dial indefinitely.
    pub dial_timeout: Duration,
    /// Upper bound on the Closing phase.
    pub close_timeout: Duration,
}

/// Counters for one forwarding direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub messages: u64,
    pub bytes: u64,
    /// Messages discarded because the destination was no longer writable.
    pub dropped: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub inbound_to_outbound: Flow,
    pub outbound_to_inbound: Flow,
}

#[derive(Debug)]
pub struct SessionReport {
    pub state: SessionState,
    /// Whether the outbound dial succeeded and the session reached Relaying.
    pub relayed: bool,
    /// The side whose close or failure ended the session, if it got that far.
    pub ended_by: Option<Side>,
    pub stats: RelayStats,
    pub error: Option<SessionError>,
}

/// One accepted upgrade: exactly one inbound and one outbound channel, relayed
/// until either goes away.
pub struct TunnelSession {
    id: String,
    request: TunnelRequest,
    opts: SessionOptions,
    state: SessionState,
    stats: RelayStats,
}

/// Write side of a channel, tracking the drop policy and the single close.
struct Writer {
    side: Side,
    sink: Box<dyn MessageSink>,
    writable: bool,
    closed: bool,
}

impl Writer {
    /// Forwarding into a writer that is no longer writable drops the message
    /// without error, retry or queueing. Drops are counted on the direction's [`Flow`].
    async fn forward(&mut self, msg: Bytes, flow: &mut Flow) -> io::Result<()> {
        if !self.writable {
            flow.dropped += 1;
            return Ok(());
        }
        let n = msg.len() as u64;
        if let Err(err) = self.sink.send(msg).await {
            self.writable = false;
            return Err(err);
        }
        flow.messages += 1;
        flow.bytes += n;
        Ok(())
    }

    async fn close(&mut self, sid: &str) {
        self.writable = false;
        if std::mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(err) = self.sink.close().await {
            tracing::debug!(sid = %sid, side = %self.side, err = %err, "session: close failed");
        }
    }
}

struct Endpoint {
    source: Box<dyn MessageSource>,
    writer: Writer,
    close_handshake: bool,
}

impl Endpoint {
    fn new(side: Side, ch: Channel) -> Self {
        Self {
            source: ch.source,
            writer: Writer {
                side,
                sink: ch.sink,
                writable: true,
                closed: false,
            },
            close_handshake: ch.close_handshake,
        }
    }
}

/// How a forwarding direction stopped.
enum Ended {
    Closed(Side),
    Failed(Side, io::Error),
}

impl TunnelSession {
    pub fn new(id: String, request: TunnelRequest, opts: SessionOptions) -> Self {
        Self {
            id,
            request,
            opts,
            state: SessionState::Connecting,
            stats: RelayStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session from Connecting to Closed.
    ///
    /// The inbound channel is not read until the dial succeeds, so a failed
    /// dial relays nothing in either direction.
    pub async fn run(mut self, inbound: Channel, dialer: &dyn Dialer) -> SessionReport {
        let started = Instant::now();
        let _active = telemetry::ActiveSessionGuard::new();
        let target = self.request.target();
        let mut inbound = Endpoint::new(Side::Inbound, inbound);

        let outbound = match self.dial(dialer).await {
            Ok(ch) => ch,
            Err(err) => {
                tracing::warn!(
                    sid = %self.id,
                    target = %target,
                    dialer = dialer.name(),
                    err = %format!("{err:#}"),
                    "session: dial failed"
                );
                inbound.writer.close(&self.id).await;
                self.state = SessionState::Closed;
                metrics::counter!(telemetry::SESSIONS_TOTAL, "result" => "dial_failed").increment(1);
                return SessionReport {
                    state: self.state,
                    relayed: false,
                    ended_by: None,
                    stats: self.stats,
                    error: Some(SessionError::Dial {
                        target,
                        reason: format!("{err:#}"),
                    }),
                };
            }
        };
        let mut outbound = Endpoint::new(Side::Outbound, outbound);

        self.state = SessionState::Relaying;
        tracing::info!(sid = %self.id, target = %target, dialer = dialer.name(), "session: relaying");

        let ended = relay(&mut inbound, &mut outbound, &mut self.stats).await;

        self.state = SessionState::Closing;
        let (origin, error) = match ended {
            Ended::Closed(side) => (side, None),
            Ended::Failed(side, source) => {
                metrics::counter!(telemetry::CHANNEL_ERRORS_TOTAL, "side" => side.as_str())
                    .increment(1);
                (side, Some(SessionError::Channel { side, source }))
            }
        };
        self.close(origin, &mut inbound, &mut outbound).await;
        self.state = SessionState::Closed;

        record_metrics(&self.stats);
        let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
        tracing::info!(
            sid = %self.id,
            target = %target,
            ended_by = %origin,
            err = %error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
            up_bytes = self.stats.inbound_to_outbound.bytes,
            down_bytes = self.stats.outbound_to_inbound.bytes,
            dropped = self.stats.inbound_to_outbound.dropped + self.stats.outbound_to_inbound.dropped,
            duration = %humantime::format_duration(elapsed),
            "session: closed"
        );

        SessionReport {
            state: self.state,
            relayed: true,
            ended_by: Some(origin),
            stats: self.stats,
            error,
        }
    }

    async fn dial(&self, dialer: &dyn Dialer) -> anyhow::Result<Channel> {
        let dial = dialer.dial(&self.request.host, self.request.port);
        if self.opts.dial_timeout > Duration::ZERO {
            time::timeout(self.opts.dial_timeout, dial)
                .await
                .map_err(|_| anyhow::anyhow!("dial timeout after {:?}", self.opts.dial_timeout))?
        } else {
            dial.await
        }
    }

    /// Closing: the counterpart of `origin` is closed first. If the counterpart
    /// answers its close on the receiving half, whatever it still sends is read
    /// and discarded until it finishes or `close_timeout` passes. The origin side
    /// is closed last. Each writer is closed exactly once.
    async fn close(&mut self, origin: Side, inbound: &mut Endpoint, outbound: &mut Endpoint) {
        let (origin_ep, counterpart, drain_flow) = match origin {
            Side::Inbound => (inbound, outbound, &mut self.stats.outbound_to_inbound),
            Side::Outbound => (outbound, inbound, &mut self.stats.inbound_to_outbound),
        };

        origin_ep.writer.writable = false;
        counterpart.writer.close(&self.id).await;

        if counterpart.close_handshake {
            let drain = async {
                loop {
                    match counterpart.source.recv().await {
                        Ok(Some(msg)) => {
                            // Origin is no longer writable; this only counts the drop.
                            let _ = origin_ep.writer.forward(msg, drain_flow).await;
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            };
            if time::timeout(self.opts.close_timeout, drain).await.is_err() {
                tracing::debug!(sid = %self.id, side = %counterpart.writer.side, "session: close handshake timed out");
            }
        }

        origin_ep.writer.close(&self.id).await;
    }
}

/// Relaying: both directions run concurrently in this task until either
/// source ends or a write fails. Per-direction order is receipt order.
async fn relay(inbound: &mut Endpoint, outbound: &mut Endpoint, stats: &mut RelayStats) -> Ended {
    let up = forward(
        Side::Inbound,
        &mut *inbound.source,
        &mut outbound.writer,
        &mut stats.inbound_to_outbound,
    );
    let down = forward(
        Side::Outbound,
        &mut *outbound.source,
        &mut inbound.writer,
        &mut stats.outbound_to_inbound,
    );

    tokio::select! {
        ended = up => ended,
        ended = down => ended,
    }
}

async fn forward(
    from: Side,
    source: &mut dyn MessageSource,
    to: &mut Writer,
    flow: &mut Flow,
) -> Ended {
    loop {
        let msg = match source.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ended::Closed(from),
            Err(err) => return Ended::Failed(from, err),
        };
        if let Err(err) = to.forward(msg, flow).await {
            return Ended::Failed(to.side, err);
        }
    }
}

fn record_metrics(stats: &RelayStats) {
    metrics::counter!(telemetry::SESSIONS_TOTAL, "result" => "relayed").increment(1);
    for (direction, flow) in [
        ("inbound", stats.inbound_to_outbound),
        ("outbound", stats.outbound_to_inbound),
    ] {
        metrics::counter!(telemetry::RELAY_BYTES_TOTAL, "direction" => direction)
            .increment(flow.bytes);
        if flow.dropped > 0 {
            metrics::counter!(telemetry::RELAY_WRITE_DROPS_TOTAL, "direction" => direction)
                .increment(flow.dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::sync::{Mutex, mpsc};

    use super::*;

    struct MockSource {
        rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    }

    #[async_trait]
    impl MessageSource for MockSource {
        async fn recv(&mut self) -> io::Result<Option<Bytes>> {
            match self.rx.recv().await {
                Some(Ok(b)) => Ok(Some(b)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
    }

    struct MockSink {
        tx: mpsc::UnboundedSender<Bytes>,
        closes: Arc<AtomicUsize>,
        fail_writes: bool,
    }

    #[async_trait]
    impl MessageSink for MockSink {
        async fn send(&mut self, msg: Bytes) -> io::Result<()> {
            if self.fail_writes {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken"));
            }
            let _ = self.tx.send(msg);
            Ok(())
        }

        async fn close(&mut self) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// The far end of a mock channel, as seen by a test.
    struct Peer {
        to_session: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
        from_session: mpsc::UnboundedReceiver<Bytes>,
        closes: Arc<AtomicUsize>,
    }

    impl Peer {
        fn send(&self, msg: &'static [u8]) {
            if let Some(tx) = &self.to_session {
                tx.send(Ok(Bytes::from_static(msg))).unwrap();
            }
        }

        fn hang_up(&mut self) {
            self.to_session = None;
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        fn received(&mut self) -> Vec<Bytes> {
            let mut out = Vec::new();
            while let Ok(m) = self.from_session.try_recv() {
                out.push(m);
            }
            out
        }
    }

    fn mock_channel(close_handshake: bool, fail_writes: bool) -> (Channel, Peer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let ch = Channel::new(
            MockSource { rx: in_rx },
            MockSink {
                tx: out_tx,
                closes: closes.clone(),
                fail_writes,
            },
            close_handshake,
        );
        let peer = Peer {
            to_session: Some(in_tx),
            from_session: out_rx,
            closes,
        };
        (ch, peer)
    }

    struct MockDialer {
        channel: Mutex<Option<Channel>>,
        hang: bool,
    }

    impl MockDialer {
        fn with(ch: Channel) -> Self {
            Self {
                channel: Mutex::new(Some(ch)),
                hang: false,
            }
        }

        fn failing() -> Self {
            Self {
                channel: Mutex::new(None),
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                channel: Mutex::new(None),
                hang: true,
            }
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn dial(&self, host: &str, port: u16) -> anyhow::Result<Channel> {
            if self.hang {
                return std::future::pending().await;
            }
            self.channel
                .lock()
                .await
                .take()
                .ok_or_else(|| anyhow::anyhow!("connect {host}:{port}: connection refused"))
        }
    }

    fn session(close_timeout: Duration) -> TunnelSession {
        TunnelSession::new(
            "s-test".into(),
            TunnelRequest {
                host: "203.194.112.119".into(),
                port: 8443,
                protocol_hint: None,
            },
            SessionOptions {
                dial_timeout: Duration::ZERO,
                close_timeout,
            },
        )
    }

    #[tokio::test]
    async fn new_session_starts_connecting() {
        assert_eq!(session(Duration::from_secs(1)).state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn relays_both_directions_in_order() {
        let (inbound, mut client) = mock_channel(true, false);
        let (outbound, mut target) = mock_channel(false, false);
        let dialer = MockDialer::with(outbound);

        let task = tokio::spawn(async move { session(Duration::from_secs(1)).run(inbound, &dialer).await });

        client.send(b"PING");
        target.send(b"PONG");
        for m in [&b"1"[..], b"2", b"3"] {
            client.send(m);
        }

        // Let both directions drain before hanging up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.hang_up();
        let report = task.await.unwrap();

        assert!(report.relayed);
        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.ended_by, Some(Side::Inbound));
        assert!(report.error.is_none());

        let got: Vec<Bytes> = target.received();
        assert_eq!(got, vec!["PING", "1", "2", "3"]);
        assert_eq!(client.received(), vec!["PONG"]);
        assert_eq!(report.stats.inbound_to_outbound.messages, 4);
        assert_eq!(report.stats.inbound_to_outbound.bytes, 7);
        assert_eq!(report.stats.outbound_to_inbound.messages, 1);
    }

    #[tokio::test]
    async fn dial_failure_closes_inbound_and_relays_nothing() {
        let (inbound, mut client) = mock_channel(true, false);
        client.send(b"early");
        let dialer = MockDialer::failing();

        let report = session(Duration::from_secs(1)).run(inbound, &dialer).await;

        assert!(!report.relayed);
        assert!(matches!(report.error, Some(SessionError::Dial { .. })));
        assert_eq!(client.closes(), 1);
        assert!(client.received().is_empty());
        assert_eq!(report.stats, RelayStats::default());
    }

    #[tokio::test]
    async fn dial_timeout_is_a_dial_failure() {
        let (inbound, client) = mock_channel(true, false);
        let dialer = MockDialer::hanging();
        let mut s = session(Duration::from_secs(1));
        s.opts.dial_timeout = Duration::from_millis(50);

        let report = s.run(inbound, &dialer).await;
        match report.error {
            Some(SessionError::Dial { reason, .. }) => assert!(reason.contains("timeout")),
            other => panic!("expected dial error, got {other:?}"),
        }
        assert_eq!(client.closes(), 1);
    }

    #[tokio::test]
    async fn inbound_close_closes_outbound_exactly_once() {
        let (inbound, mut client) = mock_channel(true, false);
        let (outbound, target) = mock_channel(false, false);
        let dialer = MockDialer::with(outbound);

        client.hang_up();
        let report = session(Duration::from_secs(1)).run(inbound, &dialer).await;

        assert_eq!(report.ended_by, Some(Side::Inbound));
        assert_eq!(target.closes(), 1);
        assert_eq!(client.closes(), 1);
    }

    #[tokio::test]
    async fn outbound_close_discards_late_inbound_messages() {
        let (inbound, mut client) = mock_channel(true, false);
        let (outbound, mut target) = mock_channel(false, false);
        let dialer = MockDialer::with(outbound);

        let task = tokio::spawn(async move { session(Duration::from_secs(5)).run(inbound, &dialer).await });

        client.send(b"before");
        tokio::time::sleep(Duration::from_millis(50)).await;
        target.hang_up();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The bridge has asked the client to close; these race the close reply.
        assert_eq!(client.closes(), 1);
        client.send(b"late-1");
        client.send(b"late-2");
        client.hang_up();

        let report = task.await.unwrap();
        assert_eq!(report.ended_by, Some(Side::Outbound));
        assert!(report.error.is_none());
        assert_eq!(target.received(), vec!["before"]);
        assert_eq!(report.stats.inbound_to_outbound.dropped, 2);
        assert_eq!(target.closes(), 1);
        assert_eq!(client.closes(), 1);
    }

    #[tokio::test]
    async fn late_drops_and_outcome_reach_process_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _local = metrics::set_default_local_recorder(&recorder);

        let (inbound, mut client) = mock_channel(true, false);
        let (outbound, mut target) = mock_channel(false, false);
        let dialer = MockDialer::with(outbound);

        // Current-thread runtime: the spawned session sees the thread-local recorder.
        let task = tokio::spawn(async move { session(Duration::from_secs(5)).run(inbound, &dialer).await });

        client.send(b"before");
        tokio::time::sleep(Duration::from_millis(50)).await;
        target.hang_up();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.send(b"late-1");
        client.send(b"late-2");
        client.hang_up();
        task.await.unwrap();

        let rendered = handle.render();
        assert!(
            rendered.contains(r#"nautica_relay_write_drops_total{direction="inbound"} 2"#),
            "{rendered}"
        );
        assert!(
            rendered.contains(r#"nautica_sessions_total{result="relayed"} 1"#),
            "{rendered}"
        );
    }

    #[tokio::test]
    async fn failures_reach_process_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _local = metrics::set_default_local_recorder(&recorder);

        let (inbound, mut client) = mock_channel(false, false);
        let (outbound, _target) = mock_channel(false, true);
        client.send(b"PING");
        session(Duration::from_secs(1))
            .run(inbound, &MockDialer::with(outbound))
            .await;

        let (inbound, _client) = mock_channel(false, false);
        session(Duration::from_secs(1))
            .run(inbound, &MockDialer::failing())
            .await;

        let rendered = handle.render();
        assert!(
            rendered.contains(r#"nautica_channel_errors_total{side="outbound"} 1"#),
            "{rendered}"
        );
        assert!(
            rendered.contains(r#"nautica_sessions_total{result="dial_failed"} 1"#),
            "{rendered}"
        );
        assert!(
            rendered.contains(r#"nautica_sessions_total{result="relayed"} 1"#),
            "{rendered}"
        );
    }

    #[tokio::test]
    async fn closing_is_bounded_when_peer_never_answers() {
        let (inbound, _client) = mock_channel(true, false);
        let (outbound, mut target) = mock_channel(false, false);
        let dialer = MockDialer::with(outbound);
        target.hang_up();

        let started = Instant::now();
        let report = session(Duration::from_millis(100)).run(inbound, &dialer).await;

        assert_eq!(report.state, SessionState::Closed);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(target.closes(), 1);
    }

    #[tokio::test]
    async fn outbound_write_failure_is_a_channel_error() {
        let (inbound, mut client) = mock_channel(false, false);
        let (outbound, target) = mock_channel(false, true);
        let dialer = MockDialer::with(outbound);

        client.send(b"PING");
        let report = session(Duration::from_secs(1)).run(inbound, &dialer).await;

        match &report.error {
            Some(SessionError::Channel { side, .. }) => assert_eq!(*side, Side::Outbound),
            other => panic!("expected channel error, got {other:?}"),
        }
        assert_eq!(report.ended_by, Some(Side::Outbound));
        assert_eq!(client.closes(), 1);
        assert_eq!(target.closes(), 1);
    }

    #[tokio::test]
    async fn inbound_read_error_closes_outbound() {
        let (inbound, client) = mock_channel(false, false);
        let (outbound, target) = mock_channel(false, false);
        let dialer = MockDialer::with(outbound);

        if let Some(tx) = &client.to_session {
            tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
                .unwrap();
        }
        let report = session(Duration::from_secs(1)).run(inbound, &dialer).await;

        assert!(matches!(
            report.error,
            Some(SessionError::Channel { side: Side::Inbound, .. })
        ));
        assert_eq!(target.closes(), 1);
    }
}
