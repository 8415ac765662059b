//! Push-gateway channel.
//!
//! One background task owns the WebSocket to the push gateway: it connects
//! with the session's cookies, replays the tuning and registration
//! handshake, then reads frames and broadcasts the decoded events to
//! subscribers. Connection losses are retried with jittered exponential
//! backoff until the channel is stopped; a gateway that rejects our
//! cookies outright is not retried, since no amount of waiting fixes that.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};

use crate::error::{EchoError, Result};
use crate::frame::{self, Frame};
use crate::protocol::{Endpoints, USER_AGENT};
use crate::redact::hide_serial;
use crate::subscription::EventReceiver;
use crate::types::{PushEvent, SessionState};

/// Interval between keepalive pings; the gateway drops quiet connections
const KEEPALIVE: Duration = Duration::from_secs(180);

/// Deadline for one connection attempt; a hung connect must not stall the
/// reconnect loop
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Life-cycle of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected; either never started or waiting to reconnect
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Handshake complete, events are flowing
    Connected,
    /// Terminal: the channel was stopped and will not reconnect
    Stopped,
}

/// Reconnect timing. The defaults match what the service tolerates; tests
/// shrink them to keep runs fast.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Multiplier applied to the delay after each failed attempt
    pub factor: u32,
    /// Upper bound for the delay
    pub cap: Duration,
    /// A connection held at least this long counts as stable and resets
    /// the backoff
    pub stability_threshold: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            stability_threshold: Duration::from_secs(30),
        }
    }
}

/// Deterministic backoff ladder; jitter is applied separately
struct Backoff {
    policy: ReconnectPolicy,
    current: Option<Duration>,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    fn next(&mut self) -> Duration {
        let next = match self.current {
            None => self.policy.base,
            Some(current) => (current * self.policy.factor).min(self.policy.cap),
        };
        self.current = Some(next);
        next
    }

    fn reset(&mut self) {
        self.current = None;
    }
}

/// Uniform jitter in `[d/2, d]`, so concurrent clients spread their retries
fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    rand::thread_rng().gen_range(delay / 2..=delay)
}

/// Long-lived connection to the push gateway.
///
/// The channel reads the session through a watch handle and never writes
/// it; cookie renewal stays the session owner's job. Subscribers created
/// with [`subscribe`](Self::subscribe) receive events in wire order and
/// survive reconnects.
pub struct PushChannel {
    endpoints: Endpoints,
    policy: ReconnectPolicy,
    session_rx: watch::Receiver<Option<SessionState>>,
    event_tx: broadcast::Sender<PushEvent>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    state_rx: watch::Receiver<ChannelState>,
    malformed: Arc<AtomicU64>,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    stopped: bool,
}

impl PushChannel {
    /// Create a channel that reads its session from `session_rx`
    pub fn new(
        endpoints: Endpoints,
        policy: ReconnectPolicy,
        session_rx: watch::Receiver<Option<SessionState>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        Self {
            endpoints,
            policy,
            session_rx,
            event_tx,
            state_tx: Arc::new(state_tx),
            state_rx,
            malformed: Arc::new(AtomicU64::new(0)),
            stop_tx: None,
            task_handle: None,
            stopped: false,
        }
    }

    /// Spawn the connect loop. Returns immediately; connection progress is
    /// observable through [`state`](Self::state).
    ///
    /// Starting an already-running channel is a no-op. A stopped channel
    /// stays stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.stopped {
            return Err(EchoError::ConnectionClosed);
        }
        if self.task_handle.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("push channel already running");
            return Ok(());
        }

        let (stop_tx, _) = broadcast::channel(1);
        self.stop_tx = Some(stop_tx.clone());

        let handle = tokio::spawn(run_channel(
            self.endpoints.clone(),
            self.policy.clone(),
            self.session_rx.clone(),
            self.event_tx.clone(),
            self.state_tx.clone(),
            self.malformed.clone(),
            stop_tx,
        ));
        self.task_handle = Some(handle);
        Ok(())
    }

    /// Stop the channel. Safe to call at any point, including mid-backoff
    /// and mid-connect; no event is dispatched after this returns.
    pub async fn stop(&mut self) {
        self.stopped = true;
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.task_handle.take() {
            // Give it a moment to wind down, then cut it off
            if timeout(Duration::from_millis(500), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        let _ = self.state_tx.send(ChannelState::Stopped);
    }

    /// Subscribe to push events
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.event_tx.subscribe())
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Watch handle for state transitions
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Frames received and discarded as undecodable since the channel was
    /// created
    pub fn malformed_frames(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

enum Outcome {
    /// Stop was requested while the connection was up
    Stopped,
    /// The connection ended; the loop decides whether to retry
    Dropped,
}

#[allow(clippy::too_many_arguments)]
async fn run_channel(
    endpoints: Endpoints,
    policy: ReconnectPolicy,
    session_rx: watch::Receiver<Option<SessionState>>,
    event_tx: broadcast::Sender<PushEvent>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    malformed: Arc<AtomicU64>,
    stop_tx: broadcast::Sender<()>,
) {
    let mut backoff = Backoff::new(policy.clone());
    let mut pending_delay: Option<Duration> = None;
    let mut stop_rx = stop_tx.subscribe();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                tracing::info!("push channel stopped");
                break;
            }
            fatal = async {
                if let Some(delay) = pending_delay.take() {
                    tracing::info!("reconnecting to push gateway in {:?}", delay);
                    sleep(delay).await;
                }

                let _ = state_tx.send(ChannelState::Connecting);
                let started = Instant::now();
                let mut stop_rx_inner = stop_tx.subscribe();
                match run_connection_once(
                    &endpoints,
                    &session_rx,
                    &event_tx,
                    &state_tx,
                    &malformed,
                    &mut stop_rx_inner,
                )
                .await
                {
                    Ok(Outcome::Stopped) => true,
                    Ok(Outcome::Dropped) => {
                        let _ = state_tx.send(ChannelState::Disconnected);
                        if started.elapsed() >= policy.stability_threshold {
                            tracing::debug!("connection was stable; resetting backoff");
                            backoff.reset();
                        }
                        pending_delay = Some(jittered(backoff.next()));
                        false
                    }
                    Err(e) if is_fatal(&e) => {
                        tracing::error!("push gateway rejected the connection: {}", e);
                        true
                    }
                    Err(e) => {
                        tracing::warn!("push connection failed: {}", e);
                        let _ = state_tx.send(ChannelState::Disconnected);
                        pending_delay = Some(jittered(backoff.next()));
                        false
                    }
                }
            } => {
                if fatal {
                    break;
                }
            }
        }
    }
    let _ = state_tx.send(ChannelState::Stopped);
}

async fn run_connection_once(
    endpoints: &Endpoints,
    session_rx: &watch::Receiver<Option<SessionState>>,
    event_tx: &broadcast::Sender<PushEvent>,
    state_tx: &watch::Sender<ChannelState>,
    malformed: &AtomicU64,
    stop_rx: &mut broadcast::Receiver<()>,
) -> Result<Outcome> {
    let session = session_rx
        .borrow()
        .clone()
        .ok_or(EchoError::NotAuthenticated)?;
    tracing::info!(
        "connecting to push gateway as device {}",
        hide_serial(&session.registration_serial)
    );

    let url = endpoints.push_url(&session.registration_serial);
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "Cookie",
        HeaderValue::from_str(&session.cookie_header())
            .map_err(|_| EchoError::Protocol("cookie header contains invalid bytes".to_string()))?,
    );
    headers.insert(
        "Origin",
        HeaderValue::from_str(&endpoints.origin())
            .map_err(|_| EchoError::Protocol("origin contains invalid bytes".to_string()))?,
    );
    headers.insert("User-Agent", HeaderValue::from_static(USER_AGENT));

    let (socket, _response) = tokio::select! {
        _ = stop_rx.recv() => return Ok(Outcome::Stopped),
        connected = timeout(CONNECT_TIMEOUT, connect_async(request)) => match connected {
            Ok(connected) => connected?,
            Err(_) => return Err(EchoError::Timeout),
        },
    };
    let (mut write, mut read) = socket.split();

    // Tuning and registration, spaced the way the stock client spaces them
    let handshake = [
        frame::hello(),
        frame::capabilities(),
        frame::gateway_handshake(),
        frame::register_connection(),
        frame::ping(),
    ];
    for data in handshake {
        write.send(Message::Binary(data)).await?;
        sleep(Duration::from_millis(100)).await;
    }
    let _ = state_tx.send(ChannelState::Connected);
    tracing::info!("push channel established");

    let mut keepalive = tokio::time::interval_at(Instant::now() + KEEPALIVE, KEEPALIVE);
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                let _ = write.close().await;
                return Ok(Outcome::Stopped);
            }
            _ = keepalive.tick() => {
                tracing::debug!("sending keepalive ping");
                if write.send(Message::Binary(frame::ping())).await.is_err() {
                    return Ok(Outcome::Dropped);
                }
            }
            message = read.next() => match message {
                None => {
                    tracing::info!("push gateway closed the connection");
                    return Ok(Outcome::Dropped);
                }
                Some(Err(e)) => {
                    tracing::warn!("push socket error: {}", e);
                    return Ok(Outcome::Dropped);
                }
                Some(Ok(Message::Binary(data))) => {
                    handle_frame(&data, event_tx, malformed);
                }
                Some(Ok(Message::Text(text))) => {
                    handle_frame(text.as_bytes(), event_tx, malformed);
                }
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("push gateway sent close");
                    return Ok(Outcome::Dropped);
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

fn handle_frame(data: &[u8], event_tx: &broadcast::Sender<PushEvent>, malformed: &AtomicU64) {
    match frame::decode(data) {
        Ok(frame) => {
            if let Frame::RegistrationAck(ack) = &frame {
                tracing::debug!("gateway acknowledged registration {}", ack.connection_uuid);
            }
            if let Some(event) = frame::decode_event(&frame) {
                let _ = event_tx.send(event);
            }
        }
        Err(e) => {
            let count = malformed.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!("ignoring malformed push frame ({} so far): {}", count, e);
        }
    }
}

/// Errors that retrying cannot fix: the gateway refused our credentials,
/// or we have none
fn is_fatal(err: &EchoError) -> bool {
    match err {
        EchoError::NotAuthenticated => true,
        EchoError::WebSocket(tungstenite::Error::Http(response)) => {
            matches!(response.status().as_u16(), 401 | 403)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, cap_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(base_ms),
            factor: 2,
            cap: Duration::from_millis(cap_ms),
            stability_threshold: Duration::from_secs(30),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(policy(1000, 60_000));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next().as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 32000, 60000, 60000]);
    }

    #[test]
    fn backoff_is_monotone_until_reset() {
        let mut backoff = Backoff::new(policy(100, 6000));
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let next = backoff.next();
            assert!(next >= last);
            last = next;
        }
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_half_to_full() {
        let delay = Duration::from_millis(8000);
        for _ in 0..100 {
            let jittered = jittered(delay);
            assert!(jittered >= delay / 2, "{jittered:?} below half");
            assert!(jittered <= delay, "{jittered:?} above full");
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn fatal_classification() {
        assert!(is_fatal(&EchoError::NotAuthenticated));
        assert!(!is_fatal(&EchoError::Timeout));
        assert!(!is_fatal(&EchoError::Protocol("x".to_string())));

        let response = tungstenite::http::Response::builder()
            .status(401)
            .body(None)
            .unwrap();
        assert!(is_fatal(&EchoError::WebSocket(tungstenite::Error::Http(
            response
        ))));

        let response = tungstenite::http::Response::builder()
            .status(502)
            .body(None)
            .unwrap();
        assert!(!is_fatal(&EchoError::WebSocket(tungstenite::Error::Http(
            response
        ))));
    }
}
