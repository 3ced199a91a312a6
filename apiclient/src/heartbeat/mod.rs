// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The UDP heartbeat engine.
//!
//! One engine runs per online identity. It keeps the presence alive from the
//! moment the identity goes online until it goes offline, detects silent
//! death of the path promptly, and heals itself without user intervention.
//!
//! Lifecycle: `Init → Signing → Sending ↔ Reconnecting → Stopped`. The
//! current state is published on a watch channel. Exactly one send loop and
//! one receive loop run while the engine is live. The socket slot is the
//! only place a socket lives; it is either absent or bound, and all slot
//! mutations happen under its mutex. Reconnects serialize on a dedicated
//! mutex and are deduplicated by a socket generation counter, so induced
//! failure bursts cause at most one reconnect per
//! [`HeartbeatConfig::reconnect_min_interval`].

use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{Mutex, watch},
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use acpcommon::{
    crypto::signatures::AgentSigningKey,
    identifiers::AgentId,
    messages::{
        auth::Ticket,
        heartbeat::{HeartbeatCodecError, HeartbeatRecord, HeartbeatResponse},
    },
};

use crate::{ExponentialBackoff, auth_api::AuthApiError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Init,
    Signing,
    Sending,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub max_send_failures: u32,
    pub max_recv_failures: u32,
    pub max_missed_heartbeats: u32,
    pub socket_timeout: Duration,
    pub reconnect_backoff_initial: Duration,
    pub reconnect_backoff_max: Duration,
    /// Lower bound on the time between two reconnect attempts.
    pub reconnect_min_interval: Duration,
    /// Bound on joining each loop during shutdown.
    pub join_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_send_failures: 3,
            max_recv_failures: 3,
            max_missed_heartbeats: 3,
            socket_timeout: Duration::from_secs(1),
            reconnect_backoff_initial: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(30),
            reconnect_min_interval: Duration::from_secs(5),
            join_timeout: Duration::from_secs(3),
        }
    }
}

/// Seam through which the engine re-obtains a ticket during reconnect. The
/// production implementation wraps [`crate::ApiClient::sign_in`].
pub trait Reauthenticate: Send + Sync {
    fn sign_in(&self) -> BoxFuture<'_, Result<Ticket, AuthApiError>>;
}

/// Invoked with every accepted heartbeat response.
pub type ResponseHandler = Box<dyn Fn(HeartbeatResponse) + Send + Sync>;

#[derive(Debug, Error)]
pub enum HeartbeatStartError {
    #[error("Could not bind the heartbeat socket")]
    Bind(#[source] std::io::Error),
}

#[derive(Debug, Error)]
enum SendError {
    #[error("No socket is currently bound")]
    NoSocket,
    #[error(transparent)]
    Codec(#[from] HeartbeatCodecError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct HeartbeatEngine {
    inner: Arc<EngineInner>,
    send_handle: Option<JoinHandle<()>>,
    recv_handle: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: HeartbeatConfig,
    aid: AgentId,
    signing_key: AgentSigningKey,
    reauth: Arc<dyn Reauthenticate>,
    on_response: Option<ResponseHandler>,
    state_tx: watch::Sender<HeartbeatState>,
    stop: CancellationToken,
    /// The socket slot. Mutations only under this mutex; I/O runs on the
    /// cloned [`Arc`] outside of it.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    reconnect_lock: Mutex<ReconnectHistory>,
    ticket: StdMutex<Ticket>,
    send_failures: AtomicU32,
    recv_failures: AtomicU32,
    last_response: StdMutex<Option<Instant>>,
    interval: StdMutex<Duration>,
    /// Bumped on every successful rebind. Loops capture it when they observe
    /// a failure, so a reconnect that already happened is not repeated.
    generation: AtomicU64,
}

impl HeartbeatEngine {
    /// Bind the heartbeat socket for the given ticket and start the send and
    /// receive loops.
    pub async fn spawn(
        config: HeartbeatConfig,
        aid: AgentId,
        signing_key: AgentSigningKey,
        reauth: Arc<dyn Reauthenticate>,
        ticket: Ticket,
        on_response: Option<ResponseHandler>,
    ) -> Result<Self, HeartbeatStartError> {
        let socket = bind_socket(&ticket)
            .await
            .map_err(HeartbeatStartError::Bind)?;
        let (state_tx, _) = watch::channel(HeartbeatState::Init);
        let interval = effective_interval(&ticket);
        let inner = Arc::new(EngineInner {
            config,
            aid,
            signing_key,
            reauth,
            on_response,
            state_tx,
            stop: CancellationToken::new(),
            socket: Mutex::new(Some(Arc::new(socket))),
            reconnect_lock: Mutex::new(ReconnectHistory { last_attempt: None }),
            ticket: StdMutex::new(ticket),
            send_failures: AtomicU32::new(0),
            recv_failures: AtomicU32::new(0),
            last_response: StdMutex::new(None),
            interval: StdMutex::new(interval),
            generation: AtomicU64::new(0),
        });
        inner.state_tx.send_replace(HeartbeatState::Sending);

        let send_inner = inner.clone();
        let send_handle = tokio::spawn(async move { send_inner.send_loop().await });
        let recv_inner = inner.clone();
        let recv_handle = tokio::spawn(async move { recv_inner.recv_loop().await });

        Ok(Self {
            inner,
            send_handle: Some(send_handle),
            recv_handle: Some(recv_handle),
        })
    }

    pub fn state(&self) -> HeartbeatState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<HeartbeatState> {
        self.inner.state_tx.subscribe()
    }

    /// Stop the engine. Order matters: clear the run flag first, then close
    /// the socket to unblock the receive loop, then join both loops with a
    /// bounded timeout.
    pub async fn stop(&mut self) {
        self.inner.stop.cancel();
        *self.inner.socket.lock().await = None;
        for handle in [self.send_handle.take(), self.recv_handle.take()] {
            let Some(mut handle) = handle else { continue };
            if timeout(self.inner.config.join_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("heartbeat loop did not stop in time, aborting it");
                handle.abort();
            }
        }
        self.inner.state_tx.send_replace(HeartbeatState::Stopped);
    }
}

struct ReconnectHistory {
    last_attempt: Option<Instant>,
}

impl EngineInner {
    fn current_interval(&self) -> Duration {
        *self.interval.lock().unwrap()
    }

    async fn send_loop(self: Arc<Self>) {
        let mut backoff = ExponentialBackoff::new(
            self.config.reconnect_backoff_initial,
            self.config.reconnect_backoff_max,
        );
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            if *self.state_tx.borrow() != HeartbeatState::Sending {
                // Idle until the engine is back in the sending state.
                let mut state_rx = self.state_tx.subscribe();
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = state_rx.changed() => continue,
                }
            }

            // Silent-death detection: responses stopped arriving although at
            // least one was seen on this socket.
            let interval = self.current_interval();
            let deadline = interval * self.config.max_missed_heartbeats;
            let last_response = *self.last_response.lock().unwrap();
            if let Some(last_response) = last_response {
                if last_response.elapsed() > deadline {
                    warn!(aid = %self.aid, "heartbeat responses stopped arriving");
                    let generation = self.generation.load(Ordering::Acquire);
                    self.reconnect(generation).await;
                    continue;
                }
            }

            match self.send_heartbeat().await {
                Ok(()) => {
                    self.send_failures.store(0, Ordering::Release);
                    backoff.reset();
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                Err(error) => {
                    let failures = self.send_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(aid = %self.aid, %error, failures, "heartbeat send failed");
                    if failures >= self.config.max_send_failures {
                        let generation = self.generation.load(Ordering::Acquire);
                        self.reconnect(generation).await;
                    } else {
                        tokio::select! {
                            _ = self.stop.cancelled() => break,
                            _ = tokio::time::sleep(backoff.next_backoff()) => {}
                        }
                    }
                }
            }
        }
        debug!(aid = %self.aid, "heartbeat send loop exited");
    }

    async fn send_heartbeat(&self) -> Result<(), SendError> {
        let socket = self
            .socket
            .lock()
            .await
            .clone()
            .ok_or(SendError::NoSocket)?;
        let sign_cookie = self.ticket.lock().unwrap().sign_cookie.clone();
        let record = HeartbeatRecord::new_signed(self.aid.clone(), &sign_cookie, |payload| {
            self.signing_key.sign(payload)
        });
        socket.send(&record.encode()?).await?;
        Ok(())
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = [0u8; 2048];
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            let (socket, generation) = {
                let guard = self.socket.lock().await;
                (guard.clone(), self.generation.load(Ordering::Acquire))
            };
            let Some(socket) = socket else {
                // No socket while a reconnect is in flight.
                tokio::select! {
                    _ = self.stop.cancelled() => break,
                    _ = tokio::time::sleep(self.config.socket_timeout) => continue,
                }
            };
            match timeout(self.config.socket_timeout, socket.recv(&mut buf)).await {
                // A read timeout is not an error; it only rechecks the run
                // flag.
                Err(_elapsed) => continue,
                Ok(Ok(len)) => {
                    self.recv_failures.store(0, Ordering::Release);
                    *self.last_response.lock().unwrap() = Some(Instant::now());
                    match HeartbeatResponse::decode(&buf[..len]) {
                        Ok(response) if response.is_reauthenticate() => {
                            info!(aid = %self.aid, "heartbeat got a 401, reauthenticating");
                            self.reconnect(generation).await;
                        }
                        Ok(response) => {
                            if response.next_beat > 0 {
                                *self.interval.lock().unwrap() =
                                    Duration::from_secs(response.next_beat.into());
                            }
                            if let Some(handler) = &self.on_response {
                                handler(response);
                            }
                        }
                        Err(error) => {
                            warn!(aid = %self.aid, %error, "dropping malformed heartbeat response");
                        }
                    }
                }
                Ok(Err(error)) => {
                    let failures = self.recv_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(aid = %self.aid, %error, failures, "heartbeat recv failed");
                    if failures >= self.config.max_recv_failures {
                        self.reconnect(generation).await;
                    } else {
                        tokio::select! {
                            _ = self.stop.cancelled() => break,
                            _ = tokio::time::sleep(self.config.socket_timeout) => {}
                        }
                    }
                }
            }
        }
        debug!(aid = %self.aid, "heartbeat recv loop exited");
    }

    /// The single recovery path. `observed_generation` is the socket
    /// generation the caller saw when it decided to reconnect; if the
    /// generation moved on, another loop already healed the engine and this
    /// call is a no-op.
    async fn reconnect(&self, observed_generation: u64) {
        let mut history = self.reconnect_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed_generation {
            return;
        }
        if self.stop.is_cancelled() {
            return;
        }
        self.state_tx.send_replace(HeartbeatState::Reconnecting);

        // Rate-limit reconnection.
        if let Some(last_attempt) = history.last_attempt {
            let elapsed = last_attempt.elapsed();
            if elapsed < self.config.reconnect_min_interval {
                let wait = self.config.reconnect_min_interval - elapsed;
                tokio::select! {
                    _ = self.stop.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        history.last_attempt = Some(Instant::now());

        // Close the current socket before anything else. No heartbeat can
        // reach the old server from here on.
        *self.socket.lock().await = None;

        let mut backoff = ExponentialBackoff::new(
            self.config.reconnect_backoff_initial,
            self.config.reconnect_backoff_max,
        );
        loop {
            if self.stop.is_cancelled() {
                return;
            }
            self.state_tx.send_replace(HeartbeatState::Signing);
            let attempt = async {
                let ticket = self.reauth.sign_in().await.map_err(ReconnectError::SignIn)?;
                let socket = bind_socket(&ticket).await.map_err(ReconnectError::Bind)?;
                Ok::<_, ReconnectError>((ticket, socket))
            }
            .await;
            match attempt {
                Ok((ticket, socket)) => {
                    *self.socket.lock().await = Some(Arc::new(socket));
                    *self.interval.lock().unwrap() = effective_interval(&ticket);
                    *self.ticket.lock().unwrap() = ticket;
                    self.send_failures.store(0, Ordering::Release);
                    self.recv_failures.store(0, Ordering::Release);
                    *self.last_response.lock().unwrap() = None;
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    self.state_tx.send_replace(HeartbeatState::Sending);
                    info!(aid = %self.aid, "heartbeat reconnected");
                    return;
                }
                Err(error) => {
                    warn!(aid = %self.aid, %error, "heartbeat reconnect attempt failed");
                    self.state_tx.send_replace(HeartbeatState::Reconnecting);
                    tokio::select! {
                        _ = self.stop.cancelled() => return,
                        _ = tokio::time::sleep(backoff.next_backoff()) => {}
                    }
                }
            }
        }
    }
}

#[derive(Debug, Error)]
enum ReconnectError {
    #[error(transparent)]
    SignIn(AuthApiError),
    #[error("Could not bind a fresh heartbeat socket: {0}")]
    Bind(std::io::Error),
}

async fn bind_socket(ticket: &Ticket) -> Result<UdpSocket, std::io::Error> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect((ticket.heartbeat_host.as_str(), ticket.heartbeat_port))
        .await?;
    Ok(socket)
}

// A server interval of zero would spin the send loop.
fn effective_interval(ticket: &Ticket) -> Duration {
    if ticket.interval.is_zero() {
        Duration::from_secs(1)
    } else {
        ticket.interval
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use acpcommon::messages::heartbeat::{
        HEARTBEAT_CODE_OK, HEARTBEAT_CODE_REAUTHENTICATE,
    };

    use super::*;

    struct StubReauth {
        ticket: Ticket,
        calls: AtomicUsize,
    }

    impl Reauthenticate for StubReauth {
        fn sign_in(&self) -> BoxFuture<'_, Result<Ticket, AuthApiError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ticket = self.ticket.clone();
            Box::pin(async move { Ok(ticket) })
        }
    }

    fn test_ticket(port: u16, interval: Duration) -> Ticket {
        Ticket {
            aid: "alice.example.com".parse().unwrap(),
            signalling_url: "ws://127.0.0.1:1/ws".parse().unwrap(),
            heartbeat_host: "127.0.0.1".into(),
            heartbeat_port: port,
            sign_cookie: "cookie".into(),
            interval,
        }
    }

    fn test_config() -> HeartbeatConfig {
        HeartbeatConfig {
            socket_timeout: Duration::from_millis(50),
            reconnect_backoff_initial: Duration::from_millis(10),
            reconnect_backoff_max: Duration::from_millis(40),
            reconnect_min_interval: Duration::from_millis(10),
            join_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn spawn_engine(
        config: HeartbeatConfig,
        ticket: Ticket,
        reauth: Arc<StubReauth>,
    ) -> HeartbeatEngine {
        let key = AgentSigningKey::generate().unwrap();
        HeartbeatEngine::spawn(
            config,
            "alice.example.com".parse().unwrap(),
            key,
            reauth,
            ticket,
            None,
        )
        .await
        .unwrap()
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<HeartbeatState>,
        wanted: HeartbeatState,
    ) {
        timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() == wanted {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("engine never reached {wanted:?}"));
    }

    #[tokio::test]
    async fn sends_signed_heartbeats_and_stops_cleanly() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, peer) = server.recv_from(&mut buf).await.unwrap();
                let record = HeartbeatRecord::decode(&buf[..len]).unwrap();
                let _ = seen_tx.send(record);
                let response = HeartbeatResponse {
                    code: HEARTBEAT_CODE_OK,
                    next_beat: 1,
                };
                server.send_to(&response.encode(), peer).await.unwrap();
            }
        });

        let ticket = test_ticket(port, Duration::from_millis(100));
        let reauth = Arc::new(StubReauth {
            ticket: ticket.clone(),
            calls: AtomicUsize::new(0),
        });
        let mut engine = spawn_engine(test_config(), ticket, reauth.clone()).await;

        let record = timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.aid.to_string(), "alice.example.com");
        assert_eq!(engine.state(), HeartbeatState::Sending);
        // No reconnect happened on the happy path.
        assert_eq!(reauth.calls.load(Ordering::SeqCst), 0);

        engine.stop().await;
        assert_eq!(engine.state(), HeartbeatState::Stopped);
    }

    #[tokio::test]
    async fn reauthenticates_on_401() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        // First response is a 401, everything afterwards is OK.
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let mut first = true;
            loop {
                let (_, peer) = server.recv_from(&mut buf).await.unwrap();
                let code = if first {
                    first = false;
                    HEARTBEAT_CODE_REAUTHENTICATE
                } else {
                    HEARTBEAT_CODE_OK
                };
                let response = HeartbeatResponse { code, next_beat: 1 };
                server.send_to(&response.encode(), peer).await.unwrap();
            }
        });

        let ticket = test_ticket(port, Duration::from_millis(50));
        let reauth = Arc::new(StubReauth {
            ticket: ticket.clone(),
            calls: AtomicUsize::new(0),
        });
        let mut engine = spawn_engine(test_config(), ticket, reauth.clone()).await;
        let mut state_rx = engine.subscribe();

        // The engine re-signs in and resumes sending on the fresh socket.
        timeout(Duration::from_secs(5), async {
            loop {
                if reauth.calls.load(Ordering::SeqCst) >= 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("engine never reauthenticated");
        wait_for_state(&mut state_rx, HeartbeatState::Sending).await;

        engine.stop().await;
    }

    #[tokio::test]
    async fn silent_server_triggers_reconnect() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        // Answer only the very first heartbeat, then go silent.
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (_, peer) = server.recv_from(&mut buf).await.unwrap();
            let response = HeartbeatResponse {
                code: HEARTBEAT_CODE_OK,
                next_beat: 0,
            };
            server.send_to(&response.encode(), peer).await.unwrap();
            loop {
                let _ = server.recv_from(&mut buf).await.unwrap();
            }
        });

        let ticket = test_ticket(port, Duration::from_millis(50));
        let reauth = Arc::new(StubReauth {
            ticket: ticket.clone(),
            calls: AtomicUsize::new(0),
        });
        let mut engine = spawn_engine(test_config(), ticket, reauth.clone()).await;
        let mut state_rx = engine.subscribe();

        // The reconnect path re-signs in, then the engine resumes sending.
        timeout(Duration::from_secs(5), async {
            loop {
                if reauth.calls.load(Ordering::SeqCst) >= 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("silent server did not trigger a reconnect");
        wait_for_state(&mut state_rx, HeartbeatState::Sending).await;

        engine.stop().await;
    }
}
