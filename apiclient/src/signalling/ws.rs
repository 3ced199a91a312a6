// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::Message,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use acpcommon::messages::{auth::Ticket, signalling::Envelope};

use crate::ExponentialBackoff;

use super::{AID_HEADER, COOKIE_HEADER, ConnectionStatus, SignallingEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTGOING_CHANNEL_CAPACITY: usize = 64;

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SignallingConnectError {
    #[error("Malformed signalling URL or credentials")]
    BadRequest,
}

#[derive(Debug, Error)]
pub enum SignallingSendError {
    /// Frames are rejected, not queued, while the transport is away from
    /// `Connected`.
    #[error("The transport is not connected (status: {status:?})")]
    NotConnected { status: ConnectionStatus },
    #[error("Envelope could not be serialized")]
    Encode(#[from] acpcommon::messages::signalling::EnvelopeError),
    #[error("The connection task is gone")]
    TaskGone,
}

/// A signalling connection to the presence server.
///
/// The connection task reconnects transparently with exponential backoff on
/// unexpected close; each drop manifests as a
/// [`SignallingEvent::StatusChange`] pair. The connection is closed for good
/// by [`SignallingConnection::disconnect`].
pub struct SignallingConnection {
    event_tx: broadcast::Sender<SignallingEvent>,
    out_tx: mpsc::Sender<String>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SignallingConnection {
    /// Open a connection to the signalling server named in the ticket. The
    /// handshake carries the agent id and sign cookie as headers.
    pub fn connect(
        ticket: &Ticket,
        keepalive: Duration,
    ) -> Result<Self, SignallingConnectError> {
        let mut request = ticket
            .signalling_url
            .as_str()
            .into_client_request()
            .map_err(|_| SignallingConnectError::BadRequest)?;
        let headers = request.headers_mut();
        headers.insert(
            AID_HEADER,
            HeaderValue::from_str(&ticket.aid.to_string())
                .map_err(|_| SignallingConnectError::BadRequest)?,
        );
        headers.insert(
            COOKIE_HEADER,
            HeaderValue::from_str(&ticket.sign_cookie)
                .map_err(|_| SignallingConnectError::BadRequest)?,
        );

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let cancel = CancellationToken::new();

        let task = ConnectionTask {
            request,
            event_tx: event_tx.clone(),
            status_tx,
            out_rx,
            keepalive,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            event_tx,
            out_tx,
            status_rx,
            cancel,
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Subscribe to status changes and incoming frames.
    pub fn subscribe(&self) -> broadcast::Receiver<SignallingEvent> {
        self.event_tx.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Send a frame. Rejected while the transport is not connected; nothing
    /// is queued across reconnects.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SignallingSendError> {
        let status = self.status();
        if status != ConnectionStatus::Connected {
            return Err(SignallingSendError::NotConnected { status });
        }
        let text = envelope.encode()?;
        self.out_tx
            .send(text)
            .await
            .map_err(|_| SignallingSendError::TaskGone)
    }

    /// Close the connection and wait for the connection task to finish.
    /// Further calls are no-ops.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct ConnectionTask {
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    event_tx: broadcast::Sender<SignallingEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    out_rx: mpsc::Receiver<String>,
    keepalive: Duration,
    cancel: CancellationToken,
}

impl ConnectionTask {
    fn set_status(&self, status: ConnectionStatus) {
        let _ = self.status_tx.send(status);
        let _ = self.event_tx.send(SignallingEvent::StatusChange(status));
    }

    async fn run(mut self) {
        let mut backoff =
            ExponentialBackoff::new(RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX);
        let mut first_attempt = true;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.set_status(if first_attempt {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            });
            first_attempt = false;

            match connect_async(clone_request(&self.request)).await {
                Ok((stream, _)) => {
                    info!("signalling transport connected");
                    self.set_status(ConnectionStatus::Connected);
                    backoff.reset();
                    let closed_by_us = self.handle_connection(stream).await;
                    self.set_status(ConnectionStatus::Disconnected);
                    if closed_by_us {
                        break;
                    }
                }
                Err(error) => {
                    warn!(%error, "could not reach the signalling server");
                    self.set_status(ConnectionStatus::Error);
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff.next_backoff()) => {}
            }
        }
        self.set_status(ConnectionStatus::Disconnected);
        debug!("signalling connection task exited");
    }

    /// Drive one established connection. Returns true if the close was
    /// requested locally.
    async fn handle_connection(
        &mut self,
        mut stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> bool {
        let mut keepalive_timer = tokio::time::interval(self.keepalive);
        keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_traffic = Instant::now();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = stream.close(None).await;
                    return true;
                }
                _ = keepalive_timer.tick() => {
                    // Only ping when the line has been quiet for a full
                    // keepalive window.
                    if last_traffic.elapsed() >= self.keepalive
                        && stream.send(Message::Ping(Vec::new())).await.is_err()
                    {
                        return false;
                    }
                }
                outgoing = self.out_rx.recv() => {
                    let Some(text) = outgoing else {
                        // All senders dropped; treat like a local close.
                        let _ = stream.close(None).await;
                        return true;
                    };
                    if let Err(error) = stream.send(Message::Text(text)).await {
                        warn!(%error, "signalling send failed");
                        return false;
                    }
                    last_traffic = Instant::now();
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            last_traffic = Instant::now();
                            match Envelope::decode(&text) {
                                Ok(envelope) => {
                                    let _ = self
                                        .event_tx
                                        .send(SignallingEvent::Frame(envelope));
                                }
                                // Malformed frames are dropped; the stream
                                // stays up.
                                Err(error) => {
                                    warn!(%error, "dropping malformed signalling frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            last_traffic = Instant::now();
                            if stream.send(Message::Pong(payload)).await.is_err() {
                                return false;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("signalling server closed the connection");
                            return false;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(%error, "signalling read failed");
                            return false;
                        }
                    }
                }
            }
        }
    }
}

// `connect_async` consumes its request, so each attempt gets a copy.
fn clone_request(
    request: &tokio_tungstenite::tungstenite::handshake::client::Request,
) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut cloned = tokio_tungstenite::tungstenite::handshake::client::Request::builder()
        .method(request.method().clone())
        .uri(request.uri().clone())
        .body(())
        .expect("rebuilding a request that was already built");
    cloned.headers_mut().extend(
        request
            .headers()
            .iter()
            .map(|(name, value)| (name.clone(), value.clone())),
    );
    cloned
}

#[cfg(test)]
mod tests {
    use acpcommon::{
        identifiers::AgentId,
        messages::signalling::{Block, FrameType},
    };
    use tokio::net::TcpListener;

    use super::*;

    fn test_ticket(port: u16) -> Ticket {
        Ticket {
            aid: "alice.example.com".parse().unwrap(),
            signalling_url: format!("ws://127.0.0.1:{port}/ws").parse().unwrap(),
            heartbeat_host: "127.0.0.1".into(),
            heartbeat_port: 1,
            sign_cookie: "cookie".into(),
            interval: Duration::from_secs(10),
        }
    }

    fn envelope(content: &str) -> Envelope {
        let alice: AgentId = "alice.example.com".parse().unwrap();
        let bob: AgentId = "bob.example.com".parse().unwrap();
        Envelope::new(FrameType::Msg, alice, vec![bob], vec![Block::content(content)])
    }

    async fn next_status(
        rx: &mut broadcast::Receiver<SignallingEvent>,
    ) -> ConnectionStatus {
        loop {
            if let SignallingEvent::StatusChange(status) = rx.recv().await.unwrap() {
                return status;
            }
        }
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Loopback server: sends one envelope, then echoes nothing and
        // forwards what it receives back to the test.
        let (server_seen_tx, mut server_seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(envelope("from-server").encode().unwrap()))
                .await
                .unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let _ = server_seen_tx.send(Envelope::decode(&text).unwrap());
                }
            }
        });

        let connection =
            SignallingConnection::connect(&test_ticket(port), Duration::from_secs(5)).unwrap();
        let mut events = connection.subscribe();

        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        // Server -> client.
        let frame = loop {
            if let SignallingEvent::Frame(frame) = events.recv().await.unwrap() {
                break frame;
            }
        };
        assert_eq!(frame.content_as_string(), "from-server");

        // Client -> server.
        connection.send(&envelope("from-client")).await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(5), server_seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen.content_as_string(), "from-client");

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn sends_are_rejected_while_not_connected() {
        // Nothing listens on this port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connection =
            SignallingConnection::connect(&test_ticket(port), Duration::from_secs(5)).unwrap();
        let error = connection.send(&envelope("x")).await.unwrap_err();
        assert!(matches!(error, SignallingSendError::NotConnected { .. }));
        connection.disconnect().await;
    }

    #[tokio::test]
    async fn reconnects_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            // Accept, immediately close, then accept again and stay up.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let connection =
            SignallingConnection::connect(&test_ticket(port), Duration::from_secs(5)).unwrap();
        let mut events = connection.subscribe();

        let mut connected_count = 0;
        let mut saw_reconnecting = false;
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match next_status(&mut events).await {
                    ConnectionStatus::Connected => {
                        connected_count += 1;
                        if connected_count == 2 {
                            break;
                        }
                    }
                    ConnectionStatus::Reconnecting => saw_reconnecting = true,
                    _ => {}
                }
            }
        })
        .await
        .expect("transport never reconnected");
        assert!(saw_reconnecting);

        connection.disconnect().await;
    }
}
