// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session lifecycle and message dispatch on the signalling plane.
//!
//! The manager rides on one [`SignallingConnection`]. Incoming envelopes are
//! routed off the transport loop onto one delivery task per session, which
//! preserves per-session ordering while sessions stay independent of each
//! other. Handshake frames (`session_ack`, `invite_ack`) are correlated with
//! their requests through `ref_msg_id`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use futures_util::{Stream, StreamExt, future::BoxFuture};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use acpapiclient::signalling::{SignallingConnection, SignallingEvent};
use acpcommon::{
    MAX_ENVELOPE_SIZE,
    identifiers::{AgentId, MessageId, SessionId},
    messages::signalling::{
        Block, Envelope, FrameType, InviteAckPayload, InvitePayload, SessionAckPayload,
        SessionCreatePayload, payload_block, payload_from_envelope,
    },
};

use crate::errors::{CoreError, ErrorCode};

pub(crate) mod dispatch;
mod stream;

pub use dispatch::MessageHandler;
pub use stream::StreamProgress;

use dispatch::{DedupeWindow, HandlerTables};
use stream::StreamAssembler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionManagerConfig {
    /// Timeout for the session-create and invite handshakes.
    pub handshake_timeout: Duration,
    /// Lifetime of the one-shot reply handler installed by `quick_send`.
    pub quick_send_timeout: Duration,
    pub max_envelope_size: usize,
    /// Per-session window of message ids used to drop duplicates.
    pub dedupe_window: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            quick_send_timeout: Duration::from_secs(30),
            max_envelope_size: MAX_ENVELOPE_SIZE,
            dedupe_window: 1024,
        }
    }
}

/// Result of the invite handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStatus {
    Accepted,
    Rejected,
    TimedOut,
}

/// Outcome of a successful session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandshake {
    pub session_id: SessionId,
    pub identifying_code: String,
}

#[derive(Debug, Clone)]
struct SessionInfo {
    identifying_code: String,
    #[allow(dead_code)]
    subject: Option<String>,
}

/// Decides whether an incoming invite is accepted. The default accepts
/// everything.
pub type InviteDecider = Arc<dyn Fn(&InvitePayload) -> bool + Send + Sync>;

/// Called with `(session, expected_index, got_index)` when a streamed
/// message arrives with a gap.
pub type StreamErrorHandler = Arc<dyn Fn(&SessionId, i64, i64) + Send + Sync>;

/// Called with the final status of an invite this agent issued.
pub type InviteStatusHandler = Arc<dyn Fn(&SessionId, InviteStatus) + Send + Sync>;

pub struct SessionManager {
    inner: Arc<ManagerInner>,
    dispatch_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

struct ManagerInner {
    aid: AgentId,
    connection: Arc<SignallingConnection>,
    config: SessionManagerConfig,
    handlers: StdMutex<HandlerTables>,
    pending_acks: StdMutex<HashMap<MessageId, oneshot::Sender<Envelope>>>,
    sessions: StdMutex<HashMap<SessionId, SessionInfo>>,
    session_queues: StdMutex<HashMap<SessionId, mpsc::UnboundedSender<Envelope>>>,
    dedupe: StdMutex<HashMap<SessionId, DedupeWindow>>,
    invite_decider: StdMutex<Option<InviteDecider>>,
    invite_status_handler: StdMutex<Option<InviteStatusHandler>>,
    stream_error_handler: StdMutex<Option<StreamErrorHandler>>,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Attach a manager to the given connection and start dispatching.
    pub fn start(
        aid: AgentId,
        connection: Arc<SignallingConnection>,
        config: SessionManagerConfig,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            aid,
            connection,
            config,
            handlers: StdMutex::new(HandlerTables::default()),
            pending_acks: StdMutex::new(HashMap::new()),
            sessions: StdMutex::new(HashMap::new()),
            session_queues: StdMutex::new(HashMap::new()),
            dedupe: StdMutex::new(HashMap::new()),
            invite_decider: StdMutex::new(None),
            invite_status_handler: StdMutex::new(None),
            stream_error_handler: StdMutex::new(None),
            cancel: CancellationToken::new(),
        });
        let dispatch_inner = inner.clone();
        let dispatch_handle = tokio::spawn(async move { dispatch_inner.dispatch_loop().await });
        Self {
            inner,
            dispatch_handle: StdMutex::new(Some(dispatch_handle)),
        }
    }

    /// Stop intake. In-flight handler invocations finish on their own
    /// tasks. Further calls are no-ops.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.dispatch_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // === Handler registry ===

    pub fn add_handler(
        &self,
        handler: Arc<dyn MessageHandler>,
        session_id: Option<SessionId>,
    ) {
        self.inner.handlers.lock().unwrap().add(handler, session_id);
    }

    pub fn remove_handler(
        &self,
        handler: &Arc<dyn MessageHandler>,
        session_id: Option<&SessionId>,
    ) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .remove(handler, session_id);
    }

    pub fn set_invite_decider(&self, decider: InviteDecider) {
        *self.inner.invite_decider.lock().unwrap() = Some(decider);
    }

    pub fn set_invite_status_handler(&self, handler: InviteStatusHandler) {
        *self.inner.invite_status_handler.lock().unwrap() = Some(handler);
    }

    pub fn set_stream_error_handler(&self, handler: StreamErrorHandler) {
        *self.inner.stream_error_handler.lock().unwrap() = Some(handler);
    }

    // === Session operations ===

    /// Create a new session. Returns the server-issued session id together
    /// with the identifying code used during invitation.
    pub async fn create_session(
        &self,
        name: &str,
        subject: Option<&str>,
    ) -> Result<SessionHandshake, CoreError> {
        let payload = SessionCreatePayload {
            name: name.to_owned(),
            subject: subject.map(str::to_owned),
        };
        let envelope = Envelope::new(
            FrameType::SessionCreate,
            self.inner.aid.clone(),
            Vec::new(),
            vec![payload_block(&payload)?],
        );
        let ack = self.inner.request_response(envelope).await?;
        let ack_payload: SessionAckPayload = payload_from_envelope(&ack)?;
        self.inner.sessions.lock().unwrap().insert(
            ack_payload.session_id.clone(),
            SessionInfo {
                identifying_code: ack_payload.identifying_code.clone(),
                subject: subject.map(str::to_owned),
            },
        );
        debug!(session_id = %ack_payload.session_id, "created session");
        Ok(SessionHandshake {
            session_id: ack_payload.session_id,
            identifying_code: ack_payload.identifying_code,
        })
    }

    /// Invite the target into a session, waiting for its acknowledgement.
    pub async fn invite(
        &self,
        target: &AgentId,
        session_id: &SessionId,
        identifying_code: &str,
    ) -> Result<InviteStatus, CoreError> {
        let payload = InvitePayload {
            session_id: session_id.clone(),
            identifying_code: identifying_code.to_owned(),
            subject: None,
        };
        let envelope = Envelope::new(
            FrameType::Invite,
            self.inner.aid.clone(),
            vec![target.clone()],
            vec![payload_block(&payload)?],
        )
        .with_session(session_id.clone());

        let status = match self.inner.request_response(envelope).await {
            Ok(ack) => {
                let ack_payload: InviteAckPayload = payload_from_envelope(&ack)?;
                if ack_payload.identifying_code != identifying_code {
                    return Err(CoreError::protocol(
                        "invite ack bound to a different identifying code",
                    ));
                }
                if ack_payload.accept {
                    InviteStatus::Accepted
                } else {
                    InviteStatus::Rejected
                }
            }
            Err(error) if error.code == ErrorCode::Network => InviteStatus::TimedOut,
            Err(error) => return Err(error),
        };
        if let Some(handler) = self.inner.invite_status_handler.lock().unwrap().clone() {
            handler(session_id, status);
        }
        Ok(status)
    }

    /// Create a session and invite the target into it.
    pub async fn connect_to(&self, target: &AgentId) -> Result<SessionHandshake, CoreError> {
        let handshake = self
            .create_session(&format!("session-with-{target}"), None)
            .await?;
        match self
            .invite(target, &handshake.session_id, &handshake.identifying_code)
            .await?
        {
            InviteStatus::Accepted => Ok(handshake),
            InviteStatus::Rejected => {
                Err(CoreError::state("invite rejected").with_context(target.to_string()))
            }
            InviteStatus::TimedOut => Err(CoreError::new(ErrorCode::Network, "invite timed out")
                .with_context(target.to_string())),
        }
    }

    /// Send a message into a session this agent is a member of.
    pub async fn send(
        &self,
        session_id: &SessionId,
        receivers: Vec<AgentId>,
        blocks: Vec<Block>,
    ) -> Result<MessageId, CoreError> {
        self.inner.require_membership(session_id)?;
        let envelope = Envelope::new(FrameType::Msg, self.inner.aid.clone(), receivers, blocks)
            .with_session(session_id.clone());
        envelope.validate(self.inner.config.max_envelope_size)?;
        let message_id = envelope.message_id;
        self.inner.connection.send(&envelope).await?;
        Ok(message_id)
    }

    /// Send an async sequence of chunks as a stream. Each chunk becomes a
    /// `stream_chunk` block with an increasing index; the terminator closes
    /// the stream. Returns the number of chunks sent.
    pub async fn send_stream(
        &self,
        session_id: &SessionId,
        receivers: Vec<AgentId>,
        chunks: impl Stream<Item = String> + Send,
    ) -> Result<u64, CoreError> {
        self.inner.require_membership(session_id)?;
        let mut chunks = std::pin::pin!(chunks);
        let mut index: i64 = 0;
        while let Some(chunk) = chunks.next().await {
            let envelope = Envelope::new(
                FrameType::Msg,
                self.inner.aid.clone(),
                receivers.clone(),
                vec![Block::stream_chunk(index, chunk)],
            )
            .with_session(session_id.clone());
            envelope.validate(self.inner.config.max_envelope_size)?;
            self.inner.connection.send(&envelope).await?;
            index += 1;
        }
        let terminator = Envelope::new(
            FrameType::Msg,
            self.inner.aid.clone(),
            receivers,
            vec![Block::stream_terminator()],
        )
        .with_session(session_id.clone());
        self.inner.connection.send(&terminator).await?;
        Ok(index as u64)
    }

    /// Reply to a received envelope. The reply points one hop back via
    /// `ref_msg_id`.
    pub async fn reply(
        &self,
        source: &Envelope,
        blocks: Vec<Block>,
    ) -> Result<MessageId, CoreError> {
        let envelope = source.reply_to(self.inner.aid.clone(), blocks);
        envelope.validate(self.inner.config.max_envelope_size)?;
        let message_id = envelope.message_id;
        self.inner.connection.send(&envelope).await?;
        Ok(message_id)
    }

    /// Create a session with the target, send one message, and install a
    /// one-shot handler for the first reply. The handler is removed on first
    /// reply or after the quick-send timeout.
    pub async fn quick_send(
        &self,
        target: &AgentId,
        blocks: Vec<Block>,
        on_reply: impl FnOnce(Envelope) + Send + 'static,
    ) -> Result<SessionId, CoreError> {
        let handshake = self.connect_to(target).await?;
        let handler: Arc<dyn MessageHandler> = Arc::new(OneShotReplyHandler {
            on_reply: StdMutex::new(Some(Box::new(on_reply))),
        });
        self.add_handler(handler.clone(), Some(handshake.session_id.clone()));
        self.send(&handshake.session_id, vec![target.clone()], blocks)
            .await?;

        // Timeout-based removal; firing marks the handler expired, which the
        // dispatcher sweeps on the next delivery.
        let inner = self.inner.clone();
        let session_id = handshake.session_id.clone();
        let timeout = self.inner.config.quick_send_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            inner
                .handlers
                .lock()
                .unwrap()
                .remove(&handler, Some(&session_id));
        });
        Ok(handshake.session_id)
    }

    /// Sessions this manager is currently a member of.
    pub fn known_sessions(&self) -> Vec<SessionId> {
        self.inner.sessions.lock().unwrap().keys().cloned().collect()
    }
}

impl ManagerInner {
    fn require_membership(&self, session_id: &SessionId) -> Result<(), CoreError> {
        if !self.sessions.lock().unwrap().contains_key(session_id) {
            return Err(
                CoreError::state("unknown session").with_context(session_id.to_string())
            );
        }
        Ok(())
    }

    /// Send a handshake frame and await the correlated response.
    async fn request_response(&self, envelope: Envelope) -> Result<Envelope, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .unwrap()
            .insert(envelope.message_id, tx);
        if let Err(error) = self.connection.send(&envelope).await {
            self.pending_acks.lock().unwrap().remove(&envelope.message_id);
            return Err(error.into());
        }
        match tokio::time::timeout(self.config.handshake_timeout, rx).await {
            Ok(Ok(response)) => {
                if response.frame_type == FrameType::Error {
                    return Err(CoreError::protocol(format!(
                        "peer reported an error: {}",
                        response.content_as_string()
                    )));
                }
                Ok(response)
            }
            Ok(Err(_)) => Err(CoreError::internal("ack channel dropped")),
            Err(_elapsed) => {
                self.pending_acks.lock().unwrap().remove(&envelope.message_id);
                Err(CoreError::new(ErrorCode::Network, "handshake timed out"))
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut events = self.connection.subscribe();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(SignallingEvent::Frame(envelope)) => {
                        Self::route_frame(&self, envelope).await
                    }
                    Ok(SignallingEvent::StatusChange(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session dispatch lagged behind the transport");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        debug!(aid = %self.aid, "session dispatch loop exited");
    }

    async fn route_frame(this: &Arc<Self>, envelope: Envelope) {
        // Handshake responses resolve a pending request.
        if let Some(ref_msg_id) = envelope.ref_msg_id {
            if matches!(
                envelope.frame_type,
                FrameType::SessionAck | FrameType::InviteAck | FrameType::Status | FrameType::Error
            ) {
                if let Some(tx) = this.pending_acks.lock().unwrap().remove(&ref_msg_id) {
                    let _ = tx.send(envelope);
                    return;
                }
            }
        }

        match envelope.frame_type {
            FrameType::Invite => Self::handle_invite(this, envelope).await,
            FrameType::SessionCreate | FrameType::SessionAck | FrameType::InviteAck => {
                // Server-plane frames without a pending request are stale.
                debug!(frame = ?envelope.frame_type, "dropping uncorrelated handshake frame");
            }
            FrameType::Msg | FrameType::Status | FrameType::Error => {
                Self::deliver(this, envelope);
            }
        }
    }

    async fn handle_invite(this: &Arc<Self>, envelope: Envelope) {
        let payload: InvitePayload = match payload_from_envelope(&envelope) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%error, "dropping malformed invite");
                return;
            }
        };
        let accept = this
            .invite_decider
            .lock()
            .unwrap()
            .as_ref()
            .map(|decider| decider(&payload))
            .unwrap_or(true);
        if accept {
            this.sessions.lock().unwrap().insert(
                payload.session_id.clone(),
                SessionInfo {
                    identifying_code: payload.identifying_code.clone(),
                    subject: payload.subject.clone(),
                },
            );
        }
        let ack_payload = InviteAckPayload {
            session_id: payload.session_id.clone(),
            identifying_code: payload.identifying_code.clone(),
            accept,
        };
        let Ok(block) = payload_block(&ack_payload) else {
            return;
        };
        let mut ack = Envelope::new(
            FrameType::InviteAck,
            this.aid.clone(),
            vec![envelope.sender().clone()],
            vec![block],
        )
        .with_session(payload.session_id);
        ack.ref_msg_id = Some(envelope.message_id);
        if let Err(error) = this.connection.send(&ack).await {
            warn!(%error, "could not acknowledge invite");
        }
    }

    /// Hand an envelope to its session's delivery task, creating the task on
    /// first use. Duplicate message ids within the dedupe window are
    /// dropped.
    fn deliver(this: &Arc<Self>, envelope: Envelope) {
        let Some(session_id) = envelope.session_id().cloned() else {
            // Session-less envelopes go straight to the global handlers with
            // no ordering guarantee.
            let inner = this.clone();
            tokio::spawn(async move { inner.run_handlers(envelope).await });
            return;
        };

        let fresh = this
            .dedupe
            .lock()
            .unwrap()
            .entry(session_id.clone())
            .or_insert_with(|| DedupeWindow::new(this.config.dedupe_window))
            .insert(envelope.message_id);
        if !fresh {
            debug!(%session_id, message_id = %envelope.message_id, "dropping duplicate envelope");
            return;
        }

        let mut queues = this.session_queues.lock().unwrap();
        let queue = queues.entry(session_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let inner = this.clone();
            tokio::spawn(async move { inner.session_delivery_loop(session_id, rx).await });
            tx
        });
        let _ = queue.send(envelope);
    }

    /// Sequential delivery for one session: stream accounting, then the
    /// handler chain.
    async fn session_delivery_loop(
        self: Arc<Self>,
        session_id: SessionId,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
    ) {
        let mut assembler = StreamAssembler::default();
        loop {
            let envelope = tokio::select! {
                _ = self.cancel.cancelled() => break,
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                }
            };
            if let StreamProgress::Gap { expected, got } = assembler.observe(&envelope) {
                warn!(%session_id, expected, got, "stream gap detected");
                if let Some(handler) = self.stream_error_handler.lock().unwrap().clone() {
                    handler(&session_id, expected, got);
                }
            }
            self.run_handlers(envelope).await;
        }
    }

    async fn run_handlers(&self, envelope: Envelope) {
        let handlers = {
            let mut tables = self.handlers.lock().unwrap();
            tables.sweep_expired();
            tables.route(envelope.session_id())
        };
        for handler in handlers {
            if handler.expired() {
                continue;
            }
            if handler.handle(envelope.clone()).await {
                break;
            }
        }
    }

    #[allow(dead_code)]
    fn identifying_code(&self, session_id: &SessionId) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|info| info.identifying_code.clone())
    }
}

/// One-shot handler installed by `quick_send`: fires on the first reply and
/// reports itself expired afterwards.
struct OneShotReplyHandler {
    on_reply: StdMutex<Option<Box<dyn FnOnce(Envelope) + Send>>>,
}

impl MessageHandler for OneShotReplyHandler {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'_, bool> {
        let callback = self.on_reply.lock().unwrap().take();
        Box::pin(async move {
            if let Some(callback) = callback {
                callback(envelope);
            }
            true
        })
    }

    fn expired(&self) -> bool {
        self.on_reply.lock().unwrap().is_none()
    }
}

#[cfg(test)]
mod tests;
