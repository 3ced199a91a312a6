// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Handler registry and routing rules.
//!
//! A handler registered with a session id claims that session's envelopes
//! exclusively. Envelopes with no session-scoped handler fall through to the
//! global handlers, which run in registration order until one reports the
//! envelope as handled. Dispatch works on snapshots, so handlers can be
//! added or removed while a delivery is in flight.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use futures_util::future::BoxFuture;

use acpcommon::{
    identifiers::{MessageId, SessionId},
    messages::signalling::Envelope,
};

/// An async message handler. Returning `true` marks the envelope as handled
/// and stops further global dispatch.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, envelope: Envelope) -> BoxFuture<'_, bool>;

    /// One-shot handlers report themselves as expired after firing; the
    /// dispatcher drops them on the next pass.
    fn expired(&self) -> bool {
        false
    }
}

#[derive(Default)]
pub(crate) struct HandlerTables {
    session: HashMap<SessionId, Vec<Arc<dyn MessageHandler>>>,
    global: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerTables {
    pub(crate) fn add(
        &mut self,
        handler: Arc<dyn MessageHandler>,
        session_id: Option<SessionId>,
    ) {
        match session_id {
            Some(session_id) => self.session.entry(session_id).or_default().push(handler),
            None => self.global.push(handler),
        }
    }

    pub(crate) fn remove(
        &mut self,
        handler: &Arc<dyn MessageHandler>,
        session_id: Option<&SessionId>,
    ) {
        match session_id {
            Some(session_id) => {
                if let Some(handlers) = self.session.get_mut(session_id) {
                    handlers.retain(|h| !Arc::ptr_eq(h, handler));
                    if handlers.is_empty() {
                        self.session.remove(session_id);
                    }
                }
            }
            None => self.global.retain(|h| !Arc::ptr_eq(h, handler)),
        }
    }

    /// Drop handlers that reported themselves expired.
    pub(crate) fn sweep_expired(&mut self) {
        self.session.retain(|_, handlers| {
            handlers.retain(|h| !h.expired());
            !handlers.is_empty()
        });
        self.global.retain(|h| !h.expired());
    }

    /// Snapshot the handlers responsible for an envelope of the given
    /// session. Session-scoped handlers claim exclusively; an empty session
    /// table falls through to the globals.
    pub(crate) fn route(&self, session_id: Option<&SessionId>) -> Vec<Arc<dyn MessageHandler>> {
        if let Some(session_id) = session_id {
            if let Some(handlers) = self.session.get(session_id) {
                if !handlers.is_empty() {
                    return handlers.clone();
                }
            }
        }
        self.global.clone()
    }

    pub(crate) fn has_session_handler(&self, session_id: &SessionId) -> bool {
        self.session
            .get(session_id)
            .is_some_and(|handlers| !handlers.is_empty())
    }
}

/// Bounded window of recently seen message ids; duplicates within the
/// window are dropped.
pub(crate) struct DedupeWindow {
    capacity: usize,
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

impl DedupeWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns false if the id was already in the window.
    pub(crate) fn insert(&mut self, message_id: MessageId) -> bool {
        if !self.seen.insert(message_id) {
            return false;
        }
        self.order.push_back(message_id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use acpcommon::{
        identifiers::AgentId,
        messages::signalling::{Block, FrameType},
    };

    use super::*;

    struct CountingHandler {
        calls: AtomicUsize,
        claims: bool,
    }

    impl CountingHandler {
        fn new(claims: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                claims,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl MessageHandler for CountingHandler {
        fn handle(&self, _envelope: Envelope) -> BoxFuture<'_, bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let claims = self.claims;
            Box::pin(async move { claims })
        }
    }

    fn envelope(session: &SessionId) -> Envelope {
        let alice: AgentId = "alice.example.com".parse().unwrap();
        let bob: AgentId = "bob.example.com".parse().unwrap();
        Envelope::new(FrameType::Msg, alice, vec![bob], vec![Block::content("x")])
            .with_session(session.clone())
    }

    async fn deliver(tables: &HandlerTables, envelope: Envelope) {
        let handlers = tables.route(envelope.session_id());
        for handler in handlers {
            if handler.handle(envelope.clone()).await {
                break;
            }
        }
    }

    #[tokio::test]
    async fn session_handlers_claim_exclusively() {
        let session = SessionId::new("s1".into());
        let other = SessionId::new("s2".into());
        let mut tables = HandlerTables::default();
        let scoped = CountingHandler::new(false);
        let global = CountingHandler::new(true);
        tables.add(scoped.clone(), Some(session.clone()));
        tables.add(global.clone(), None);

        deliver(&tables, envelope(&session)).await;
        // The session handler got it; the global handler did not.
        assert_eq!(scoped.calls(), 1);
        assert_eq!(global.calls(), 0);

        // Envelopes of other sessions fall through to the globals.
        deliver(&tables, envelope(&other)).await;
        assert_eq!(scoped.calls(), 1);
        assert_eq!(global.calls(), 1);
    }

    #[tokio::test]
    async fn globals_run_in_order_until_one_claims() {
        let session = SessionId::new("s1".into());
        let mut tables = HandlerTables::default();
        let first = CountingHandler::new(false);
        let second = CountingHandler::new(true);
        let third = CountingHandler::new(true);
        tables.add(first.clone(), None);
        tables.add(second.clone(), None);
        tables.add(third.clone(), None);

        deliver(&tables, envelope(&session)).await;
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        // The second handler claimed the envelope.
        assert_eq!(third.calls(), 0);
    }

    #[test]
    fn removal_is_safe_by_identity() {
        let session = SessionId::new("s1".into());
        let mut tables = HandlerTables::default();
        let a = CountingHandler::new(false);
        let b = CountingHandler::new(false);
        tables.add(a.clone(), Some(session.clone()));
        tables.add(b.clone(), Some(session.clone()));

        let a_dyn: Arc<dyn MessageHandler> = a;
        tables.remove(&a_dyn, Some(&session));
        assert!(tables.has_session_handler(&session));
        let b_dyn: Arc<dyn MessageHandler> = b;
        tables.remove(&b_dyn, Some(&session));
        assert!(!tables.has_session_handler(&session));
    }

    #[test]
    fn dedupe_window_drops_duplicates_and_evicts() {
        let mut window = DedupeWindow::new(2);
        let a = MessageId::random();
        let b = MessageId::random();
        let c = MessageId::random();
        assert!(window.insert(a));
        assert!(!window.insert(a));
        assert!(window.insert(b));
        assert!(window.insert(c));
        // `a` was evicted; it is accepted again.
        assert!(window.insert(a));
    }
}
