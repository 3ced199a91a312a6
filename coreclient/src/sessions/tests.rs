// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session manager tests against a loopback signalling router. The router
//! answers `session_create` frames itself and forwards everything else to
//! the connection registered for each receiver id.

use std::{
    collections::HashMap,
    sync::{
        Mutex as StdMutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

use acpapiclient::signalling::{AID_HEADER, ConnectionStatus};
use acpcommon::messages::auth::Ticket;

use super::*;

struct Router {
    clients: StdMutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    session_counter: AtomicU64,
}

impl Router {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: StdMutex::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
        })
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let router = self.clone();
            tokio::spawn(async move {
                let aid_slot = Arc::new(StdMutex::new(None::<String>));
                let header_slot = aid_slot.clone();
                let callback =
                    move |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
                          response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                        let aid = request
                            .headers()
                            .get(AID_HEADER)
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_owned);
                        *header_slot.lock().unwrap() = aid;
                        Ok(response)
                    };
                let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                    .await
                    .unwrap();
                let aid = aid_slot.lock().unwrap().clone().unwrap();
                let (mut writer, mut reader) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel();
                router.clients.lock().unwrap().insert(aid, tx);
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        if writer.send(message).await.is_err() {
                            return;
                        }
                    }
                });
                while let Some(Ok(message)) = reader.next().await {
                    if let Message::Text(text) = message {
                        router.route(&text);
                    }
                }
            });
        }
    }

    fn route(&self, text: &str) {
        let envelope = Envelope::decode(text).unwrap();
        if envelope.frame_type == FrameType::SessionCreate {
            let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
            let payload = SessionAckPayload {
                session_id: SessionId::new(format!("s-{n}")),
                identifying_code: format!("code-{n}"),
            };
            let mut ack = Envelope::new(
                FrameType::SessionAck,
                "router.example.com".parse().unwrap(),
                vec![envelope.sender().clone()],
                vec![payload_block(&payload).unwrap()],
            )
            .with_session(payload.session_id.clone());
            ack.ref_msg_id = Some(envelope.message_id);
            self.send_to(&envelope.sender().to_string(), &ack);
            return;
        }
        for receiver in envelope.receivers() {
            self.send_to(&receiver.to_string(), &envelope);
        }
    }

    fn send_to(&self, aid: &str, envelope: &Envelope) {
        if let Some(tx) = self.clients.lock().unwrap().get(aid) {
            let _ = tx.send(Message::Text(envelope.encode().unwrap()));
        }
    }
}

async fn start_router() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(Router::new().serve(listener));
    port
}

fn ticket_for(aid: &str, port: u16) -> Ticket {
    Ticket {
        aid: aid.parse().unwrap(),
        signalling_url: format!("ws://127.0.0.1:{port}/ws").parse().unwrap(),
        heartbeat_host: "127.0.0.1".into(),
        heartbeat_port: 1,
        sign_cookie: "cookie".into(),
        interval: Duration::from_secs(10),
    }
}

async fn connect_agent(aid: &str, port: u16) -> (Arc<SignallingConnection>, SessionManager) {
    let connection = Arc::new(
        SignallingConnection::connect(&ticket_for(aid, port), Duration::from_secs(30)).unwrap(),
    );
    let mut status = connection.watch_status();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *status.borrow() != ConnectionStatus::Connected {
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("agent never connected");
    let manager = SessionManager::start(
        aid.parse().unwrap(),
        connection.clone(),
        SessionManagerConfig {
            handshake_timeout: Duration::from_secs(5),
            quick_send_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    );
    (connection, manager)
}

struct ForwardHandler {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MessageHandler for ForwardHandler {
    fn handle(&self, envelope: Envelope) -> futures_util::future::BoxFuture<'_, bool> {
        let _ = self.tx.send(envelope);
        Box::pin(async { true })
    }
}

#[tokio::test]
async fn create_invite_send_reply_happy_path() {
    let port = start_router().await;
    let (_alice_conn, alice) = connect_agent("alice.example.com", port).await;
    let (_bob_conn, bob) = connect_agent("bob.example.com", port).await;

    let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
    bob.add_handler(Arc::new(ForwardHandler { tx: bob_tx }), None);
    let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
    alice.add_handler(Arc::new(ForwardHandler { tx: alice_tx }), None);

    let handshake = alice.create_session("s", None).await.unwrap();
    assert!(!handshake.session_id.as_str().is_empty());

    let status = alice
        .invite(
            &"bob.example.com".parse().unwrap(),
            &handshake.session_id,
            &handshake.identifying_code,
        )
        .await
        .unwrap();
    assert_eq!(status, InviteStatus::Accepted);

    alice
        .send(
            &handshake.session_id,
            vec!["bob.example.com".parse().unwrap()],
            vec![Block::content("hi")],
        )
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.content_as_string(), "hi");
    assert_eq!(received.session_id(), Some(&handshake.session_id));

    // Bob replies; the reply points one hop back.
    bob.reply(&received, vec![Block::content("hello back")])
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), alice_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content_as_string(), "hello back");
    assert_eq!(reply.ref_msg_id, Some(received.message_id));
}

#[tokio::test]
async fn quick_send_fires_one_shot_reply_handler() {
    let port = start_router().await;
    let (_alice_conn, alice) = connect_agent("alice.example.com", port).await;
    let (_bob_conn, bob) = connect_agent("bob.example.com", port).await;

    // Bob echoes everything he receives.
    struct EchoHandler {
        manager: Arc<SessionManager>,
    }
    impl MessageHandler for EchoHandler {
        fn handle(&self, envelope: Envelope) -> futures_util::future::BoxFuture<'_, bool> {
            let manager = self.manager.clone();
            Box::pin(async move {
                let _ = manager.reply(&envelope, vec![Block::content("echo")]).await;
                true
            })
        }
    }
    let bob = Arc::new(bob);
    bob.add_handler(
        Arc::new(EchoHandler {
            manager: bob.clone(),
        }),
        None,
    );

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    alice
        .quick_send(
            &"bob.example.com".parse().unwrap(),
            vec![Block::content("ping")],
            move |reply| {
                let _ = reply_tx.send(reply);
            },
        )
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), reply_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.content_as_string(), "echo");
}

#[tokio::test]
async fn streamed_send_arrives_in_order_with_terminator() {
    let port = start_router().await;
    let (_alice_conn, alice) = connect_agent("alice.example.com", port).await;
    let (_bob_conn, bob) = connect_agent("bob.example.com", port).await;

    let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
    bob.add_handler(Arc::new(ForwardHandler { tx: bob_tx }), None);

    let handshake = alice.connect_to(&"bob.example.com".parse().unwrap()).await.unwrap();

    let chunks: Vec<String> = (0..10).map(|i| format!("c{i}-")).collect();
    let sent = alice
        .send_stream(
            &handshake.session_id,
            vec!["bob.example.com".parse().unwrap()],
            futures_util::stream::iter(chunks.clone()),
        )
        .await
        .unwrap();
    assert_eq!(sent, 10);

    let mut seen_indices = Vec::new();
    let mut assembled = String::new();
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let chunk = &envelope.blocks[0];
        let index = chunk.chunk_index().unwrap();
        if index == acpcommon::messages::signalling::STREAM_TERMINATOR_INDEX {
            break;
        }
        seen_indices.push(index);
        assembled.push_str(&chunk.content);
    }
    assert_eq!(seen_indices, (0..10).collect::<Vec<i64>>());
    assert_eq!(assembled, chunks.concat());
}
