// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire client of the group server.
//!
//! Every mutation is a signed request `{op, group_id, actor, nonce, sig,
//! params}` posted over HTTP; reads return the server's JSON verbatim. Push
//! notifications arrive on a separate websocket stream, which wakes the
//! pull loops of the sync engine rather than delivering anything itself.

use futures_util::{SinkExt, StreamExt};
use rand::RngCore as _;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use acpcommon::{
    crypto::signatures::AgentSigningKey,
    identifiers::{AgentId, GroupId},
    messages::group::{GroupPush, GroupRequest, GroupResponse, error_codes},
};

use crate::{
    ApiClient, ExponentialBackoff,
    signalling::{AID_HEADER, COOKIE_HEADER, ConnectionStatus},
};

pub const ENDPOINT_GROUP: &str = "/group";
pub const ENDPOINT_GROUP_PUSH: &str = "/group/push";

#[derive(Debug, Error)]
pub enum GroupApiError {
    #[error("Unknown group or member")]
    NotFound,
    #[error("The actor's role does not permit this operation")]
    Forbidden,
    #[error("Conflicting state on the server: {message}")]
    Conflict { message: String },
    #[error("The server is rate limiting this client")]
    RateLimited,
    #[error("The invite code or lease has expired")]
    Expired,
    #[error("Group server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("The group server rejected the request: {status}")]
    RequestRejected { status: StatusCode },
    #[error("Malformed response from the group server")]
    MalformedResponse(#[source] reqwest::Error),
    #[error("Could not build the request URL")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Network(#[from] reqwest::Error),
}

impl ApiClient {
    /// Issue one signed group operation and return the server's `data`
    /// verbatim.
    pub async fn group_request(
        &self,
        op: &str,
        group_id: Option<&GroupId>,
        actor: &AgentId,
        signing_key: &AgentSigningKey,
        params: Value,
    ) -> Result<Value, GroupApiError> {
        let url = self.build_url(ENDPOINT_GROUP)?;
        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let payload = GroupRequest::signature_payload(op, group_id, actor, &nonce, &params);
        let request = GroupRequest {
            op: op.to_owned(),
            group_id: group_id.cloned(),
            actor: actor.clone(),
            nonce,
            sig: signing_key.sign(&payload),
            params,
        };
        let response = self.post(url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GroupApiError::RequestRejected { status });
        }
        let response: GroupResponse = response
            .json()
            .await
            .map_err(GroupApiError::MalformedResponse)?;
        if response.ok {
            debug!(op, ?group_id, "group operation succeeded");
            return Ok(response.data.unwrap_or(Value::Null));
        }
        let error = response.error.unwrap_or_else(|| {
            acpcommon::messages::group::GroupErrorBody {
                code: "internal".to_owned(),
                message: "server reported failure without an error body".to_owned(),
            }
        });
        Err(match error.code.as_str() {
            error_codes::NOT_FOUND => GroupApiError::NotFound,
            error_codes::FORBIDDEN => GroupApiError::Forbidden,
            error_codes::CONFLICT => GroupApiError::Conflict {
                message: error.message,
            },
            error_codes::RATE_LIMITED => GroupApiError::RateLimited,
            error_codes::EXPIRED => GroupApiError::Expired,
            _ => GroupApiError::Server {
                code: error.code,
                message: error.message,
            },
        })
    }
}

/// Events emitted by the push stream.
#[derive(Debug, Clone)]
pub enum GroupPushEvent {
    StatusChange(ConnectionStatus),
    Push(GroupPush),
}

#[derive(Debug, Error)]
pub enum GroupPushConnectError {
    #[error("Malformed push URL or credentials")]
    BadRequest,
}

/// Websocket stream of push notifications from the group server. Pushes are
/// hints; the pull loops remain the authoritative cursor-advancers, so a
/// dropped push is at worst a delayed poll.
pub struct GroupPushStream {
    event_tx: broadcast::Sender<GroupPushEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

const PUSH_CHANNEL_CAPACITY: usize = 256;

impl GroupPushStream {
    /// Connect to the push endpoint derived from the group server base URL.
    pub fn connect(
        base_url: &Url,
        aid: &AgentId,
        sign_cookie: &str,
    ) -> Result<Self, GroupPushConnectError> {
        let url = push_url(base_url).map_err(|_| GroupPushConnectError::BadRequest)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|_| GroupPushConnectError::BadRequest)?;
        let headers = request.headers_mut();
        headers.insert(
            AID_HEADER,
            HeaderValue::from_str(&aid.to_string())
                .map_err(|_| GroupPushConnectError::BadRequest)?,
        );
        headers.insert(
            COOKIE_HEADER,
            HeaderValue::from_str(sign_cookie)
                .map_err(|_| GroupPushConnectError::BadRequest)?,
        );

        let (event_tx, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_tx = event_tx.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_push_stream(request, task_tx, task_cancel).await;
        });

        Ok(Self {
            event_tx,
            cancel,
            handle,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupPushEvent> {
        self.event_tx.subscribe()
    }

    pub async fn disconnect(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_push_stream(
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    event_tx: broadcast::Sender<GroupPushEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = ExponentialBackoff::new(
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(30),
    );
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let attempt = {
            let mut cloned = tokio_tungstenite::tungstenite::handshake::client::Request::builder()
                .method(request.method().clone())
                .uri(request.uri().clone())
                .body(())
                .expect("rebuilding a request that was already built");
            cloned
                .headers_mut()
                .extend(request.headers().iter().map(|(n, v)| (n.clone(), v.clone())));
            connect_async(cloned).await
        };
        match attempt {
            Ok((mut stream, _)) => {
                let _ = event_tx.send(GroupPushEvent::StatusChange(ConnectionStatus::Connected));
                backoff.reset();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = stream.close(None).await;
                            let _ = event_tx
                                .send(GroupPushEvent::StatusChange(ConnectionStatus::Disconnected));
                            return;
                        }
                        message = stream.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<GroupPush>(&text) {
                                    Ok(push) => {
                                        let _ = event_tx.send(GroupPushEvent::Push(push));
                                    }
                                    Err(error) => {
                                        warn!(%error, "dropping malformed group push");
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                if stream.send(Message::Pong(payload)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(error)) => {
                                warn!(%error, "group push read failed");
                                break;
                            }
                        }
                    }
                }
                let _ = event_tx.send(GroupPushEvent::StatusChange(ConnectionStatus::Disconnected));
            }
            Err(error) => {
                warn!(%error, "could not reach the group push endpoint");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff.next_backoff()) => {}
        }
    }
}

/// Derive the websocket push URL from the HTTP base URL of the group
/// server.
fn push_url(base_url: &Url) -> Result<Url, url::ParseError> {
    let mut url = base_url.join(ENDPOINT_GROUP_PUSH)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    // Scheme swaps between http(s) and ws(s) are always valid.
    let _ = url.set_scheme(scheme);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use acpcommon::messages::group::PushKind;

    use super::*;

    fn alice() -> AgentId {
        "alice.example.com".parse().unwrap()
    }

    #[tokio::test]
    async fn group_request_returns_data_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_GROUP))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "data": {"group_id": "g1", "members": 3},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::initialize(server.uri()).unwrap();
        let key = AgentSigningKey::generate().unwrap();
        let data = client
            .group_request(
                "get_group_info",
                Some(&GroupId::new("g1".into())),
                &alice(),
                &key,
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(data["members"], 3);
    }

    #[tokio::test]
    async fn group_errors_are_mapped_to_kinds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENDPOINT_GROUP))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false,
                "error": {"code": "conflict", "message": "broadcast lock held"},
            })))
            .mount(&server)
            .await;

        let client = ApiClient::initialize(server.uri()).unwrap();
        let key = AgentSigningKey::generate().unwrap();
        let error = client
            .group_request(
                "acquire_broadcast_lock",
                Some(&GroupId::new("g1".into())),
                &alice(),
                &key,
                Value::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, GroupApiError::Conflict { .. }));
    }

    #[tokio::test]
    async fn push_stream_delivers_batches() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let push = json!({
                "push": "batch",
                "group_id": "g1",
                "payload": {"group_id": "g1", "messages": []},
            });
            ws.send(Message::Text(push.to_string())).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let base: Url = format!("http://127.0.0.1:{port}/").parse().unwrap();
        let stream = GroupPushStream::connect(&base, &alice(), "cookie").unwrap();
        let mut events = stream.subscribe();
        let push = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let GroupPushEvent::Push(push) = events.recv().await.unwrap() {
                    return push;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(push.push, PushKind::Batch);
        assert_eq!(push.group_id.as_str(), "g1");

        stream.disconnect().await;
    }
}
