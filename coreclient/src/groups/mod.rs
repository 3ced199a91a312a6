// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The group client: the full operation surface of the group server, the
//! push callback registrations, and the per-group sync sessions.
//!
//! Operations are grouped by phase the way the server documents them:
//! lifecycle, basic, member administration, owner administration, invite
//! codes, broadcast, utility and index. Every mutation is a signed request;
//! non-mutating reads hand the server's JSON back verbatim.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Arc, Mutex as StdMutex},
};

use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::info;
use url::Url;

use acpapiclient::ApiClient;
use acpcommon::{
    crypto::signatures::AgentSigningKey,
    identifiers::{AgentId, GroupId},
    messages::group::{
        BroadcastLease, GroupInfo, GroupLogEvent, GroupLogMessage, GroupRole, GroupVisibility,
        InviteCodeInfo, LogChecksums, MembershipState,
    },
    time::TimeStamp,
};

use crate::errors::CoreError;

pub mod cursor;
pub(crate) mod sync;

pub use sync::SyncConfig;

use cursor::CursorStore;
use sync::{GroupSyncHandle, PushRouter};

/// Invoked with every delivered batch of group messages, in strictly
/// ascending `msg_id` order.
pub type MessageBatchHandler =
    Arc<dyn Fn(GroupId, Vec<GroupLogMessage>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with every delivered group event, in strictly ascending
/// `event_id` order.
pub type GroupEventHandler =
    Arc<dyn Fn(GroupId, GroupLogEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
pub(crate) struct GroupCallbacks {
    pub(crate) on_message_batch: Option<MessageBatchHandler>,
    pub(crate) on_group_event: Option<GroupEventHandler>,
}

/// Client of the group server for one identity.
#[derive(Clone)]
pub struct GroupClient {
    pub(crate) inner: Arc<GroupClientInner>,
}

pub(crate) struct GroupClientInner {
    pub(crate) aid: AgentId,
    pub(crate) signing_key: AgentSigningKey,
    pub(crate) api: ApiClient,
    pub(crate) base_url: Url,
    pub(crate) sign_cookie: String,
    pub(crate) cursor_store: CursorStore,
    pub(crate) callbacks: StdMutex<GroupCallbacks>,
    pub(crate) config: SyncConfig,
    pub(crate) active: Mutex<HashMap<GroupId, GroupSyncHandle>>,
    pub(crate) push_router: Mutex<Option<PushRouter>>,
}

impl GroupClient {
    pub fn new(
        aid: AgentId,
        signing_key: AgentSigningKey,
        group_server_url: &Url,
        sign_cookie: String,
        storage_path: &Path,
        config: SyncConfig,
    ) -> Result<Self, CoreError> {
        let api = ApiClient::initialize(group_server_url.as_str())
            .map_err(|e| CoreError::config(e.to_string()))?;
        let cursor_store = CursorStore::new(storage_path, &aid)?;
        Ok(Self {
            inner: Arc::new(GroupClientInner {
                aid,
                signing_key,
                api,
                base_url: group_server_url.clone(),
                sign_cookie,
                cursor_store,
                callbacks: StdMutex::new(GroupCallbacks::default()),
                config,
                active: Mutex::new(HashMap::new()),
                push_router: Mutex::new(None),
            }),
        })
    }

    pub fn aid(&self) -> &AgentId {
        &self.inner.aid
    }

    async fn request(
        &self,
        op: &str,
        group_id: Option<&GroupId>,
        params: Value,
    ) -> Result<Value, CoreError> {
        let inner = &self.inner;
        inner
            .api
            .group_request(op, group_id, &inner.aid, &inner.signing_key, params)
            .await
            .map_err(CoreError::from)
    }

    // === Push callbacks ===

    pub fn set_message_batch_handler(&self, handler: MessageBatchHandler) {
        self.inner.callbacks.lock().unwrap().on_message_batch = Some(handler);
    }

    pub fn set_group_event_handler(&self, handler: GroupEventHandler) {
        self.inner.callbacks.lock().unwrap().on_group_event = Some(handler);
    }

    // === Lifecycle ===

    pub async fn create_group(
        &self,
        visibility: GroupVisibility,
        rules: BTreeMap<String, String>,
    ) -> Result<GroupId, CoreError> {
        let data = self
            .request("create_group", None, json!({"visibility": visibility, "rules": rules}))
            .await?;
        group_id_from(&data)
    }

    pub async fn delete_group(&self, group_id: &GroupId) -> Result<(), CoreError> {
        self.request("delete_group", Some(group_id), Value::Null)
            .await
            .map(drop)
    }

    /// The server's view of the group, verbatim.
    pub async fn get_group_info(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("get_group_info", Some(group_id), Value::Null).await
    }

    /// Typed projection of [`Self::get_group_info`].
    pub async fn group_info(&self, group_id: &GroupId) -> Result<GroupInfo, CoreError> {
        let data = self.get_group_info(group_id).await?;
        serde_json::from_value(data)
            .map_err(|e| CoreError::protocol(format!("malformed group info: {e}")))
    }

    pub async fn set_visibility(
        &self,
        group_id: &GroupId,
        visibility: GroupVisibility,
    ) -> Result<(), CoreError> {
        self.request("set_visibility", Some(group_id), json!({"visibility": visibility}))
            .await
            .map(drop)
    }

    pub async fn update_rules(
        &self,
        group_id: &GroupId,
        rules: BTreeMap<String, String>,
    ) -> Result<(), CoreError> {
        self.request("update_rules", Some(group_id), json!({"rules": rules}))
            .await
            .map(drop)
    }

    pub async fn set_announcement(
        &self,
        group_id: &GroupId,
        announcement: &str,
    ) -> Result<(), CoreError> {
        self.request(
            "set_announcement",
            Some(group_id),
            json!({"announcement": announcement}),
        )
        .await
        .map(drop)
    }

    pub async fn get_announcement(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("get_announcement", Some(group_id), Value::Null).await
    }

    pub async fn suspend_group(&self, group_id: &GroupId) -> Result<(), CoreError> {
        self.request("suspend_group", Some(group_id), Value::Null)
            .await
            .map(drop)
    }

    pub async fn resume_group(&self, group_id: &GroupId) -> Result<(), CoreError> {
        self.request("resume_group", Some(group_id), Value::Null)
            .await
            .map(drop)
    }

    /// Ownership transfer is atomic on the server side.
    pub async fn transfer_ownership(
        &self,
        group_id: &GroupId,
        new_owner: &AgentId,
    ) -> Result<(), CoreError> {
        self.request("transfer_ownership", Some(group_id), json!({"new_owner": new_owner}))
            .await
            .map(drop)
    }

    // === Basic operations ===

    /// Direct join via a group URL; only valid for public groups.
    pub async fn join_by_url(&self, group_url: &str) -> Result<GroupId, CoreError> {
        let data = self
            .request("join_group", None, json!({"url": group_url}))
            .await?;
        group_id_from(&data)
    }

    /// Ask to join a private group; creates a pending entry.
    pub async fn request_join(&self, group_id: &GroupId) -> Result<(), CoreError> {
        self.request("request_join", Some(group_id), Value::Null)
            .await
            .map(drop)
    }

    pub async fn leave_group(&self, group_id: &GroupId) -> Result<(), CoreError> {
        self.request("leave_group", Some(group_id), Value::Null)
            .await
            .map(drop)
    }

    /// Append a message to the group's message log.
    pub async fn send_group_message(
        &self,
        group_id: &GroupId,
        content: Value,
    ) -> Result<u64, CoreError> {
        let data = self
            .request("send_group_message", Some(group_id), json!({"content": content}))
            .await?;
        data.get("msg_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| CoreError::protocol("send_group_message returned no msg_id"))
    }

    pub async fn pull_messages(
        &self,
        group_id: &GroupId,
        after: u64,
        limit: u32,
    ) -> Result<Vec<GroupLogMessage>, CoreError> {
        let data = self
            .request(
                "pull_messages",
                Some(group_id),
                json!({"after": after, "limit": limit}),
            )
            .await?;
        parse_list(&data, "messages")
    }

    /// Acknowledge messages up to and including `up_to`. Idempotent: the
    /// server never rewinds a cursor on a repeated ack.
    pub async fn ack_messages(&self, group_id: &GroupId, up_to: u64) -> Result<(), CoreError> {
        self.request("ack_messages", Some(group_id), json!({"up_to": up_to}))
            .await
            .map(drop)
    }

    pub async fn pull_events(
        &self,
        group_id: &GroupId,
        after: u64,
        limit: u32,
    ) -> Result<Vec<GroupLogEvent>, CoreError> {
        let data = self
            .request(
                "pull_events",
                Some(group_id),
                json!({"after": after, "limit": limit}),
            )
            .await?;
        parse_list(&data, "events")
    }

    pub async fn ack_events(&self, group_id: &GroupId, up_to: u64) -> Result<(), CoreError> {
        self.request("ack_events", Some(group_id), json!({"up_to": up_to}))
            .await
            .map(drop)
    }

    /// Re-pull a closed id range, used by checksum backfill.
    pub async fn pull_messages_range(
        &self,
        group_id: &GroupId,
        after: u64,
        up_to: u64,
        limit: u32,
    ) -> Result<Vec<GroupLogMessage>, CoreError> {
        let data = self
            .request(
                "pull_messages_range",
                Some(group_id),
                json!({"after": after, "up_to": up_to, "limit": limit}),
            )
            .await?;
        parse_list(&data, "messages")
    }

    pub async fn get_members(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("get_members", Some(group_id), Value::Null).await
    }

    pub async fn get_member(
        &self,
        group_id: &GroupId,
        member: &AgentId,
    ) -> Result<Value, CoreError> {
        self.request("get_member", Some(group_id), json!({"member": member}))
            .await
    }

    /// This agent's membership state in the group.
    pub async fn my_role(&self, group_id: &GroupId) -> Result<MembershipState, CoreError> {
        let data = self.request("my_role", Some(group_id), Value::Null).await?;
        serde_json::from_value(
            data.get("state")
                .cloned()
                .ok_or_else(|| CoreError::protocol("my_role returned no state"))?,
        )
        .map_err(|e| CoreError::protocol(format!("malformed membership state: {e}")))
    }

    pub async fn list_my_groups(&self) -> Result<Value, CoreError> {
        self.request("list_my_groups", None, Value::Null).await
    }

    // === Member administration ===

    pub async fn approve_join(
        &self,
        group_id: &GroupId,
        candidate: &AgentId,
    ) -> Result<(), CoreError> {
        self.request("approve_join", Some(group_id), json!({"candidate": candidate}))
            .await
            .map(drop)
    }

    /// Batch approval of pending join requests.
    pub async fn approve_join_batch(
        &self,
        group_id: &GroupId,
        candidates: &[AgentId],
    ) -> Result<(), CoreError> {
        self.request(
            "approve_join_batch",
            Some(group_id),
            json!({"candidates": candidates}),
        )
        .await
        .map(drop)
    }

    pub async fn reject_join(
        &self,
        group_id: &GroupId,
        candidate: &AgentId,
    ) -> Result<(), CoreError> {
        self.request("reject_join", Some(group_id), json!({"candidate": candidate}))
            .await
            .map(drop)
    }

    pub async fn list_pending(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("list_pending", Some(group_id), Value::Null).await
    }

    pub async fn kick_member(
        &self,
        group_id: &GroupId,
        member: &AgentId,
    ) -> Result<(), CoreError> {
        self.request("kick_member", Some(group_id), json!({"member": member}))
            .await
            .map(drop)
    }

    /// Ban a member, optionally until a given expiry.
    pub async fn ban_member(
        &self,
        group_id: &GroupId,
        member: &AgentId,
        until: Option<TimeStamp>,
    ) -> Result<(), CoreError> {
        self.request(
            "ban_member",
            Some(group_id),
            json!({"member": member, "until": until}),
        )
        .await
        .map(drop)
    }

    pub async fn unban_member(
        &self,
        group_id: &GroupId,
        member: &AgentId,
    ) -> Result<(), CoreError> {
        self.request("unban_member", Some(group_id), json!({"member": member}))
            .await
            .map(drop)
    }

    pub async fn list_banned(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("list_banned", Some(group_id), Value::Null).await
    }

    // === Owner administration ===

    pub async fn promote_admin(
        &self,
        group_id: &GroupId,
        member: &AgentId,
    ) -> Result<(), CoreError> {
        self.request("promote_admin", Some(group_id), json!({"member": member}))
            .await
            .map(drop)
    }

    pub async fn demote_admin(
        &self,
        group_id: &GroupId,
        member: &AgentId,
    ) -> Result<(), CoreError> {
        self.request("demote_admin", Some(group_id), json!({"member": member}))
            .await
            .map(drop)
    }

    pub async fn list_admins(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("list_admins", Some(group_id), Value::Null).await
    }

    pub async fn set_member_role(
        &self,
        group_id: &GroupId,
        member: &AgentId,
        role: GroupRole,
    ) -> Result<(), CoreError> {
        self.request(
            "set_member_role",
            Some(group_id),
            json!({"member": member, "role": role}),
        )
        .await
        .map(drop)
    }

    // === Invite codes ===

    /// Issue an invite code. Requires at least admin.
    pub async fn create_invite_code(
        &self,
        group_id: &GroupId,
        label: &str,
        max_uses: u32,
        expires_at: TimeStamp,
    ) -> Result<InviteCodeInfo, CoreError> {
        let data = self
            .request(
                "create_invite_code",
                Some(group_id),
                json!({"label": label, "max_uses": max_uses, "expires_at": expires_at}),
            )
            .await?;
        serde_json::from_value(data)
            .map_err(|e| CoreError::protocol(format!("malformed invite code: {e}")))
    }

    pub async fn revoke_invite_code(
        &self,
        group_id: &GroupId,
        code: &str,
    ) -> Result<(), CoreError> {
        self.request("revoke_invite_code", Some(group_id), json!({"code": code}))
            .await
            .map(drop)
    }

    pub async fn list_invite_codes(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("list_invite_codes", Some(group_id), Value::Null).await
    }

    /// Validate a code without redeeming it.
    pub async fn validate_invite_code(&self, code: &str) -> Result<InviteCodeInfo, CoreError> {
        let data = self
            .request("validate_invite_code", None, json!({"code": code}))
            .await?;
        serde_json::from_value(data)
            .map_err(|e| CoreError::protocol(format!("malformed invite code: {e}")))
    }

    /// Redeem an invite code, joining its group. The server enforces
    /// `max_uses` and expiry.
    pub async fn redeem_invite_code(&self, code: &str) -> Result<GroupId, CoreError> {
        let data = self
            .request("redeem_invite_code", None, json!({"code": code}))
            .await?;
        group_id_from(&data)
    }

    // === Broadcast lock ===

    /// Acquire the group's broadcast lock. At most one holder at a time;
    /// contenders get a `Conflict` failure.
    pub async fn acquire_broadcast_lock(
        &self,
        group_id: &GroupId,
    ) -> Result<BroadcastLease, CoreError> {
        let data = self
            .request("acquire_broadcast_lock", Some(group_id), Value::Null)
            .await?;
        serde_json::from_value(data)
            .map_err(|e| CoreError::protocol(format!("malformed broadcast lease: {e}")))
    }

    pub async fn release_broadcast_lock(&self, group_id: &GroupId) -> Result<(), CoreError> {
        self.request("release_broadcast_lock", Some(group_id), Value::Null)
            .await
            .map(drop)
    }

    /// Acquire the lock, send, and release. The lock is released on the
    /// send's failure path too; a crash in between is covered by the
    /// server-side lease expiry.
    pub async fn broadcast_message(
        &self,
        group_id: &GroupId,
        content: Value,
    ) -> Result<u64, CoreError> {
        let _lease = self.acquire_broadcast_lock(group_id).await?;
        let result = self.send_group_message(group_id, content).await;
        let release = self.release_broadcast_lock(group_id).await;
        let msg_id = result?;
        release?;
        Ok(msg_id)
    }

    // === Utility & index ===

    /// Per-day checksums over the group's message and event logs.
    pub async fn log_checksums(
        &self,
        group_id: &GroupId,
        date: &str,
    ) -> Result<LogChecksums, CoreError> {
        let data = self
            .request("log_checksums", Some(group_id), json!({"date": date}))
            .await?;
        serde_json::from_value(data)
            .map_err(|e| CoreError::protocol(format!("malformed checksums: {e}")))
    }

    pub async fn group_stats(&self, group_id: &GroupId) -> Result<Value, CoreError> {
        self.request("group_stats", Some(group_id), Value::Null).await
    }

    pub async fn search_groups(&self, query: &str) -> Result<Value, CoreError> {
        self.request("search_groups", None, json!({"query": query})).await
    }

    pub async fn list_public_groups(&self, page: u32) -> Result<Value, CoreError> {
        self.request("list_public_groups", None, json!({"page": page})).await
    }

    // === Group sync sessions ===

    /// Start the pull loops for a joined group and register it for push
    /// routing.
    pub async fn join_group_session(&self, group_id: &GroupId) -> Result<(), CoreError> {
        let mut active = self.inner.active.lock().await;
        if active.contains_key(group_id) {
            return Ok(());
        }
        let handle = sync::start_group_sync(self.clone(), group_id.clone());
        active.insert(group_id.clone(), handle);
        drop(active);
        sync::ensure_push_router(self).await;
        info!(aid = %self.inner.aid, %group_id, "joined group session");
        Ok(())
    }

    /// Stop the pull loops and flush the group's cursor.
    pub async fn leave_group_session(&self, group_id: &GroupId) -> Result<(), CoreError> {
        let handle = self.inner.active.lock().await.remove(group_id);
        let Some(handle) = handle else {
            return Err(CoreError::state("group session not active")
                .with_context(group_id.to_string()));
        };
        handle.stop().await;
        info!(aid = %self.inner.aid, %group_id, "left group session");
        Ok(())
    }

    /// Groups with currently running sync sessions.
    pub async fn online_groups(&self) -> Vec<GroupId> {
        self.inner.active.lock().await.keys().cloned().collect()
    }

    /// Stop every group session and the push router.
    pub async fn stop(&self) {
        let handles: Vec<_> = {
            let mut active = self.inner.active.lock().await;
            active.drain().collect()
        };
        for (_, handle) in handles {
            handle.stop().await;
        }
        if let Some(router) = self.inner.push_router.lock().await.take() {
            router.stop().await;
        }
    }
}

fn group_id_from(data: &Value) -> Result<GroupId, CoreError> {
    data.get("group_id")
        .and_then(Value::as_str)
        .map(|id| GroupId::new(id.to_owned()))
        .ok_or_else(|| CoreError::protocol("response carried no group_id"))
}

fn parse_list<T: serde::de::DeserializeOwned>(
    data: &Value,
    key: &str,
) -> Result<Vec<T>, CoreError> {
    let list = data
        .get(key)
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(list)
        .map_err(|e| CoreError::protocol(format!("malformed {key} list: {e}")))
}
