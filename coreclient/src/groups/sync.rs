// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The sync engine: per-group pull/ack loops over the message and event
//! logs.
//!
//! Pulls are woken by push notifications when the push stream is up and by
//! periodic polling as a backstop; the pull loop is the only thing that
//! advances cursors. A cursor moves in three steps: deliver the batch, ack
//! it on the server, persist the durable cursor, and only then advance the
//! in-memory copy. Checksum verification runs on a configurable cadence and
//! re-pulls disputed ranges in bounded windows, re-emitting them with the
//! replay flag set.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use acpapiclient::group_api::{GroupPushEvent, GroupPushStream};
use acpcommon::{identifiers::GroupId, messages::group::PushKind};

use super::{GroupClient, MessageBatchHandler, cursor::GroupCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// Polling backstop when no pushes arrive.
    pub poll_interval: Duration,
    pub pull_limit: u32,
    /// Cadence of log checksum verification.
    pub checksum_interval: Duration,
    /// Window size of backfill re-pulls.
    pub backfill_window: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            pull_limit: 100,
            checksum_interval: Duration::from_secs(24 * 60 * 60),
            backfill_window: 500,
        }
    }
}

pub(crate) struct GroupSyncHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    pub(crate) wake_messages: Arc<Notify>,
    pub(crate) wake_events: Arc<Notify>,
}

impl GroupSyncHandle {
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        self.wake_messages.notify_one();
        self.wake_events.notify_one();
        let _ = self.handle.await;
    }
}

/// Start the two pull loops for one group.
pub(crate) fn start_group_sync(client: GroupClient, group_id: GroupId) -> GroupSyncHandle {
    let cancel = CancellationToken::new();
    let wake_messages = Arc::new(Notify::new());
    let wake_events = Arc::new(Notify::new());

    let task_cancel = cancel.clone();
    let task_wake_messages = wake_messages.clone();
    let task_wake_events = wake_events.clone();
    let handle = tokio::spawn(async move {
        let cursor = match client.inner.cursor_store.load(&group_id).await {
            Ok(cursor) => cursor,
            Err(error) => {
                warn!(%group_id, %error, "could not load cursor, starting from the log origin");
                GroupCursor::default()
            }
        };
        let cursor = Arc::new(Mutex::new(cursor));
        tokio::join!(
            message_loop(
                client.clone(),
                group_id.clone(),
                cursor.clone(),
                task_wake_messages,
                task_cancel.clone(),
            ),
            event_loop(client, group_id, cursor, task_wake_events, task_cancel),
        );
    });

    GroupSyncHandle {
        cancel,
        handle,
        wake_messages,
        wake_events,
    }
}

async fn message_loop(
    client: GroupClient,
    group_id: GroupId,
    cursor: Arc<Mutex<GroupCursor>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let config = client.inner.config;
    let mut last_checksum = Instant::now();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let callback = client.inner.callbacks.lock().unwrap().on_message_batch.clone();
        if let Some(callback) = callback {
            drain_messages(&client, &group_id, &cursor, &callback, &cancel).await;
            if last_checksum.elapsed() >= config.checksum_interval {
                verify_checksums(&client, &group_id, &cursor, &callback, &cancel).await;
                last_checksum = Instant::now();
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
    // Flush the cursor on the way out.
    let snapshot = cursor.lock().await.clone();
    if let Err(error) = client.inner.cursor_store.store(&group_id, &snapshot).await {
        warn!(%group_id, %error, "could not flush cursor");
    }
    debug!(%group_id, "message sync loop exited");
}

/// Pull until the server has nothing newer. Transient failures end the
/// drain; the next wake retries from the durable cursor.
async fn drain_messages(
    client: &GroupClient,
    group_id: &GroupId,
    cursor: &Arc<Mutex<GroupCursor>>,
    callback: &MessageBatchHandler,
    cancel: &CancellationToken,
) {
    let config = client.inner.config;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let after = cursor.lock().await.last_msg_id;
        let batch = match client.pull_messages(group_id, after, config.pull_limit).await {
            Ok(batch) => batch,
            Err(error) => {
                warn!(%group_id, %error, "message pull failed");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }
        // The log is strictly ascending; anything else is a protocol error
        // and the batch is dropped.
        let mut prev = after;
        for message in &batch {
            if message.msg_id <= prev {
                warn!(%group_id, msg_id = message.msg_id, prev, "non-ascending message log");
                return;
            }
            prev = message.msg_id;
        }
        let max_id = prev;
        let batch_len = batch.len();

        callback(group_id.clone(), batch.clone()).await;
        if let Err(error) = client.ack_messages(group_id, max_id).await {
            warn!(%group_id, %error, "message ack failed");
            return;
        }

        // Durable cursor first, in-memory second.
        let mut guard = cursor.lock().await;
        let mut next = guard.clone();
        next.last_msg_id = max_id;
        for message in &batch {
            if let Some(date) = message.ts.checksum_date() {
                next.absorb_msg_id(&date, message.msg_id);
            }
        }
        match client.inner.cursor_store.store(group_id, &next).await {
            Ok(()) => *guard = next,
            Err(error) => {
                warn!(%group_id, %error, "could not persist cursor");
                return;
            }
        }
        drop(guard);

        if batch_len < config.pull_limit as usize {
            return;
        }
    }
}

async fn verify_checksums(
    client: &GroupClient,
    group_id: &GroupId,
    cursor: &Arc<Mutex<GroupCursor>>,
    callback: &MessageBatchHandler,
    cancel: &CancellationToken,
) {
    let (date, local_digest, last_msg_id) = {
        let guard = cursor.lock().await;
        let Some(date) = guard.digest_date.clone() else {
            return;
        };
        if guard.checksum_date.as_deref() == Some(date.as_str()) {
            return;
        }
        (
            date,
            guard.day_digest.clone().unwrap_or_default(),
            guard.last_msg_id,
        )
    };
    let checksums = match client.log_checksums(group_id, &date).await {
        Ok(checksums) => checksums,
        Err(error) => {
            warn!(%group_id, %error, "checksum fetch failed");
            return;
        }
    };
    if checksums.message_checksum != local_digest {
        warn!(%group_id, %date, "log checksum mismatch, entering backfill");
        backfill(client, group_id, last_msg_id, callback, cancel).await;
    }
    let mut guard = cursor.lock().await;
    let mut next = guard.clone();
    next.checksum_date = Some(date);
    if client.inner.cursor_store.store(group_id, &next).await.is_ok() {
        *guard = next;
    }
}

/// Re-pull the disputed range in bounded windows and re-emit the batches
/// with the replay flag set, so consumers can dedupe.
async fn backfill(
    client: &GroupClient,
    group_id: &GroupId,
    up_to: u64,
    callback: &MessageBatchHandler,
    cancel: &CancellationToken,
) {
    let config = client.inner.config;
    let mut after = 0;
    while after < up_to {
        if cancel.is_cancelled() {
            return;
        }
        let mut batch = match client
            .pull_messages_range(group_id, after, up_to, config.backfill_window)
            .await
        {
            Ok(batch) => batch,
            Err(error) => {
                warn!(%group_id, %error, "backfill pull failed");
                return;
            }
        };
        let Some(last) = batch.last() else {
            return;
        };
        after = last.msg_id;
        for message in &mut batch {
            message.replay = true;
        }
        callback(group_id.clone(), batch).await;
    }
}

async fn event_loop(
    client: GroupClient,
    group_id: GroupId,
    cursor: Arc<Mutex<GroupCursor>>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    let config = client.inner.config;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let callback = client.inner.callbacks.lock().unwrap().on_group_event.clone();
        if let Some(callback) = callback {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let after = cursor.lock().await.last_event_id;
                let events = match client.pull_events(&group_id, after, config.pull_limit).await
                {
                    Ok(events) => events,
                    Err(error) => {
                        warn!(%group_id, %error, "event pull failed");
                        break;
                    }
                };
                if events.is_empty() {
                    break;
                }
                let mut prev = after;
                let mut ascending = true;
                for event in &events {
                    if event.event_id <= prev {
                        warn!(%group_id, event_id = event.event_id, prev, "non-ascending event log");
                        ascending = false;
                        break;
                    }
                    prev = event.event_id;
                }
                if !ascending {
                    break;
                }
                let max_id = prev;
                let event_count = events.len();

                for event in events {
                    callback(group_id.clone(), event).await;
                }
                if let Err(error) = client.ack_events(&group_id, max_id).await {
                    warn!(%group_id, %error, "event ack failed");
                    break;
                }
                let mut guard = cursor.lock().await;
                let mut next = guard.clone();
                next.last_event_id = max_id;
                match client.inner.cursor_store.store(&group_id, &next).await {
                    Ok(()) => *guard = next,
                    Err(error) => {
                        warn!(%group_id, %error, "could not persist cursor");
                        break;
                    }
                }
                drop(guard);
                if event_count < config.pull_limit as usize {
                    break;
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
    debug!(%group_id, "event sync loop exited");
}

/// Router task translating push notifications into pull-loop wakeups. Push
/// is a hint, never a delivery mechanism.
pub(crate) struct PushRouter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PushRouter {
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

pub(crate) async fn ensure_push_router(client: &GroupClient) {
    let mut slot = client.inner.push_router.lock().await;
    if slot.is_some() {
        return;
    }
    let stream = match GroupPushStream::connect(
        &client.inner.base_url,
        &client.inner.aid,
        &client.inner.sign_cookie,
    ) {
        Ok(stream) => stream,
        Err(error) => {
            // Pull-only operation is fully functional, just slower.
            warn!(%error, "push stream unavailable, relying on polling");
            return;
        }
    };
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let inner = client.inner.clone();
    let handle = tokio::spawn(async move {
        let mut events = stream.subscribe();
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(GroupPushEvent::Push(push)) => {
                        let active = inner.active.lock().await;
                        if let Some(handle) = active.get(&push.group_id) {
                            match push.push {
                                PushKind::Batch => handle.wake_messages.notify_one(),
                                PushKind::Event => handle.wake_events.notify_one(),
                            }
                        }
                    }
                    Ok(GroupPushEvent::StatusChange(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        stream.disconnect().await;
    });
    *slot = Some(PushRouter { cancel, handle });
}
