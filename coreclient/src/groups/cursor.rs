// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable per-group cursors.
//!
//! One JSON document per (identity, group) at
//! `<storage>/groups/<aid>/<group_id>/cursor.json`. Writes are atomic
//! (temp + rename) and serialized by a per-group mutex; the sync engine
//! never advances its in-memory cursor past what this store has confirmed
//! on disk.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::sync::Mutex;

use acpcommon::identifiers::{AgentId, GroupId};

use crate::{errors::CoreError, identities::persistence::write_atomically};

const CURSOR_FILE: &str = "cursor.json";

/// Durable position in a group's two logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCursor {
    pub last_msg_id: u64,
    pub last_event_id: u64,
    /// Day the last checksum verification covered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_date: Option<String>,
    /// Running digest over the message ids delivered on `digest_date`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_date: Option<String>,
}

impl GroupCursor {
    /// Fold a delivered message id into the day digest. The digest chains
    /// `sha256(previous || msg_id)` so it can be compared with the server's
    /// per-day checksum.
    pub fn absorb_msg_id(&mut self, date: &str, msg_id: u64) {
        if self.digest_date.as_deref() != Some(date) {
            self.digest_date = Some(date.to_owned());
            self.day_digest = None;
        }
        let mut hasher = Sha256::new();
        if let Some(previous) = &self.day_digest {
            hasher.update(previous.as_bytes());
        }
        hasher.update(msg_id.to_be_bytes());
        self.day_digest = Some(hex::encode(hasher.finalize()));
    }
}

/// Store of group cursors for one identity.
pub struct CursorStore {
    root: PathBuf,
    locks: StdMutex<HashMap<GroupId, Arc<Mutex<()>>>>,
}

impl CursorStore {
    pub fn new(storage_path: &Path, aid: &AgentId) -> Result<Self, CoreError> {
        let root = storage_path.join("groups").join(aid.to_string());
        fs::create_dir_all(&root)
            .map_err(|e| CoreError::config(format!("cannot create cursor store: {e}")))?;
        Ok(Self {
            root,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    fn file_lock(&self, group_id: &GroupId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(group_id.clone())
            .or_default()
            .clone()
    }

    fn cursor_path(&self, group_id: &GroupId) -> PathBuf {
        self.root.join(group_id.as_str()).join(CURSOR_FILE)
    }

    /// Load the cursor, defaulting to the log origin for unknown groups.
    pub async fn load(&self, group_id: &GroupId) -> Result<GroupCursor, CoreError> {
        let guard = self.file_lock(group_id);
        let _held = guard.lock().await;
        let path = self.cursor_path(group_id);
        if !path.is_file() {
            return Ok(GroupCursor::default());
        }
        let bytes = fs::read(&path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::internal(format!("corrupt cursor file: {e}")))
    }

    /// Persist the cursor atomically. Returns only once the rename has
    /// happened, so callers may treat success as durable.
    pub async fn store(&self, group_id: &GroupId, cursor: &GroupCursor) -> Result<(), CoreError> {
        let guard = self.file_lock(group_id);
        let _held = guard.lock().await;
        let path = self.cursor_path(group_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(cursor)
            .map_err(|e| CoreError::internal(e.to_string()))?;
        write_atomically(&path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (AgentId, GroupId) {
        ("alice.example.com".parse().unwrap(), GroupId::new("g1".into()))
    }

    #[tokio::test]
    async fn load_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (aid, group) = ids();
        let store = CursorStore::new(dir.path(), &aid).unwrap();

        // Unknown groups start at the log origin.
        let cursor = store.load(&group).await.unwrap();
        assert_eq!(cursor, GroupCursor::default());

        let mut cursor = GroupCursor {
            last_msg_id: 41,
            last_event_id: 7,
            ..Default::default()
        };
        cursor.absorb_msg_id("2024-05-01", 41);
        store.store(&group, &cursor).await.unwrap();

        let loaded = store.load(&group).await.unwrap();
        assert_eq!(loaded, cursor);
    }

    #[tokio::test]
    async fn cursors_survive_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (aid, group) = ids();
        {
            let store = CursorStore::new(dir.path(), &aid).unwrap();
            let cursor = GroupCursor {
                last_msg_id: 100,
                last_event_id: 3,
                ..Default::default()
            };
            store.store(&group, &cursor).await.unwrap();
        }
        let store = CursorStore::new(dir.path(), &aid).unwrap();
        let loaded = store.load(&group).await.unwrap();
        assert_eq!(loaded.last_msg_id, 100);
        assert_eq!(loaded.last_event_id, 3);
    }

    #[test]
    fn day_digest_changes_with_each_id_and_resets_per_day() {
        let mut cursor = GroupCursor::default();
        cursor.absorb_msg_id("2024-05-01", 1);
        let first = cursor.day_digest.clone().unwrap();
        cursor.absorb_msg_id("2024-05-01", 2);
        let second = cursor.day_digest.clone().unwrap();
        assert_ne!(first, second);

        // A new day starts a fresh digest chain.
        cursor.absorb_msg_id("2024-05-02", 1);
        assert_eq!(cursor.day_digest.as_ref().unwrap(), &first);
        assert_eq!(cursor.digest_date.as_deref(), Some("2024-05-02"));
    }
}
