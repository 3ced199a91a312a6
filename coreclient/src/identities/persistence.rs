// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! On-disk layout of the identity store:
//!
//! ```text
//! <storage>/aids/<aid>/private.key.enc
//!                      cert.pem
//!                      meta.json
//! ```

use std::{
    fs,
    io::Write as _,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use url::Url;

use acpcommon::{identifiers::AgentId, time::TimeStamp};

pub(super) const PRIVATE_KEY_FILE: &str = "private.key.enc";
pub(super) const CERT_FILE: &str = "cert.pem";
pub(super) const META_FILE: &str = "meta.json";

pub(super) const REQUIRED_FILES: [&str; 3] = [PRIVATE_KEY_FILE, CERT_FILE, META_FILE];

/// Plaintext metadata stored next to the sealed key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IdentityMeta {
    pub(crate) aid: AgentId,
    pub(crate) authority_url: Url,
    pub(crate) created_at: TimeStamp,
    #[serde(default)]
    pub(crate) is_guest: bool,
}

pub(super) fn identity_dir(root: &Path, aid: &AgentId) -> PathBuf {
    root.join(aid.to_string())
}

/// Write a file atomically: write to a temp sibling, flush, then rename over
/// the target.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// True if the directory contains every file an identity consists of.
pub(super) fn is_complete(dir: &Path) -> bool {
    REQUIRED_FILES.iter().all(|name| dir.join(name).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        write_atomically(&path, b"first").unwrap();
        write_atomically(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        // No temp file is left behind.
        assert!(!path.with_extension("tmp").exists());
    }
}
