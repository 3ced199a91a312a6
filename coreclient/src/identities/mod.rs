// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The identity store: creation, loading, import and deletion of agent
//! identities, with the private key sealed under the seed password at rest.

use std::{fs, path::{Path, PathBuf}};

use tracing::info;
use url::Url;

use acpapiclient::ApiClient;
use acpcommon::{
    codec::AcpCodec,
    crypto::{
        seal::SealedSigningKey,
        signatures::{AgentSigningKey, Signature},
        validate_certificate_pem,
    },
    identifiers::{AgentId, Authority},
    time::TimeStamp,
};

use crate::errors::{CoreError, ErrorCode};

pub(crate) mod persistence;

use persistence::{
    CERT_FILE, IdentityMeta, META_FILE, PRIVATE_KEY_FILE, identity_dir, is_complete,
    write_atomically,
};

/// PEM tag accepted for imported private keys.
const PRIVATE_KEY_PEM_TAG: &str = "PRIVATE KEY";

/// A loaded identity: the unsealed signing key plus its certificate chain.
#[derive(Debug, Clone)]
pub struct Identity {
    aid: AgentId,
    signing_key: AgentSigningKey,
    certificate_pem: String,
    authority_url: Url,
    is_guest: bool,
}

impl Identity {
    pub fn aid(&self) -> &AgentId {
        &self.aid
    }

    pub fn signing_key(&self) -> &AgentSigningKey {
        &self.signing_key
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn authority_url(&self) -> &Url {
        &self.authority_url
    }

    pub fn is_guest(&self) -> bool {
        self.is_guest
    }

    /// Sign a payload with this identity's key.
    pub fn sign(&self, payload: &[u8]) -> Signature {
        self.signing_key.sign(payload)
    }
}

/// Store of identities under `<storage>/aids`, one directory per identity.
pub struct IdentityStore {
    root: PathBuf,
}

impl IdentityStore {
    pub fn new(storage_path: &Path) -> Result<Self, CoreError> {
        let root = storage_path.join("aids");
        fs::create_dir_all(&root)
            .map_err(|e| CoreError::config(format!("cannot create identity store: {e}")))?;
        Ok(Self { root })
    }

    /// Create a fresh identity: generate a keypair, post a CSR to the
    /// authority, and persist the sealed key plus the returned chain.
    pub async fn generate(
        &self,
        api_client: &ApiClient,
        authority: Authority,
        name: &str,
        seed_password: &str,
    ) -> Result<Identity, CoreError> {
        let aid = AgentId::new(name.to_owned(), authority)
            .map_err(|e| CoreError::config(e.to_string()))?;
        let dir = identity_dir(&self.root, &aid);
        if dir.exists() {
            return Err(CoreError::new(ErrorCode::Conflict, "identity already exists")
                .with_context(aid.to_string()));
        }

        let signing_key = AgentSigningKey::generate()
            .map_err(|e| CoreError::new(ErrorCode::Crypto, e.to_string()))?;
        let cert_chain = api_client.submit_csr(&aid, name, &signing_key).await?;

        let identity = Identity {
            aid,
            signing_key,
            certificate_pem: cert_chain,
            authority_url: api_client.base_url().clone(),
            is_guest: false,
        };
        self.persist(&identity, seed_password)?;
        info!(aid = %identity.aid, "created identity");
        Ok(identity)
    }

    /// Load an identity by unsealing its private key with the seed password.
    pub fn load(&self, aid: &AgentId, seed_password: &str) -> Result<Identity, CoreError> {
        let dir = identity_dir(&self.root, aid);
        if !dir.is_dir() {
            return Err(CoreError::not_found("unknown identity").with_context(aid.to_string()));
        }
        let sealed_bytes = fs::read(dir.join(PRIVATE_KEY_FILE))?;
        let sealed: SealedSigningKey = AcpCodec::from_slice(&sealed_bytes)?;
        let signing_key = sealed.open(seed_password)?;
        let certificate_pem = fs::read_to_string(dir.join(CERT_FILE))?;
        let meta: IdentityMeta = serde_json::from_slice(&fs::read(dir.join(META_FILE))?)
            .map_err(|e| CoreError::internal(format!("corrupt identity metadata: {e}")))?;
        Ok(Identity {
            aid: aid.clone(),
            signing_key,
            certificate_pem,
            authority_url: meta.authority_url,
            is_guest: meta.is_guest,
        })
    }

    /// Import an identity from PEM material.
    pub fn import(
        &self,
        aid: &AgentId,
        private_key_pem: &str,
        cert_pem: &str,
        authority_url: Url,
        seed_password: &str,
    ) -> Result<Identity, CoreError> {
        let key_block = pem::parse(private_key_pem)
            .map_err(|e| CoreError::new(ErrorCode::Crypto, format!("bad private key PEM: {e}")))?;
        if key_block.tag() != PRIVATE_KEY_PEM_TAG {
            return Err(CoreError::new(
                ErrorCode::Crypto,
                format!("unexpected PEM tag {}", key_block.tag()),
            ));
        }
        let signing_key = AgentSigningKey::from_bytes(key_block.contents())
            .map_err(|e| CoreError::new(ErrorCode::Crypto, e.to_string()))?;
        validate_certificate_pem(cert_pem)
            .map_err(|e| CoreError::new(ErrorCode::Crypto, e.to_string()))?;

        let identity = Identity {
            aid: aid.clone(),
            signing_key,
            certificate_pem: cert_pem.to_owned(),
            authority_url,
            is_guest: aid.is_guest(),
        };
        self.persist(&identity, seed_password)?;
        info!(%aid, "imported identity");
        Ok(identity)
    }

    /// Delete an identity by erasing its directory. Refuses to touch a
    /// directory that is missing required files, so a partial wipe is never
    /// made worse.
    pub fn delete(&self, aid: &AgentId) -> Result<(), CoreError> {
        let dir = identity_dir(&self.root, aid);
        if !dir.is_dir() {
            return Err(CoreError::not_found("unknown identity").with_context(aid.to_string()));
        }
        if !is_complete(&dir) {
            return Err(CoreError::state(
                "identity directory is incomplete, refusing to delete",
            )
            .with_context(aid.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        info!(%aid, "deleted identity");
        Ok(())
    }

    /// All identities present in the store.
    pub fn list(&self) -> Result<Vec<AgentId>, CoreError> {
        let mut aids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(aid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<AgentId>().ok())
            {
                aids.push(aid);
            }
        }
        aids.sort();
        Ok(aids)
    }

    fn persist(&self, identity: &Identity, seed_password: &str) -> Result<(), CoreError> {
        let dir = identity_dir(&self.root, identity.aid());
        fs::create_dir_all(&dir)?;

        let sealed = SealedSigningKey::seal(&identity.signing_key, seed_password)?;
        write_atomically(&dir.join(PRIVATE_KEY_FILE), &AcpCodec::to_vec(&sealed)?)?;
        write_atomically(&dir.join(CERT_FILE), identity.certificate_pem.as_bytes())?;
        let meta = IdentityMeta {
            aid: identity.aid.clone(),
            authority_url: identity.authority_url.clone(),
            created_at: TimeStamp::now(),
            is_guest: identity.is_guest,
        };
        write_atomically(
            &dir.join(META_FILE),
            &serde_json::to_vec_pretty(&meta)
                .map_err(|e| CoreError::internal(e.to_string()))?,
        )?;
        Ok(())
    }

    /// Persist a freshly built identity, used for guests created without a
    /// CSR round-trip.
    pub(crate) fn persist_local(
        &self,
        identity: &Identity,
        seed_password: &str,
    ) -> Result<(), CoreError> {
        self.persist(identity, seed_password)
    }

    pub(crate) fn exists(&self, aid: &AgentId) -> bool {
        identity_dir(&self.root, aid).is_dir()
    }
}

/// Build an in-memory guest identity; the caller persists it.
pub(crate) fn new_guest_identity(authority: Authority, authority_url: Url) -> Result<Identity, CoreError> {
    let aid = AgentId::random_guest(authority);
    let signing_key = AgentSigningKey::generate()
        .map_err(|e| CoreError::new(ErrorCode::Crypto, e.to_string()))?;
    Ok(Identity {
        aid,
        signing_key,
        // Guests are ephemeral and carry no authority-signed chain.
        certificate_pem: String::new(),
        authority_url,
        is_guest: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, IdentityStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn import_alice(store: &IdentityStore, password: &str) -> Identity {
        let aid: AgentId = "alice.example.com".parse().unwrap();
        let key = AgentSigningKey::generate().unwrap();
        // The raw 32-byte seed in a PRIVATE KEY block.
        let key_pem = pem::encode(&pem::Pem::new(
            PRIVATE_KEY_PEM_TAG,
            key.secret_bytes_for_test().to_vec(),
        ));
        let cert_pem = pem::encode(&pem::Pem::new("CERTIFICATE", vec![1, 2, 3]));
        store
            .import(
                &aid,
                &key_pem,
                &cert_pem,
                "https://ca.example.com".parse().unwrap(),
                password,
            )
            .unwrap()
    }

    #[test]
    fn import_load_round_trip() {
        let (_dir, store) = store();
        let imported = import_alice(&store, "pw");
        let loaded = store.load(imported.aid(), "pw").unwrap();
        assert_eq!(loaded.signing_key().verifying_key(), imported.signing_key().verifying_key());
        assert_eq!(loaded.certificate_pem(), imported.certificate_pem());
        assert!(!loaded.is_guest());
    }

    #[test]
    fn wrong_seed_password_is_a_crypto_error() {
        let (_dir, store) = store();
        let imported = import_alice(&store, "pw");
        let error = store.load(imported.aid(), "nope").unwrap_err();
        assert_eq!(error.code, ErrorCode::Crypto);
    }

    #[test]
    fn delete_then_load_is_not_found() {
        let (_dir, store) = store();
        let imported = import_alice(&store, "pw");
        store.delete(imported.aid()).unwrap();
        let error = store.load(imported.aid(), "pw").unwrap_err();
        assert_eq!(error.code, ErrorCode::NotFound);
    }

    #[test]
    fn delete_refuses_partial_directories() {
        let (_dir, store) = store();
        let imported = import_alice(&store, "pw");
        let dir = identity_dir(&store.root, imported.aid());
        fs::remove_file(dir.join(CERT_FILE)).unwrap();
        let error = store.delete(imported.aid()).unwrap_err();
        assert_eq!(error.code, ErrorCode::State);
    }

    #[test]
    fn list_returns_sorted_aids() {
        let (_dir, store) = store();
        import_alice(&store, "pw");
        let aids = store.list().unwrap();
        assert_eq!(aids.len(), 1);
        assert_eq!(aids[0].to_string(), "alice.example.com");
    }
}
