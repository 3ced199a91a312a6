// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The `AgentCp` facade: identity lifecycle, online/offline composition of
//! the protocol clients, and process-wide lifecycle.
//!
//! `online` wires the stack in order: sign-in at the entry point, heartbeat
//! engine, signalling transport, session dispatch. `offline` reverses it
//! strictly: stop session intake, close the transport, stop the heartbeat
//! (flags, socket, joins), then sign out.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use acpapiclient::{
    ApiClient,
    auth_api::{AuthApiError, RetryPolicy},
    heartbeat::{HeartbeatConfig, HeartbeatEngine, HeartbeatState, Reauthenticate},
    signalling::{ConnectionStatus, SignallingConnection},
};
use acpcommon::{
    crypto::signatures::AgentSigningKey,
    identifiers::{AgentId, Authority},
    messages::auth::Ticket,
};

use crate::{
    errors::CoreError,
    groups::{GroupClient, SyncConfig},
    identities::{Identity, IdentityStore, new_guest_identity},
    logging,
    sessions::{SessionManager, SessionManagerConfig},
};

pub use tracing::level_filters::LevelFilter;

const CURRENT_AID_FILE: &str = "current_aid";

/// Tunables of the composed stack. The defaults match the protocol
/// defaults; tests shrink the timings.
#[derive(Clone)]
pub struct AgentCpConfig {
    pub retry_policy: RetryPolicy,
    pub heartbeat: HeartbeatConfig,
    pub session: SessionManagerConfig,
    pub sync: SyncConfig,
    /// Keepalive cadence of the signalling transport.
    pub signalling_keepalive: Duration,
}

impl Default for AgentCpConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            session: SessionManagerConfig::default(),
            sync: SyncConfig::default(),
            signalling_keepalive: Duration::from_secs(30),
        }
    }
}

struct BaseUrls {
    ca_base: Option<Url>,
    ap_base: Option<Url>,
}

struct OnlineAgent {
    identity: Arc<Identity>,
    ticket: Ticket,
    heartbeat: HeartbeatEngine,
    connection: Arc<SignallingConnection>,
    sessions: Arc<SessionManager>,
    groups: Option<GroupClient>,
}

type ExitHook = Box<dyn FnOnce() + Send>;

/// Facade over the whole SDK for one process.
pub struct AgentCp {
    storage_path: PathBuf,
    seed_password: StdMutex<Option<String>>,
    base_urls: StdMutex<BaseUrls>,
    config: AgentCpConfig,
    identity_store: IdentityStore,
    loaded: StdMutex<HashMap<AgentId, Arc<Identity>>>,
    online: Mutex<HashMap<AgentId, OnlineAgent>>,
    shutdown: CancellationToken,
    exit_hook: StdMutex<Option<ExitHook>>,
}

impl AgentCp {
    /// Prepare the on-disk stores under `storage_path`. The seed password
    /// guards every private key in this store.
    pub fn initialize(
        storage_path: impl AsRef<Path>,
        seed_password: Option<String>,
    ) -> Result<Self, CoreError> {
        let storage_path = storage_path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path)
            .map_err(|e| CoreError::config(format!("cannot create storage: {e}")))?;
        let identity_store = IdentityStore::new(&storage_path)?;
        Ok(Self {
            storage_path,
            seed_password: StdMutex::new(seed_password),
            base_urls: StdMutex::new(BaseUrls {
                ca_base: None,
                ap_base: None,
            }),
            config: AgentCpConfig::default(),
            identity_store,
            loaded: StdMutex::new(HashMap::new()),
            online: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            exit_hook: StdMutex::new(None),
        })
    }

    pub fn with_config(mut self, config: AgentCpConfig) -> Self {
        self.config = config;
        self
    }

    /// Point the facade at the entry point (`ca_base`) and the group server
    /// (`ap_base`).
    pub fn set_base_urls(&self, ca_base: &str, ap_base: &str) -> Result<(), CoreError> {
        let mut urls = self.base_urls.lock().unwrap();
        urls.ca_base =
            Some(ca_base.parse().map_err(|e| CoreError::config(format!("ca_base: {e}")))?);
        urls.ap_base =
            Some(ap_base.parse().map_err(|e| CoreError::config(format!("ap_base: {e}")))?);
        Ok(())
    }

    /// Install the global log subscriber at the given level. Only the first
    /// call in a process has an effect.
    pub fn set_log_level(&self, level: LevelFilter) {
        logging::init_logger(level);
    }

    // === Identity lifecycle ===

    /// Create a fresh identity under the given authority.
    pub async fn create_aid(&self, authority: &str, name: &str) -> Result<AgentId, CoreError> {
        let authority: Authority = authority
            .parse()
            .map_err(|e: acpcommon::identifiers::AuthorityError| CoreError::config(e.to_string()))?;
        let seed_password = self.require_seed_password()?;
        let ca = self.ca_client()?;
        let identity = self
            .identity_store
            .generate(&ca, authority, name, &seed_password)
            .await?;
        let aid = identity.aid().clone();
        self.loaded
            .lock()
            .unwrap()
            .insert(aid.clone(), Arc::new(identity));
        Ok(aid)
    }

    /// Load an identity from disk and make it the current one.
    pub fn load_aid(&self, aid: &AgentId) -> Result<(), CoreError> {
        let seed_password = self.require_seed_password()?;
        let identity = self.identity_store.load(aid, &seed_password)?;
        self.loaded
            .lock()
            .unwrap()
            .insert(aid.clone(), Arc::new(identity));
        self.write_current_aid(aid)?;
        Ok(())
    }

    /// Load the bookmarked guest identity, or create a fresh one when there
    /// is none. Guests are local-only and carry no authority-signed chain.
    pub fn load_guest_aid(&self) -> Result<AgentId, CoreError> {
        if let Some(current) = self.read_current_aid() {
            if current.is_guest() && self.identity_store.exists(&current) {
                self.load_aid(&current)?;
                return Ok(current);
            }
        }
        let seed_password = self.require_seed_password()?;
        let ca_base = self.ca_base()?;
        let authority: Authority = ca_base
            .host_str()
            .unwrap_or_default()
            .parse()
            .map_err(|e: acpcommon::identifiers::AuthorityError| {
                CoreError::config(format!("ca_base has no usable host: {e}"))
            })?;
        let identity = new_guest_identity(authority, ca_base)?;
        self.identity_store.persist_local(&identity, &seed_password)?;
        let aid = identity.aid().clone();
        self.loaded
            .lock()
            .unwrap()
            .insert(aid.clone(), Arc::new(identity));
        self.write_current_aid(&aid)?;
        Ok(aid)
    }

    /// Load the identity bookmarked by the last successful load.
    pub fn load_current_aid(&self) -> Result<AgentId, CoreError> {
        let aid = self
            .read_current_aid()
            .ok_or_else(|| CoreError::not_found("no current identity"))?;
        self.load_aid(&aid)?;
        Ok(aid)
    }

    /// Import an identity from PEM material.
    pub fn import_aid(
        &self,
        aid: &AgentId,
        private_key_pem: &str,
        cert_pem: &str,
    ) -> Result<(), CoreError> {
        let seed_password = self.require_seed_password()?;
        let authority_url = self.ca_base()?;
        let identity = self.identity_store.import(
            aid,
            private_key_pem,
            cert_pem,
            authority_url,
            &seed_password,
        )?;
        self.loaded
            .lock()
            .unwrap()
            .insert(aid.clone(), Arc::new(identity));
        Ok(())
    }

    pub fn list_aids(&self) -> Result<Vec<AgentId>, CoreError> {
        self.identity_store.list()
    }

    /// Delete an identity from disk. The identity must be offline.
    pub async fn delete_aid(&self, aid: &AgentId) -> Result<(), CoreError> {
        if self.online.lock().await.contains_key(aid) {
            return Err(CoreError::state("cannot delete an online identity")
                .with_context(aid.to_string()));
        }
        self.identity_store.delete(aid)?;
        self.loaded.lock().unwrap().remove(aid);
        Ok(())
    }

    // === Presence ===

    /// Bring an identity online: sign in, start the heartbeat, connect the
    /// signalling transport, attach dispatch. A second call for an online
    /// identity is a no-op.
    pub async fn online(&self, aid: &AgentId) -> Result<(), CoreError> {
        let mut online = self.online.lock().await;
        if online.contains_key(aid) {
            return Ok(());
        }
        let identity = self.loaded_identity(aid)?;
        let ca_base = self.ca_base()?;

        let ca = self.ca_client()?;
        let ticket = ca
            .sign_in(aid, identity.signing_key(), self.config.retry_policy)
            .await?;

        let reauth: Arc<dyn Reauthenticate> = Arc::new(EntryPointReauth {
            api: ApiClient::initialize(ca_base.as_str())
                .map_err(|e| CoreError::config(e.to_string()))?,
            aid: aid.clone(),
            signing_key: identity.signing_key().clone(),
            retry_policy: self.config.retry_policy,
        });
        let heartbeat = HeartbeatEngine::spawn(
            self.config.heartbeat,
            aid.clone(),
            identity.signing_key().clone(),
            reauth,
            ticket.clone(),
            None,
        )
        .await?;

        let connection = Arc::new(SignallingConnection::connect(
            &ticket,
            self.config.signalling_keepalive,
        )?);
        let sessions = Arc::new(SessionManager::start(
            aid.clone(),
            connection.clone(),
            self.config.session,
        ));

        online.insert(
            aid.clone(),
            OnlineAgent {
                identity,
                ticket,
                heartbeat,
                connection,
                sessions,
                groups: None,
            },
        );
        info!(%aid, "agent online");
        Ok(())
    }

    /// Take an identity offline, reversing `online` in strict order. A
    /// no-op for identities that are not online.
    pub async fn offline(&self, aid: &AgentId) -> Result<(), CoreError> {
        let agent = self.online.lock().await.remove(aid);
        let Some(mut agent) = agent else {
            return Ok(());
        };

        // (1) Stop message intake.
        agent.sessions.stop().await;
        if let Some(groups) = agent.groups.take() {
            groups.stop().await;
        }
        // (2) Close the signalling transport.
        agent.connection.disconnect().await;
        // (3) Stop the heartbeat engine: flags, socket, bounded joins.
        agent.heartbeat.stop().await;
        // (4) Sign out at the entry point.
        let ca = self.ca_client()?;
        ca.sign_out(aid, agent.identity.signing_key()).await?;
        info!(%aid, "agent offline");
        Ok(())
    }

    /// Presence from the facade's point of view: the identity holds a
    /// ticket and its heartbeat engine is running. A transport that is
    /// reconnecting does not flip this; watch the status callbacks for
    /// connection quality.
    pub async fn is_online(&self, aid: &AgentId) -> bool {
        self.online
            .lock()
            .await
            .get(aid)
            .map(|agent| agent.heartbeat.state() != HeartbeatState::Stopped)
            .unwrap_or(false)
    }

    /// The session manager of an online identity.
    pub async fn session_manager(&self, aid: &AgentId) -> Result<Arc<SessionManager>, CoreError> {
        self.online
            .lock()
            .await
            .get(aid)
            .map(|agent| agent.sessions.clone())
            .ok_or_else(|| CoreError::state("identity is offline").with_context(aid.to_string()))
    }

    /// The group client of an online identity, created on first use.
    pub async fn group_client(&self, aid: &AgentId) -> Result<GroupClient, CoreError> {
        let ap_base = self.ap_base()?;
        let mut online = self.online.lock().await;
        let agent = online
            .get_mut(aid)
            .ok_or_else(|| CoreError::state("identity is offline").with_context(aid.to_string()))?;
        if agent.groups.is_none() {
            let client = GroupClient::new(
                aid.clone(),
                agent.identity.signing_key().clone(),
                &ap_base,
                agent.ticket.sign_cookie.clone(),
                &self.storage_path,
                self.config.sync,
            )?;
            agent.groups = Some(client);
        }
        Ok(agent.groups.as_ref().expect("just inserted").clone())
    }

    /// Aggregate connection status of an online identity's transport.
    pub async fn connection_status(&self, aid: &AgentId) -> Option<ConnectionStatus> {
        self.online
            .lock()
            .await
            .get(aid)
            .map(|agent| agent.connection.status())
    }

    // === Process lifecycle ===

    /// Install the exit hook that runs before `serve_forever` returns.
    pub fn register_signal_handler(&self, on_exit: Option<ExitHook>) {
        *self.exit_hook.lock().unwrap() = on_exit;
    }

    /// Request shutdown programmatically; unblocks `serve_forever`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Block until a termination signal or a programmatic shutdown, then
    /// run the exit hook and take every identity offline.
    pub async fn serve_forever(&self) -> Result<(), CoreError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
            }
            _ = terminate_signal() => {
                info!("termination signal received, shutting down");
            }
        }
        if let Some(hook) = self.exit_hook.lock().unwrap().take() {
            hook();
        }
        let aids: Vec<AgentId> = self.online.lock().await.keys().cloned().collect();
        for aid in aids {
            if let Err(error) = self.offline(&aid).await {
                warn!(%aid, %error, "error while taking agent offline");
            }
        }
        Ok(())
    }

    // === Internals ===

    fn require_seed_password(&self) -> Result<String, CoreError> {
        self.seed_password
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CoreError::config("no seed password configured"))
    }

    fn loaded_identity(&self, aid: &AgentId) -> Result<Arc<Identity>, CoreError> {
        self.loaded
            .lock()
            .unwrap()
            .get(aid)
            .cloned()
            .ok_or_else(|| CoreError::state("identity not loaded").with_context(aid.to_string()))
    }

    fn ca_base(&self) -> Result<Url, CoreError> {
        self.base_urls
            .lock()
            .unwrap()
            .ca_base
            .clone()
            .ok_or_else(|| CoreError::config("entry point base URL not set"))
    }

    fn ap_base(&self) -> Result<Url, CoreError> {
        self.base_urls
            .lock()
            .unwrap()
            .ap_base
            .clone()
            .ok_or_else(|| CoreError::config("group server base URL not set"))
    }

    fn ca_client(&self) -> Result<ApiClient, CoreError> {
        ApiClient::initialize(self.ca_base()?.as_str())
            .map_err(|e| CoreError::config(e.to_string()))
    }

    fn current_aid_path(&self) -> PathBuf {
        self.storage_path.join(CURRENT_AID_FILE)
    }

    fn read_current_aid(&self) -> Option<AgentId> {
        fs::read_to_string(self.current_aid_path())
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    fn write_current_aid(&self, aid: &AgentId) -> Result<(), CoreError> {
        crate::identities::persistence::write_atomically(
            &self.current_aid_path(),
            aid.to_string().as_bytes(),
        )?;
        Ok(())
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(error) => {
            warn!(%error, "could not install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// Reconnect seam of the heartbeat engine: a fresh sign-in at the entry
/// point with the identity's own key.
struct EntryPointReauth {
    api: ApiClient,
    aid: AgentId,
    signing_key: AgentSigningKey,
    retry_policy: RetryPolicy,
}

impl Reauthenticate for EntryPointReauth {
    fn sign_in(&self) -> BoxFuture<'_, Result<Ticket, AuthApiError>> {
        Box::pin(async move {
            self.api
                .sign_in(&self.aid, &self.signing_key, self.retry_policy)
                .await
        })
    }
}
