// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Drive the backup lifecycle: create or adopt a version, then keep the
//! local store's unbacked-up sessions uploaded to it.
//!
//! Callback-driven progress reporting (`backupAllGroupSessions`'s original
//! shape) is deliberately not reproduced as a listener registry here: this
//! module exposes it as a plain `async fn` that resolves once the drain is
//! done, which is the idiomatic Rust shape for "run an operation to
//! completion and report progress along the way". [`BackupState`] still
//! gets a general-purpose listener registry (see [`crate::state`]) for UI
//! binding; `backup_all_group_sessions` below layers its own bookkeeping on
//! top of that rather than needing a second listener kind.

use std::sync::Arc;

use rand::{Rng, RngCore};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Curve25519PublicKey;
use zeroize::Zeroizing;

use crate::{
    client::{HomeserverClient, KeysBackupData},
    config::BackupEngineConfig,
    error::{BackupClientError, EngineError},
    kdf, primitives,
    recovery_key::RecoveryKey,
    state::{BackupState, StateMachine},
    store::{GroupSession, LocalStore, RoomKeyCounts},
    trust::{self, VerifiedDevice},
};

/// The narrow identity surface the engine needs: something that can sign a
/// fresh backup version's auth data, and list the local user's own verified
/// devices to evaluate an existing one's trust.
///
/// Cross-signing and device discovery proper are out of scope for this
/// crate; a real client wires this up to its identity subsystem.
pub trait Identity: Send + Sync {
    /// The local user's id.
    fn user_id(&self) -> &str;
    /// The local device's id.
    fn device_id(&self) -> &str;
    /// Sign `message` with the local device's Ed25519 signing key, returning
    /// an unpadded-base64 signature.
    fn sign(&self, message: &[u8]) -> String;
    /// Every device belonging to the local user that this client currently
    /// knows about, verified or not.
    fn verified_devices(&self) -> Vec<VerifiedDevice>;
}

/// The output of [`BackupEngine::prepare_keys_backup_version`]: everything
/// needed to call [`BackupEngine::create_keys_backup_version`], plus the
/// recovery key the user must be shown exactly once.
#[derive(Debug, Clone)]
pub struct BackupCreationInfo {
    /// Always [`crate::config::BACKUP_ALGORITHM`].
    pub algorithm: String,
    /// The signed `auth_data` blob to send to `POST /room_keys/version`.
    pub auth_data: Value,
    /// The private key, encoded for display/export. Never sent to the
    /// homeserver; the caller is responsible for showing it to the user and
    /// then discarding it.
    pub recovery_key: RecoveryKey,
}

fn store_err<E: std::fmt::Display>(error: E) -> EngineError {
    EngineError::Store(error.to_string())
}

/// The result of attempting to upload a single chunk, as seen by
/// [`BackupEngine::try_upload_one_chunk`] and its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    /// Nothing was pending; the state settled at `ReadyToBackUp`.
    Idle,
    /// A chunk of `len` sessions uploaded successfully. `more_pending` is
    /// `true` when the chunk was full, meaning more sessions are likely
    /// still waiting.
    Uploaded { len: usize, more_pending: bool },
}

/// Encrypts and uploads Megolm sessions to a single active backup version.
///
/// Wrap in an `Arc` via [`BackupEngine::new`]: the debounced entry points
/// ([`BackupEngine::maybe_backup_keys`]) spawn background tasks that need to
/// hold a handle past the call that created them.
pub struct BackupEngine<S: LocalStore, C: HomeserverClient, I: Identity> {
    store: Arc<S>,
    client: Arc<C>,
    identity: Arc<I>,
    config: BackupEngineConfig,
    state: Arc<StateMachine>,
    active_public_key: RwLock<Option<Curve25519PublicKey>>,
    chunk_lock: tokio::sync::Mutex<()>,
}

impl<S, C, I> std::fmt::Debug for BackupEngine<S, C, I>
where
    S: LocalStore,
    C: HomeserverClient,
    I: Identity,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine").finish_non_exhaustive()
    }
}

impl<S, C, I> BackupEngine<S, C, I>
where
    S: LocalStore + 'static,
    C: HomeserverClient + 'static,
    I: Identity + 'static,
{
    /// Build a new engine, starting in [`BackupState::Unknown`].
    pub fn new(store: Arc<S>, client: Arc<C>, identity: Arc<I>, config: BackupEngineConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            client,
            identity,
            config,
            state: Arc::new(StateMachine::new()),
            active_public_key: RwLock::new(None),
            chunk_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The engine's state machine, for observing transitions.
    pub fn state(&self) -> Arc<StateMachine> {
        self.state.clone()
    }

    /// Generate a fresh backup private key (or derive one from `passphrase`)
    /// and sign its public counterpart with the local device's key. Does
    /// not touch the homeserver or the local store; pass the result to
    /// [`BackupEngine::create_keys_backup_version`] to actually enable the
    /// backup.
    #[instrument(skip(self, passphrase))]
    pub async fn prepare_keys_backup_version(
        &self,
        passphrase: Option<&str>,
    ) -> Result<BackupCreationInfo, EngineError> {
        let (private_key, salt_and_iterations) = match passphrase {
            Some(passphrase) => {
                let salt = kdf::generate_salt();
                let iterations = self.config.default_kdf_iterations;
                let config = self.config;
                let passphrase = passphrase.to_owned();
                let key = tokio::task::spawn_blocking(move || kdf::derive_key(&passphrase, &salt, iterations, &config))
                    .await
                    .expect("KDF task panicked")?;
                (key, Some((salt, iterations)))
            }
            None => {
                let mut key = Zeroizing::new([0u8; 32]);
                rand::thread_rng().fill_bytes(key.as_mut());
                (key, None)
            }
        };

        let public_key = primitives::public_from_private(&private_key);

        let mut auth_data = trust::AuthData {
            public_key: public_key.to_base64(),
            signatures: Default::default(),
            private_key_salt: salt_and_iterations.as_ref().map(|(salt, _)| vodozemac::base64_encode(salt)),
            private_key_iterations: salt_and_iterations.as_ref().map(|(_, iterations)| *iterations),
        };

        let signable = trust::signable_auth_data(&auth_data);
        let signature = self.identity.sign(&signable);
        auth_data
            .signatures
            .entry(self.identity.user_id().to_owned())
            .or_default()
            .insert(format!("ed25519:{}", self.identity.device_id()), signature);

        let recovery_key = RecoveryKey::new(*private_key);

        Ok(BackupCreationInfo {
            algorithm: crate::config::BACKUP_ALGORITHM.to_owned(),
            auth_data: serde_json::to_value(&auth_data).expect("AuthData always serializes"),
            recovery_key,
        })
    }

    /// Upload `info`'s auth data as a new backup version, adopt it as
    /// active, and reset every session's backed-up marker, since a marker
    /// recorded against the old version no longer means anything to the new
    /// one.
    ///
    /// On failure the engine falls back to [`BackupState::Disabled`]; the
    /// caller may retry with a fresh [`BackupCreationInfo`].
    #[instrument(skip(self, info))]
    pub async fn create_keys_backup_version(
        self: &Arc<Self>,
        info: &BackupCreationInfo,
    ) -> Result<String, EngineError> {
        self.state.transition(BackupState::Enabling).await;

        match self.client.create_version(&info.algorithm, info.auth_data.clone()).await {
            Ok(version) => {
                self.store.reset_backup_markers().await.map_err(store_err)?;
                self.store.set_active_backup_version(Some(version.clone())).await.map_err(store_err)?;

                let public_key = primitives::public_from_private(&info.recovery_key.to_bytes());
                *self.active_public_key.write().await = Some(public_key);

                info!(%version, "created and adopted new backup version");
                self.state.transition(BackupState::ReadyToBackUp).await;
                Ok(version)
            }
            Err(error) => {
                warn!(%error, "failed to create backup version");
                self.state.transition(BackupState::Disabled).await;
                Err(error.into())
            }
        }
    }

    /// Query the homeserver for its latest backup version, evaluate its
    /// trust, and adopt it if usable. This is the recovery path taken from
    /// [`BackupState::Unknown`] or [`BackupState::Disabled`].
    #[instrument(skip(self))]
    pub async fn check_and_start_keys_backup(self: &Arc<Self>) -> Result<(), EngineError> {
        match self.state.get().await {
            BackupState::CheckingBackUpOnHomeserver | BackupState::Enabling => return Ok(()),
            state if state.is_enabled() => return Ok(()),
            _ => {}
        }

        self.state.transition(BackupState::CheckingBackUpOnHomeserver).await;

        let Some(version) = self.client.get_latest_version().await? else {
            debug!("no backup version exists on the homeserver");
            self.state.transition(BackupState::Disabled).await;
            return Ok(());
        };

        let trust = trust::evaluate(&version, self.identity.user_id(), &self.identity.verified_devices());
        if !trust.usable {
            debug!(version = %version.version, "latest backup version isn't signed by a verified device");
            self.state.transition(BackupState::NotTrusted).await;
            return Ok(());
        }

        let active = self.store.active_backup_version().await.map_err(store_err)?;
        if active.as_deref() != Some(version.version.as_str()) {
            debug!(version = %version.version, "adopting a different backup version, resetting markers");
            self.store.reset_backup_markers().await.map_err(store_err)?;
            self.store.set_active_backup_version(Some(version.version.clone())).await.map_err(store_err)?;
        }

        self.adopt_public_key(&version.auth_data).await?;
        self.state.transition(BackupState::ReadyToBackUp).await;
        Ok(())
    }

    async fn adopt_public_key(&self, auth_data: &Value) -> Result<(), EngineError> {
        let auth_data: trust::AuthData =
            serde_json::from_value(auth_data.clone()).map_err(crate::error::CryptoFailure::from)?;
        let public_key = Curve25519PublicKey::from_base64(&auth_data.public_key)
            .map_err(|_| crate::error::CryptoFailure::Encoding("public_key"))?;

        *self.active_public_key.write().await = Some(public_key);

        Ok(())
    }

    /// Drain the local store's not-yet-backed-up sessions to the active
    /// version, one chunk of at most
    /// [`BackupEngineConfig::max_sessions_per_chunk`] sessions at a time,
    /// until none remain or an unrecoverable error occurs.
    ///
    /// Re-entrant: a call that arrives while another is already uploading a
    /// chunk is a silent no-op, keeping at most one chunk in flight at a
    /// time.
    #[instrument(skip(self))]
    pub async fn backup_keys(self: &Arc<Self>) -> Result<(), EngineError> {
        loop {
            match self.try_upload_one_chunk().await? {
                Some(ChunkOutcome::Uploaded { more_pending: true, .. }) => continue,
                Some(ChunkOutcome::Uploaded { more_pending: false, .. }) | Some(ChunkOutcome::Idle) | None => {
                    return Ok(());
                }
            }
        }
    }

    /// Upload at most one chunk, guarded by the same re-entrancy rule as
    /// [`BackupEngine::backup_keys`]: `None` means a chunk was already in
    /// flight elsewhere and this call is a no-op.
    async fn try_upload_one_chunk(self: &Arc<Self>) -> Result<Option<ChunkOutcome>, EngineError> {
        if self.state.get().await == BackupState::BackingUp {
            trace!("chunk upload skipped, one is already in flight");
            return Ok(None);
        }

        let Ok(_guard) = self.chunk_lock.try_lock() else {
            trace!("chunk upload skipped, the chunk lock is held");
            return Ok(None);
        };

        self.upload_one_chunk().await.map(Some)
    }

    /// Upload exactly one chunk of pending sessions, assuming the caller
    /// already holds `chunk_lock`.
    async fn upload_one_chunk(self: &Arc<Self>) -> Result<ChunkOutcome, EngineError> {
        let Some(active_version) = self.store.active_backup_version().await.map_err(store_err)? else {
            return Ok(ChunkOutcome::Idle);
        };

        let sessions = self
            .store
            .sessions_to_backup(&active_version, self.config.max_sessions_per_chunk)
            .await
            .map_err(store_err)?;

        if sessions.is_empty() {
            self.state.transition(BackupState::ReadyToBackUp).await;
            return Ok(ChunkOutcome::Idle);
        }

        self.state.transition(BackupState::BackingUp).await;

        let public_key = *self.active_public_key.read().await;
        let Some(public_key) = public_key else {
            warn!("no active public key cached, can't encrypt sessions for backup");
            self.state.transition(BackupState::ReadyToBackUp).await;
            return Ok(ChunkOutcome::Idle);
        };

        let chunk_len = sessions.len();
        let data = self.encrypt_chunk(public_key, &sessions)?;

        match self.client.upload_keys(&active_version, data).await {
            Ok(()) => {
                for session in &sessions {
                    self.store
                        .mark_backed_up(&session.session_id, &session.sender_key, &active_version)
                        .await
                        .map_err(store_err)?;
                }

                debug!(count = chunk_len, "uploaded a chunk of sessions");

                let more_pending = chunk_len == self.config.max_sessions_per_chunk;
                let next_state = if more_pending { BackupState::WillBackUp } else { BackupState::ReadyToBackUp };
                self.state.transition(next_state).await;

                Ok(ChunkOutcome::Uploaded { len: chunk_len, more_pending })
            }
            Err(BackupClientError::WrongBackupVersion) => {
                warn!("active backup version was superseded, disabling");
                self.state.transition(BackupState::WrongBackUpVersion).await;
                self.store.set_active_backup_version(None).await.map_err(store_err)?;
                *self.active_public_key.write().await = None;
                Err(EngineError::WrongBackupVersion)
            }
            Err(error) => {
                // Transient network/protocol error: the loop never
                // surfaces these, it just falls back to idle and waits
                // for the next `maybeBackupKeys` trigger to retry.
                warn!(%error, "chunk upload failed, will retry on next trigger");
                self.state.transition(BackupState::ReadyToBackUp).await;
                Ok(ChunkOutcome::Idle)
            }
        }
    }

    fn encrypt_chunk(
        &self,
        public_key: Curve25519PublicKey,
        sessions: &[GroupSession],
    ) -> Result<KeysBackupData, EngineError> {
        let mut data: KeysBackupData = Default::default();

        for session in sessions {
            let plaintext = primitives::canonical_json(&session.key)?;
            let session_data = primitives::encrypt(public_key, &plaintext);

            let record = crate::client::EncryptedKeyRecord {
                first_message_index: session.first_known_index,
                forwarded_count: session.forwarding_chain.len() as u32,
                is_verified: session.is_verified,
                session_data,
            };

            data.entry(session.room_id.clone()).or_default().insert(session.session_id.clone(), record);
        }

        Ok(data)
    }

    /// Debounced entry point: call this whenever a new session becomes
    /// eligible for backup. From [`BackupState::Unknown`] it kicks off
    /// [`BackupEngine::check_and_start_keys_backup`]; from
    /// [`BackupState::ReadyToBackUp`] it schedules a [`BackupEngine::backup_keys`]
    /// run after a uniformly random delay in `[0, backup_wait)` so that many
    /// near-simultaneous triggers collapse into a single chunk. Any other
    /// state is left alone, since a backup is already in progress, disabled,
    /// or untrusted.
    pub async fn maybe_backup_keys(self: &Arc<Self>) {
        match self.state.get().await {
            BackupState::Unknown => {
                let engine = self.clone();
                tokio::spawn(async move {
                    if let Err(error) = engine.check_and_start_keys_backup().await {
                        warn!(%error, "check_and_start_keys_backup failed");
                    }
                });
            }
            BackupState::ReadyToBackUp => {
                self.state.transition(BackupState::WillBackUp).await;

                let wait = self.config.backup_wait;
                let jitter = if wait.is_zero() {
                    wait
                } else {
                    // Compute in microseconds, not milliseconds: a
                    // sub-millisecond `wait` would otherwise truncate to
                    // zero and panic `gen_range(0..0)`.
                    std::time::Duration::from_micros(rand::thread_rng().gen_range(0..wait.as_micros() as u64))
                };

                let engine = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(jitter).await;
                    if let Err(error) = engine.backup_keys().await {
                        warn!(%error, "debounced backup_keys run failed");
                    }
                });
            }
            _ => {}
        }
    }

    /// Drive the active version's backlog to completion one chunk at a
    /// time, reporting `RoomKeyCounts` as each chunk's counts actually
    /// change, and resolve once nothing is left to back up.
    ///
    /// This is the explicit, result-returning shape of
    /// `backupAllGroupSessions`'s progress reporting: dropping the returned
    /// future cancels the operation, which is this crate's idiomatic
    /// stand-in for replacing one aggregate progress listener with another.
    #[instrument(skip(self, on_progress))]
    pub async fn backup_all_group_sessions(
        self: &Arc<Self>,
        mut on_progress: impl FnMut(RoomKeyCounts) + Send,
    ) -> Result<(), EngineError> {
        loop {
            let Some(outcome) = self.try_upload_one_chunk().await? else {
                // A chunk is already in flight elsewhere; nothing more this
                // call can drive right now.
                return Ok(());
            };

            let Some(active_version) = self.store.active_backup_version().await.map_err(store_err)? else {
                return Ok(());
            };

            let total = self.store.count_sessions(&active_version, false).await.map_err(store_err)?;
            let backed_up = self.store.count_sessions(&active_version, true).await.map_err(store_err)?;
            trace!(?outcome, total, backed_up, "reporting backup progress");
            on_progress(RoomKeyCounts { total, backed_up });

            if backed_up == total {
                return Ok(());
            }

            if !self.state.get().await.is_enabled() {
                // Disabled, not trusted, or superseded mid-drain: nothing
                // more this call can do.
                return Ok(());
            }

            if matches!(outcome, ChunkOutcome::Idle) {
                // Nothing was actually uploaded this round (e.g. the
                // public key wasn't cached yet); avoid busy-looping.
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use assert_matches2::assert_matches;
    use async_trait::async_trait;
    use vodozemac::Ed25519SecretKey;

    use super::*;
    use crate::{
        client::BackupVersion,
        store::{BackedUpMarker, GroupSessionKey},
    };

    struct TestIdentity {
        user_id: String,
        device_id: String,
        secret: Ed25519SecretKey,
    }

    impl Identity for TestIdentity {
        fn user_id(&self) -> &str {
            &self.user_id
        }

        fn device_id(&self) -> &str {
            &self.device_id
        }

        fn sign(&self, message: &[u8]) -> String {
            self.secret.sign(message).to_base64()
        }

        fn verified_devices(&self) -> Vec<VerifiedDevice> {
            vec![VerifiedDevice {
                device_id: self.device_id.clone(),
                ed25519_key: self.secret.public_key().to_base64(),
                verified: true,
            }]
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        sessions: StdMutex<Vec<GroupSession>>,
        active_version: StdMutex<Option<String>>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("memory store error")]
    struct MemoryStoreError;

    #[async_trait]
    impl LocalStore for MemoryStore {
        type Error = MemoryStoreError;

        async fn sessions_to_backup(
            &self,
            active_version: &str,
            limit: usize,
        ) -> Result<Vec<GroupSession>, Self::Error> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .filter(|s| !s.is_backed_up_to(active_version))
                .take(limit)
                .cloned()
                .collect())
        }

        async fn count_sessions(&self, active_version: &str, only_backed_up: bool) -> Result<usize, Self::Error> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .filter(|s| !only_backed_up || s.is_backed_up_to(active_version))
                .count())
        }

        async fn mark_backed_up(
            &self,
            session_id: &str,
            sender_key: &str,
            version: &str,
        ) -> Result<(), Self::Error> {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) =
                sessions.iter_mut().find(|s| s.session_id == session_id && s.sender_key == sender_key)
            {
                session.backed_up = Some(BackedUpMarker { version: version.to_owned() });
            }
            Ok(())
        }

        async fn reset_backup_markers(&self) -> Result<(), Self::Error> {
            for session in self.sessions.lock().unwrap().iter_mut() {
                session.backed_up = None;
            }
            Ok(())
        }

        async fn get_session(
            &self,
            session_id: &str,
            sender_key: &str,
        ) -> Result<Option<GroupSession>, Self::Error> {
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.session_id == session_id && s.sender_key == sender_key)
                .cloned())
        }

        async fn import_session(&self, session: GroupSession) -> Result<(), Self::Error> {
            self.sessions.lock().unwrap().push(session);
            Ok(())
        }

        async fn active_backup_version(&self) -> Result<Option<String>, Self::Error> {
            Ok(self.active_version.lock().unwrap().clone())
        }

        async fn set_active_backup_version(&self, version: Option<String>) -> Result<(), Self::Error> {
            *self.active_version.lock().unwrap() = version;
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryClient {
        versions: StdMutex<Vec<BackupVersion>>,
        uploaded: StdMutex<KeysBackupData>,
    }

    #[async_trait]
    impl HomeserverClient for MemoryClient {
        async fn create_version(&self, algorithm: &str, auth_data: Value) -> Result<String, BackupClientError> {
            let mut versions = self.versions.lock().unwrap();
            let id = (versions.len() + 1).to_string();
            versions.push(BackupVersion { version: id.clone(), algorithm: algorithm.to_owned(), auth_data });
            Ok(id)
        }

        async fn delete_version(&self, _version: &str) -> Result<(), BackupClientError> {
            Ok(())
        }

        async fn get_version(&self, version: &str) -> Result<BackupVersion, BackupClientError> {
            self.versions
                .lock()
                .unwrap()
                .iter()
                .find(|v| v.version == version)
                .cloned()
                .ok_or(BackupClientError::NotFound)
        }

        async fn get_latest_version(&self) -> Result<Option<BackupVersion>, BackupClientError> {
            Ok(self.versions.lock().unwrap().last().cloned())
        }

        async fn upload_keys(&self, _version: &str, data: KeysBackupData) -> Result<(), BackupClientError> {
            let mut uploaded = self.uploaded.lock().unwrap();
            for (room_id, sessions) in data {
                uploaded.entry(room_id).or_default().extend(sessions);
            }
            Ok(())
        }

        async fn fetch_keys(
            &self,
            _version: &str,
            _room_id: Option<&str>,
            _session_id: Option<&str>,
        ) -> Result<KeysBackupData, BackupClientError> {
            Ok(self.uploaded.lock().unwrap().clone())
        }
    }

    fn test_session(room_id: &str, session_id: &str) -> GroupSession {
        GroupSession {
            room_id: room_id.to_owned(),
            session_id: session_id.to_owned(),
            sender_key: "sender".to_owned(),
            first_known_index: 0,
            forwarding_chain: Vec::new(),
            is_verified: true,
            backed_up: None,
            key: GroupSessionKey {
                algorithm: "m.megolm.v1.aes-sha2".to_owned(),
                sender_key: "sender".to_owned(),
                sender_claimed_keys: Default::default(),
                forwarding_chain: Vec::new(),
                session_key: "opaque-session-key".to_owned(),
            },
        }
    }

    fn test_engine() -> Arc<BackupEngine<MemoryStore, MemoryClient, TestIdentity>> {
        BackupEngine::new(
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryClient::default()),
            Arc::new(TestIdentity {
                user_id: "@alice:example.org".to_owned(),
                device_id: "DEVICE1".to_owned(),
                secret: Ed25519SecretKey::new(),
            }),
            BackupEngineConfig::fast_for_tests(),
        )
    }

    #[tokio::test]
    async fn creating_a_version_enables_backup_and_drains_sessions() {
        let engine = test_engine();
        engine.store.sessions.lock().unwrap().push(test_session("!room:example.org", "session1"));
        engine.store.sessions.lock().unwrap().push(test_session("!room:example.org", "session2"));

        let info = engine.prepare_keys_backup_version(None).await.unwrap();
        let version = engine.create_keys_backup_version(&info).await.unwrap();
        assert_eq!(version, "1");
        assert_eq!(engine.state.get().await, BackupState::ReadyToBackUp);

        engine.backup_keys().await.unwrap();
        assert_eq!(engine.state.get().await, BackupState::ReadyToBackUp);

        let backed_up = engine.store.count_sessions(&version, true).await.unwrap();
        assert_eq!(backed_up, 2);
    }

    #[tokio::test]
    async fn wrong_backup_version_disables_and_clears_the_cached_key() {
        struct RejectingClient(MemoryClient);

        #[async_trait]
        impl HomeserverClient for RejectingClient {
            async fn create_version(&self, a: &str, d: Value) -> Result<String, BackupClientError> {
                self.0.create_version(a, d).await
            }
            async fn delete_version(&self, v: &str) -> Result<(), BackupClientError> {
                self.0.delete_version(v).await
            }
            async fn get_version(&self, v: &str) -> Result<BackupVersion, BackupClientError> {
                self.0.get_version(v).await
            }
            async fn get_latest_version(&self) -> Result<Option<BackupVersion>, BackupClientError> {
                self.0.get_latest_version().await
            }
            async fn upload_keys(&self, _version: &str, _data: KeysBackupData) -> Result<(), BackupClientError> {
                Err(BackupClientError::WrongBackupVersion)
            }
            async fn fetch_keys(
                &self,
                v: &str,
                r: Option<&str>,
                s: Option<&str>,
            ) -> Result<KeysBackupData, BackupClientError> {
                self.0.fetch_keys(v, r, s).await
            }
        }

        let store = Arc::new(MemoryStore::default());
        store.sessions.lock().unwrap().push(test_session("!room:example.org", "session1"));

        let engine = BackupEngine::new(
            store,
            Arc::new(RejectingClient(MemoryClient::default())),
            Arc::new(TestIdentity {
                user_id: "@alice:example.org".to_owned(),
                device_id: "DEVICE1".to_owned(),
                secret: Ed25519SecretKey::new(),
            }),
            BackupEngineConfig::fast_for_tests(),
        );

        let info = engine.prepare_keys_backup_version(None).await.unwrap();
        engine.create_keys_backup_version(&info).await.unwrap();

        let result = engine.backup_keys().await;
        assert_matches!(result, Err(EngineError::WrongBackupVersion));
        assert_eq!(engine.state.get().await, BackupState::WrongBackUpVersion);
        assert!(engine.active_public_key.read().await.is_none());
    }

    #[tokio::test]
    async fn re_entrant_backup_keys_is_a_no_op() {
        let engine = test_engine();
        let _guard = engine.chunk_lock.lock().await;

        // Held lock simulates a chunk already in flight; the re-entrant
        // call must return immediately rather than deadlock.
        engine.backup_keys().await.unwrap();
    }
}
