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

//! Fetch a backup version's ciphertext and restore it into the local store.

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::{
    client::{EncryptedKeyRecord, HomeserverClient},
    config::BackupEngineConfig,
    error::{CryptoFailure, RestoreError},
    kdf, primitives,
    recovery_key::RecoveryKey,
    store::{BackedUpMarker, GroupSession, LocalStore},
    trust::{self, AuthData, BackupVersionTrust, VerifiedDevice},
};

/// How many sessions a restore found on the server vs. actually decrypted
/// and imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Total `EncryptedKeyRecord`s returned by the server for the requested
    /// scope.
    pub total_found: usize,
    /// How many of those decrypted and were imported into the local store.
    pub total_imported: usize,
}

fn store_err<E: std::fmt::Display>(error: E) -> RestoreError {
    RestoreError::Store(error.to_string())
}

/// Restores Megolm sessions from a server-side backup version.
pub struct RestoreEngine<S: LocalStore, C: HomeserverClient> {
    store: Arc<S>,
    client: Arc<C>,
    config: BackupEngineConfig,
}

impl<S, C> std::fmt::Debug for RestoreEngine<S, C>
where
    S: LocalStore,
    C: HomeserverClient,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreEngine").finish_non_exhaustive()
    }
}

impl<S, C> RestoreEngine<S, C>
where
    S: LocalStore,
    C: HomeserverClient,
{
    /// Build a restore engine over the same store/client/config a
    /// [`crate::engine::BackupEngine`] uses.
    pub fn new(store: Arc<S>, client: Arc<C>, config: BackupEngineConfig) -> Self {
        Self { store, client, config }
    }

    /// Restore sessions from `version` using a recovery key string (as
    /// produced by [`RecoveryKey::to_string`]), optionally scoped to one
    /// room or one session.
    ///
    /// Fails with [`RestoreError::InvalidRecoveryKey`] if the string doesn't
    /// decode. If at least one record was fetched from the server but none
    /// decrypted successfully, fails with
    /// [`RestoreError::InvalidRecoveryKeyOrPassword`], since a wrong key and
    /// a wrong password are indistinguishable from the ciphertext alone.
    ///
    /// Sessions restored from a version other than the store's currently
    /// active one are left unmarked, making them eligible for the next
    /// backup chunk; sessions restored from the active version are marked
    /// backed up to it, since they're already known to the server.
    #[instrument(skip(self, recovery_key))]
    pub async fn restore_with_recovery_key(
        &self,
        version: &str,
        recovery_key: &str,
        room_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<RestoreSummary, RestoreError> {
        let recovery_key = RecoveryKey::parse(recovery_key)?;
        self.restore_with_decoded_key(version, &recovery_key, room_id, session_id).await
    }

    async fn restore_with_decoded_key(
        &self,
        version: &str,
        recovery_key: &RecoveryKey,
        room_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<RestoreSummary, RestoreError> {
        let fetched = self.client.fetch_keys(version, room_id, session_id).await?;

        let total_found: usize = fetched.values().map(|sessions| sessions.len()).sum();
        let mut decoded = Vec::new();

        for (room_id, sessions) in fetched {
            for (session_id, record) in sessions {
                match Self::decrypt_key_backup_data(recovery_key, &room_id, &session_id, record) {
                    Ok(session) => decoded.push(session),
                    Err(error) => {
                        warn!(%error, %room_id, %session_id, "failed to decrypt a backed-up session");
                    }
                }
            }
        }

        if total_found > 0 && decoded.is_empty() {
            return Err(RestoreError::InvalidRecoveryKeyOrPassword);
        }

        let active_version = self.store.active_backup_version().await.map_err(store_err)?;
        let restoring_active_version = active_version.as_deref() == Some(version);

        let total_imported = decoded.len();
        for mut session in decoded {
            session.backed_up = if restoring_active_version {
                Some(BackedUpMarker { version: version.to_owned() })
            } else {
                None
            };
            self.store.import_session(session).await.map_err(store_err)?;
        }

        Ok(RestoreSummary { total_found, total_imported })
    }

    fn decrypt_key_backup_data(
        recovery_key: &RecoveryKey,
        room_id: &str,
        session_id: &str,
        record: EncryptedKeyRecord,
    ) -> Result<GroupSession, CryptoFailure> {
        let plaintext = primitives::decrypt(&recovery_key.to_bytes(), record.session_data)?;
        let key: crate::store::GroupSessionKey = serde_json::from_slice(&plaintext)?;

        Ok(GroupSession {
            room_id: room_id.to_owned(),
            session_id: session_id.to_owned(),
            sender_key: key.sender_key.clone(),
            first_known_index: record.first_message_index,
            forwarding_chain: key.forwarding_chain.clone(),
            is_verified: record.is_verified,
            backed_up: None,
            key,
        })
    }

    /// Fetch `version`'s auth data, derive its private key from `password`,
    /// and delegate to [`RestoreEngine::restore_with_recovery_key`].
    ///
    /// Fails with [`RestoreError::NoPasswordSupport`] if the version's
    /// `auth_data` carries no `private_key_salt` / `private_key_iterations`,
    /// because it was created without a passphrase.
    #[instrument(skip(self, password))]
    pub async fn restore_with_password(
        &self,
        version: &str,
        password: &str,
        room_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<RestoreSummary, RestoreError> {
        let backup_version = self.client.get_version(version).await?;
        let auth_data: AuthData =
            serde_json::from_value(backup_version.auth_data).map_err(CryptoFailure::from)?;

        let (Some(salt_b64), Some(iterations)) = (auth_data.private_key_salt, auth_data.private_key_iterations)
        else {
            return Err(RestoreError::NoPasswordSupport);
        };

        let salt_bytes = vodozemac::base64_decode(&salt_b64)
            .map_err(|_| CryptoFailure::Encoding("private_key_salt"))?;
        let salt: [u8; 32] =
            salt_bytes.try_into().map_err(|_| CryptoFailure::Encoding("private_key_salt"))?;

        let config = self.config;
        let password = password.to_owned();
        let derived = tokio::task::spawn_blocking(move || kdf::derive_key(&password, &salt, iterations, &config))
            .await
            .expect("KDF task panicked")?;
        let recovery_key = RecoveryKey::new(*derived);

        self.restore_with_decoded_key(version, &recovery_key, room_id, session_id).await
    }

    /// Evaluate `version`'s trust, as [`trust::evaluate`] would from the
    /// backup engine side. Exposed here too since a restore is often the
    /// first time a client ever looks at a version's signatures.
    pub async fn get_keys_backup_trust(
        &self,
        version: &str,
        user_id: &str,
        devices: &[VerifiedDevice],
    ) -> Result<BackupVersionTrust, RestoreError> {
        let version = self.client.get_version(version).await?;
        Ok(trust::evaluate(&version, user_id, devices))
    }
}
