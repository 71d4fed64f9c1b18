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

//! The narrow interface this crate needs from the homeserver.
//!
//! The actual HTTP transport is out of scope for this crate; a real client
//! wires [`HomeserverClient`] up to its `ruma`-based request plumbing. The
//! endpoint shapes mirror `ruma-client-api`'s `client::backup` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::{error::BackupClientError, primitives::EncryptedSessionData};

/// A server-assigned backup version, as returned by the version endpoints.
///
/// `auth_data` is kept as a raw [`serde_json::Value`] rather than parsed
/// eagerly, since the homeserver is free to carry fields this crate doesn't
/// know about: callers that need the typed view go through
/// [`crate::trust::evaluate`] or [`crate::trust::AuthData`] themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupVersion {
    /// The monotonic, server-assigned version id.
    pub version: String,
    /// The backup algorithm identifier, expected to be
    /// [`crate::config::BACKUP_ALGORITHM`].
    pub algorithm: String,
    /// The auth data blob: `{ public_key, signatures, [private_key_salt,
    /// private_key_iterations] }`.
    pub auth_data: Value,
}

/// The per-session wire record the `room_keys` endpoints deal in.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedKeyRecord {
    /// The lowest ratchet index known locally for this session at the time
    /// it was backed up.
    pub first_message_index: u32,
    /// Length of the session's forwarding chain at backup time.
    pub forwarded_count: u32,
    /// Whether the backing-up device had verified the originating device.
    pub is_verified: bool,
    /// The ciphertext envelope.
    pub session_data: EncryptedSessionData,
}

/// One chunk's worth of sessions to upload, grouped by room then session
/// id. The body of the `put-all-keys` / `put-room-keys` endpoints.
pub type KeysBackupData = BTreeMap<String, BTreeMap<String, EncryptedKeyRecord>>;

/// The narrow homeserver surface the backup and restore engines need.
#[async_trait]
pub trait HomeserverClient: Send + Sync {
    /// `POST /room_keys/version`.
    async fn create_version(&self, algorithm: &str, auth_data: Value) -> Result<String, BackupClientError>;

    /// `DELETE /room_keys/version/{version}`.
    async fn delete_version(&self, version: &str) -> Result<(), BackupClientError>;

    /// `GET /room_keys/version/{version}`.
    async fn get_version(&self, version: &str) -> Result<BackupVersion, BackupClientError>;

    /// `GET /room_keys/version`.
    ///
    /// Implementations must translate `M_NOT_FOUND` into `Ok(None)`: "no
    /// backup exists" is a null success, not an error.
    async fn get_latest_version(&self) -> Result<Option<BackupVersion>, BackupClientError>;

    /// `PUT /room_keys/keys`, scoped to `version`.
    ///
    /// Implementations must translate `M_WRONG_ROOM_KEYS_VERSION` into
    /// [`BackupClientError::WrongBackupVersion`].
    async fn upload_keys(&self, version: &str, data: KeysBackupData) -> Result<(), BackupClientError>;

    /// `GET /room_keys/keys[/{room_id}[/{session_id}]]`.
    async fn fetch_keys(
        &self,
        version: &str,
        room_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<KeysBackupData, BackupClientError>;
}
