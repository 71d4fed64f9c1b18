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

//! The narrow interface this crate needs from wherever group sessions are
//! actually persisted.
//!
//! The concrete cryptostore (Megolm ratchet state, SQLite/IndexedDB
//! backing, etc.) is out of scope for this crate; a real client implements
//! [`LocalStore`] on top of whatever store it already has.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The plaintext Megolm session material this crate protects.
///
/// Field order matches the wire schema of `session_data`'s plaintext
/// exactly: `algorithm`, `sender_key`, `sender_claimed_keys`,
/// `forwarding_curve25519_key_chain`, `session_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSessionKey {
    /// The Megolm algorithm tag, e.g. `"m.megolm.v1.aes-sha2"`.
    pub algorithm: String,
    /// The sender's Curve25519 identity key.
    pub sender_key: String,
    /// Mapping from key-type tag (e.g. `"ed25519"`) to the sender's claimed
    /// key of that type.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Curve25519 keys describing this session's re-share provenance, in
    /// the order it was forwarded through.
    #[serde(default, rename = "forwarding_curve25519_key_chain")]
    pub forwarding_chain: Vec<String>,
    /// The opaque Megolm session key material.
    pub session_key: String,
}

/// A marker recording that a session has been uploaded to a specific
/// backup version.
///
/// A marker only counts as "backed up" while `version` still matches the
/// store's active backup version id; rotating to a new version without
/// clearing markers would otherwise make a session from an old backup look
/// backed up against the new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackedUpMarker {
    /// The backup version id this session was uploaded to.
    pub version: String,
}

/// A session as the local store sees it: the data needed to decide whether
/// it's eligible for backup, plus enough identity to find it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSession {
    /// The room this session belongs to.
    pub room_id: String,
    /// The session's id.
    pub session_id: String,
    /// The sender's identity key.
    pub sender_key: String,
    /// The lowest ratchet index this device knows for the session.
    pub first_known_index: u32,
    /// Re-share provenance; empty if received directly from its creator.
    pub forwarding_chain: Vec<String>,
    /// Whether the session's originating device is locally marked
    /// verified.
    pub is_verified: bool,
    /// Set once this session has been uploaded to some backup version.
    pub backed_up: Option<BackedUpMarker>,
    /// The exportable plaintext, opaque to the store itself.
    pub key: GroupSessionKey,
}

impl GroupSession {
    /// `true` iff this session counts as backed up against `active_version`.
    pub fn is_backed_up_to(&self, active_version: &str) -> bool {
        self.backed_up.as_ref().is_some_and(|marker| marker.version == active_version)
    }
}

/// The number of sessions the store knows about, split by backup status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// Every session the store holds.
    pub total: usize,
    /// Sessions marked as backed up to the currently active version.
    pub backed_up: usize,
}

/// The collaborator this crate needs from the local group-session store.
///
/// Implementations must serialize `sessions_to_backup`, `mark_backed_up`,
/// and `reset_backup_markers` against each other: the engine relies on at
/// most one chunk being "in flight" at a time, but it does not itself
/// serialize calls into the store across different `BackupEngine`
/// instances.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// The error type store operations can fail with.
    type Error: std::fmt::Display + Send + Sync + 'static;

    /// Sessions not marked as backed up to `active_version`, in no
    /// particular order, capped at `limit`.
    async fn sessions_to_backup(
        &self,
        active_version: &str,
        limit: usize,
    ) -> Result<Vec<GroupSession>, Self::Error>;

    /// Count sessions, optionally restricted to ones backed up to
    /// `active_version`.
    async fn count_sessions(
        &self,
        active_version: &str,
        only_backed_up: bool,
    ) -> Result<usize, Self::Error>;

    /// Mark one session as backed up to `version`.
    async fn mark_backed_up(
        &self,
        session_id: &str,
        sender_key: &str,
        version: &str,
    ) -> Result<(), Self::Error>;

    /// Clear every session's backed-up marker. Called exactly when a new
    /// backup version is created or adopted; never races with an in-flight
    /// chunk.
    async fn reset_backup_markers(&self) -> Result<(), Self::Error>;

    /// Fetch a single session, e.g. to check verification status during
    /// restore.
    async fn get_session(
        &self,
        session_id: &str,
        sender_key: &str,
    ) -> Result<Option<GroupSession>, Self::Error>;

    /// Import a session recovered from a backup. A store implementation
    /// decides whether this creates a new Megolm ratchet or merely extends
    /// an already-known one to an earlier index.
    async fn import_session(&self, session: GroupSession) -> Result<(), Self::Error>;

    /// Get/set the id of the backup version this device is actively
    /// uploading to.
    async fn active_backup_version(&self) -> Result<Option<String>, Self::Error>;

    /// Persist the active backup version id. Pass `None` to disable.
    async fn set_active_backup_version(&self, version: Option<String>) -> Result<(), Self::Error>;
}
