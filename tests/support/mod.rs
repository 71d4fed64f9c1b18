//! In-memory fakes for [`matrix_sdk_key_backup::LocalStore`] and
//! [`matrix_sdk_key_backup::HomeserverClient`], shared by the end-to-end
//! scenario tests.

use std::sync::Mutex;

use async_trait::async_trait;
use matrix_sdk_key_backup::{
    client::{BackupVersion, EncryptedKeyRecord, HomeserverClient, KeysBackupData},
    engine::Identity,
    store::{BackedUpMarker, GroupSession, GroupSessionKey, LocalStore, RoomKeyCounts},
    trust::VerifiedDevice,
    BackupClientError,
};
use serde_json::Value;
use vodozemac::Ed25519SecretKey;

#[derive(Default)]
pub struct MemoryStore {
    pub sessions: Mutex<Vec<GroupSession>>,
    pub active_version: Mutex<Option<String>>,
}

#[derive(Debug, thiserror::Error)]
#[error("memory store error")]
pub struct MemoryStoreError;

#[async_trait]
impl LocalStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn sessions_to_backup(&self, active_version: &str, limit: usize) -> Result<Vec<GroupSession>, Self::Error> {
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

    async fn mark_backed_up(&self, session_id: &str, sender_key: &str, version: &str) -> Result<(), Self::Error> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.iter_mut().find(|s| s.session_id == session_id && s.sender_key == sender_key) {
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

    async fn get_session(&self, session_id: &str, sender_key: &str) -> Result<Option<GroupSession>, Self::Error> {
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

impl MemoryStore {
    pub fn counts(&self, active_version: &str) -> RoomKeyCounts {
        let sessions = self.sessions.lock().unwrap();
        let total = sessions.len();
        let backed_up = sessions.iter().filter(|s| s.is_backed_up_to(active_version)).count();
        RoomKeyCounts { total, backed_up }
    }

    pub fn push_session(&self, room_id: &str, session_id: &str) {
        self.sessions.lock().unwrap().push(test_session(room_id, session_id));
    }
}

pub fn test_session(room_id: &str, session_id: &str) -> GroupSession {
    GroupSession {
        room_id: room_id.to_owned(),
        session_id: session_id.to_owned(),
        sender_key: "sender_curve25519_key".to_owned(),
        first_known_index: 0,
        forwarding_chain: Vec::new(),
        is_verified: true,
        backed_up: None,
        key: GroupSessionKey {
            algorithm: "m.megolm.v1.aes-sha2".to_owned(),
            sender_key: "sender_curve25519_key".to_owned(),
            sender_claimed_keys: Default::default(),
            forwarding_chain: Vec::new(),
            session_key: format!("opaque-session-key-for-{session_id}"),
        },
    }
}

/// A homeserver fake: version CRUD backed by a `Vec`, uploads accumulated
/// into a single map, an optional "reject everything" switch for S6.
#[derive(Default)]
pub struct MemoryClient {
    pub versions: Mutex<Vec<BackupVersion>>,
    pub uploaded: Mutex<KeysBackupData>,
    pub active_version_index: Mutex<Option<usize>>,
}

#[async_trait]
impl HomeserverClient for MemoryClient {
    async fn create_version(&self, algorithm: &str, auth_data: Value) -> Result<String, BackupClientError> {
        let mut versions = self.versions.lock().unwrap();
        let id = (versions.len() + 1).to_string();
        versions.push(BackupVersion { version: id.clone(), algorithm: algorithm.to_owned(), auth_data });
        *self.active_version_index.lock().unwrap() = Some(versions.len() - 1);
        Ok(id)
    }

    async fn delete_version(&self, _version: &str) -> Result<(), BackupClientError> {
        Ok(())
    }

    async fn get_version(&self, version: &str) -> Result<BackupVersion, BackupClientError> {
        self.versions.lock().unwrap().iter().find(|v| v.version == version).cloned().ok_or(BackupClientError::NotFound)
    }

    async fn get_latest_version(&self) -> Result<Option<BackupVersion>, BackupClientError> {
        Ok(self.versions.lock().unwrap().last().cloned())
    }

    async fn upload_keys(&self, version: &str, data: KeysBackupData) -> Result<(), BackupClientError> {
        let active_is_latest = {
            let versions = self.versions.lock().unwrap();
            versions.last().map(|v| v.version.as_str()) == Some(version)
        };
        if !active_is_latest {
            return Err(BackupClientError::WrongBackupVersion);
        }

        let mut uploaded = self.uploaded.lock().unwrap();
        for (room_id, sessions) in data {
            uploaded.entry(room_id).or_default().extend(sessions);
        }
        Ok(())
    }

    async fn fetch_keys(
        &self,
        _version: &str,
        room_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<KeysBackupData, BackupClientError> {
        let uploaded = self.uploaded.lock().unwrap();
        let mut result: KeysBackupData = Default::default();

        for (room, sessions) in uploaded.iter() {
            if room_id.is_some_and(|r| r != room) {
                continue;
            }
            for (session, record) in sessions {
                if session_id.is_some_and(|s| s != session) {
                    continue;
                }
                result.entry(room.clone()).or_default().insert(session.clone(), record_clone(record));
            }
        }

        Ok(result)
    }
}

fn record_clone(record: &EncryptedKeyRecord) -> EncryptedKeyRecord {
    EncryptedKeyRecord {
        first_message_index: record.first_message_index,
        forwarded_count: record.forwarded_count,
        is_verified: record.is_verified,
        session_data: record.session_data.clone(),
    }
}

/// A device identity: signs with its own freshly generated Ed25519 key and
/// reports only itself as verified, unless told otherwise.
pub struct TestIdentity {
    pub user_id: String,
    pub device_id: String,
    pub secret: Ed25519SecretKey,
    pub verified_devices: Mutex<Vec<VerifiedDevice>>,
}

impl TestIdentity {
    pub fn new(user_id: &str, device_id: &str) -> Self {
        let secret = Ed25519SecretKey::new();
        let verified_devices = vec![VerifiedDevice {
            device_id: device_id.to_owned(),
            ed25519_key: secret.public_key().to_base64(),
            verified: true,
        }];
        Self { user_id: user_id.to_owned(), device_id: device_id.to_owned(), secret, verified_devices: Mutex::new(verified_devices) }
    }

    /// Build an identity that doesn't yet consider its own device verified,
    /// for S7's "fresh device, not yet cross-signed" starting point.
    pub fn new_unverified(user_id: &str, device_id: &str) -> Self {
        let identity = Self::new(user_id, device_id);
        identity.verified_devices.lock().unwrap()[0].verified = false;
        identity
    }

    pub fn verify_device(&self, device_id: &str) {
        for device in self.verified_devices.lock().unwrap().iter_mut() {
            if device.device_id == device_id {
                device.verified = true;
            }
        }
    }

    /// Learn about another user's device, e.g. as the result of an
    /// interactive verification with it.
    pub fn add_device(&self, device: VerifiedDevice) {
        self.verified_devices.lock().unwrap().push(device);
    }
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
        self.verified_devices.lock().unwrap().clone()
    }
}
