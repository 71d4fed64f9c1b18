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

//! Decide whether a server-advertised backup version is trustworthy.
//!
//! A backup version is [`BackupVersionTrust::usable`] iff at least one of
//! its signatures, made by the local user, verifies against a device the
//! local user has marked verified. Unknown devices and signatures from
//! devices that exist but aren't verified don't count, even if the
//! signature itself checks out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{client::BackupVersion, primitives};

/// A minimal view of one of the local user's own devices, as far as the
/// trust evaluator cares: its Ed25519 fingerprint and whether the local
/// user has marked it verified.
///
/// Cross-signing, device discovery, and the rest of the identity subsystem
/// are out of scope for this crate; callers hand in whatever devices they
/// already know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedDevice {
    /// The device's id, e.g. `"JLAFKJWSCS"`.
    pub device_id: String,
    /// The device's Ed25519 identity key, base64-encoded.
    pub ed25519_key: String,
    /// Whether the local user has marked this device verified.
    pub verified: bool,
}

/// The auth data of a backup version, parsed enough to evaluate trust.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthData {
    /// Curve25519 public key used to encrypt session keys, base64-encoded.
    pub public_key: String,
    /// `user_id -> signing_key_id -> base64 signature`.
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
    /// Present when the private key was derived from a passphrase.
    #[serde(default)]
    pub private_key_salt: Option<String>,
    /// Present alongside `private_key_salt`.
    #[serde(default)]
    pub private_key_iterations: Option<u32>,
}

/// The per-signature verdict recorded in a [`BackupVersionTrust`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureState {
    /// The device the `ed25519:<device_id>` key id named.
    pub device_id: String,
    /// `true` if the device is known locally.
    pub device_known: bool,
    /// `true` if the signature cryptographically verifies against the
    /// device's Ed25519 key. `false` (not absent) when the device is
    /// unknown, since there's nothing to verify against.
    pub valid: bool,
    /// `true` if the device is known *and* locally marked verified.
    pub device_verified: bool,
}

/// The outcome of evaluating a [`BackupVersion`]'s trustworthiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupVersionTrust {
    /// `true` iff at least one signature is both valid and made by a
    /// verified device.
    pub usable: bool,
    /// Every signature considered, whether or not it ended up usable.
    pub signatures: Vec<SignatureState>,
}

/// Evaluate whether `version` is usable, given the local user's id and the
/// set of devices it owns.
///
/// Only signatures under the `ed25519:` algorithm and under `user_id` are
/// considered; other users' signatures on a backup's auth data (which the
/// spec doesn't define any use for) are ignored entirely.
pub fn evaluate(version: &BackupVersion, user_id: &str, devices: &[VerifiedDevice]) -> BackupVersionTrust {
    let auth_data: AuthData = match serde_json::from_value(version.auth_data.clone()) {
        Ok(data) => data,
        Err(_) => return BackupVersionTrust { usable: false, signatures: Vec::new() },
    };

    let signable = signable_auth_data(&auth_data);

    let signatures = auth_data
        .signatures
        .get(user_id)
        .into_iter()
        .flat_map(|by_key_id| by_key_id.iter())
        .filter_map(|(key_id, signature)| {
            let device_id = key_id.strip_prefix("ed25519:")?;
            let device = devices.iter().find(|d| d.device_id == device_id);

            let (valid, device_verified) = match device {
                Some(device) => {
                    (primitives::verify_ed25519(&device.ed25519_key, &signable, signature), device.verified)
                }
                None => (false, false),
            };

            Some(SignatureState {
                device_id: device_id.to_owned(),
                device_known: device.is_some(),
                valid,
                device_verified,
            })
        })
        .collect::<Vec<_>>();

    let usable = signatures.iter().any(|s| s.valid && s.device_verified);

    BackupVersionTrust { usable, signatures }
}

/// The canonical JSON of `auth_data` with its `signatures` field removed,
/// which is what signatures over a backup version actually cover.
///
/// `pub(crate)` because [`crate::engine::BackupEngine::prepare_keys_backup_version`]
/// needs to produce the same bytes in order to sign a version it's about to
/// create.
pub(crate) fn signable_auth_data(auth_data: &AuthData) -> Vec<u8> {
    let mut value = serde_json::to_value(auth_data).expect("AuthData always serializes");
    if let Some(object) = value.as_object_mut() {
        object.remove("signatures");
    }

    primitives::canonical_json(&value).expect("a stripped Value always serializes")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vodozemac::Ed25519SecretKey;

    use super::*;

    fn version_with_signature(
        user_id: &str,
        device_id: &str,
        secret: &Ed25519SecretKey,
    ) -> BackupVersion {
        let mut auth_data = AuthData {
            public_key: "YWJjZGVm".to_owned(),
            signatures: BTreeMap::new(),
            private_key_salt: None,
            private_key_iterations: None,
        };
        let signable = signable_auth_data(&auth_data);
        let signature = secret.sign(&signable).to_base64();

        auth_data
            .signatures
            .entry(user_id.to_owned())
            .or_default()
            .insert(format!("ed25519:{device_id}"), signature);

        BackupVersion {
            version: "1".to_owned(),
            algorithm: crate::config::BACKUP_ALGORITHM.to_owned(),
            auth_data: serde_json::to_value(auth_data).unwrap(),
        }
    }

    #[test]
    fn usable_when_signed_by_verified_device() {
        let secret = Ed25519SecretKey::new();
        let version = version_with_signature("@alice:example.org", "DEVICE1", &secret);

        let devices = vec![VerifiedDevice {
            device_id: "DEVICE1".to_owned(),
            ed25519_key: secret.public_key().to_base64(),
            verified: true,
        }];

        let trust = evaluate(&version, "@alice:example.org", &devices);
        assert!(trust.usable);
    }

    #[test]
    fn not_usable_when_device_unverified() {
        let secret = Ed25519SecretKey::new();
        let version = version_with_signature("@alice:example.org", "DEVICE1", &secret);

        let devices = vec![VerifiedDevice {
            device_id: "DEVICE1".to_owned(),
            ed25519_key: secret.public_key().to_base64(),
            verified: false,
        }];

        let trust = evaluate(&version, "@alice:example.org", &devices);
        assert!(!trust.usable);
        assert!(trust.signatures[0].valid);
        assert!(!trust.signatures[0].device_verified);
    }

    #[test]
    fn not_usable_when_device_unknown() {
        let secret = Ed25519SecretKey::new();
        let version = version_with_signature("@alice:example.org", "DEVICE1", &secret);

        let trust = evaluate(&version, "@alice:example.org", &[]);
        assert!(!trust.usable);
        assert!(!trust.signatures[0].device_known);
    }

    #[test]
    fn not_usable_with_no_signatures() {
        let version = BackupVersion {
            version: "1".to_owned(),
            algorithm: crate::config::BACKUP_ALGORITHM.to_owned(),
            auth_data: json!({ "public_key": "YWJjZGVm", "signatures": {} }),
        };

        let trust = evaluate(&version, "@alice:example.org", &[]);
        assert!(!trust.usable);
        assert!(trust.signatures.is_empty());
    }
}
