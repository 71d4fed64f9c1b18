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

//! The asymmetric public-key box, Ed25519 signature verification, and
//! canonical JSON helpers the rest of the crate builds on.
//!
//! This module is intentionally the only place that imports `vodozemac`
//! directly; everything above it talks in terms of [`EncryptedSessionData`]
//! and [`serde_json::Value`].

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use vodozemac::{
    pk_encryption::{Message, PkDecryption, PkEncryption},
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
};

use crate::error::CryptoFailure;

/// The ciphertext envelope stored server-side for one session
/// (`session_data` in the wire schema).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncryptedSessionData {
    /// Base64-encoded ciphertext.
    pub ciphertext: String,
    /// Base64-encoded MAC.
    pub mac: String,
    /// Base64-encoded ephemeral public key.
    pub ephemeral: String,
}

impl From<Message> for EncryptedSessionData {
    fn from(message: Message) -> Self {
        Self {
            ciphertext: vodozemac::base64_encode(message.ciphertext),
            mac: vodozemac::base64_encode(message.mac),
            ephemeral: message.ephemeral_key.to_base64(),
        }
    }
}

impl EncryptedSessionData {
    fn into_message(self) -> Result<Message, CryptoFailure> {
        let ciphertext = vodozemac::base64_decode(&self.ciphertext)
            .map_err(|_| CryptoFailure::Encoding("ciphertext"))?;
        let mac = vodozemac::base64_decode(&self.mac).map_err(|_| CryptoFailure::Encoding("mac"))?;
        let ephemeral_key = Curve25519PublicKey::from_base64(&self.ephemeral)
            .map_err(|_| CryptoFailure::Encoding("ephemeral"))?;

        Ok(Message { ciphertext, mac, ephemeral_key })
    }
}

/// Derive the public half of a 32-byte backup private key.
pub fn public_from_private(private_key: &[u8; 32]) -> Curve25519PublicKey {
    PkDecryption::from_bytes(private_key).public_key()
}

/// Encrypt `plaintext` under `public_key` using an ephemeral-ECDH + AES-CBC
/// + HMAC construction (vodozemac's `insecure-pk-encryption`, the same
/// primitive libolm's `PkEncryption` used).
pub fn encrypt(public_key: Curve25519PublicKey, plaintext: &[u8]) -> EncryptedSessionData {
    PkEncryption::from_key(public_key).encrypt(plaintext).into()
}

/// Decrypt a [`EncryptedSessionData`] envelope with the 32-byte private key.
pub fn decrypt(
    private_key: &[u8; 32],
    data: EncryptedSessionData,
) -> Result<Vec<u8>, CryptoFailure> {
    let message = data.into_message()?;
    PkDecryption::from_bytes(private_key).decrypt(&message).map_err(CryptoFailure::from)
}

/// Verify an Ed25519 signature over `message` using `signer_public_key`.
///
/// Both the public key and signature are expected unpadded-base64 encoded,
/// as they appear on the wire. Returns `false` (never an error) for any
/// malformed input, matching the "does this signature check out" framing
/// the trust evaluator needs.
pub fn verify_ed25519(signer_public_key: &str, message: &[u8], signature_base64: &str) -> bool {
    let Ok(public_key) = Ed25519PublicKey::from_base64(signer_public_key) else {
        return false;
    };
    let Ok(signature_bytes) = vodozemac::base64_decode(signature_base64) else {
        return false;
    };
    let Ok(signature) = Ed25519Signature::from_slice(&signature_bytes) else {
        return false;
    };

    public_key.verify(message, &signature).is_ok()
}

/// Serialize `value` as canonical JSON: UTF-8, object keys sorted
/// lexicographically at every depth, no insignificant whitespace.
///
/// `serde_json::Value`'s `Map` is backed by a `BTreeMap` when the
/// `preserve_order` feature is off (the default, and what this crate
/// relies on), so re-serializing through `BTreeMap` is enough to get a
/// deterministic key order; `serde_json::to_vec` already omits
/// insignificant whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoFailure> {
    let value = serde_json::to_value(value).map_err(CryptoFailure::Deserialization)?;
    let sorted = sort_object_keys(value);
    serde_json::to_vec(&sorted).map_err(CryptoFailure::Deserialization)
}

fn sort_object_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_object_keys(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_object_keys).collect()),
        other => other,
    }
}
