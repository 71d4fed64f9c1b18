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

//! Encode and decode a backup's private key as a human-transcribable
//! recovery key string.
//!
//! The format is version-prefixed, checksummed, base-58 encoded, and
//! grouped into 4-character blocks separated by spaces, e.g.
//! `EsTc LW2K PGiF wKEA 3As5 g5c4 BXwk qeeJ ZJV8 Q9fu gUMN UE4d`.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::RecoveryKeyError;

/// The two-byte version prefix prepended to every encoded recovery key.
///
/// This is the prefix the Matrix spec registers for this exact encoding;
/// it exists so that other, differently-shaped secret strings (e.g. a
/// cross-signing key export) can never be silently accepted as a backup
/// recovery key.
const VERSION_PREFIX: [u8; 2] = [0x8B, 0x01];

const KEY_LENGTH: usize = 32;

/// A 32-byte backup private key, encoded for human transcription.
///
/// Holds the raw key bytes zeroized on drop; [`RecoveryKey::to_string`]
/// produces the grouped, checksummed string and [`RecoveryKey::parse`]
/// reverses it.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; KEY_LENGTH]);

impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RecoveryKey").field(&"*****").finish()
    }
}

impl RecoveryKey {
    /// Wrap a raw 32-byte private key.
    pub fn new(key: [u8; KEY_LENGTH]) -> Self {
        Self(key)
    }

    /// The raw private key bytes.
    pub fn to_bytes(&self) -> [u8; KEY_LENGTH] {
        self.0
    }

    /// Decode a recovery key string produced by [`RecoveryKey::to_string`].
    ///
    /// Whitespace is stripped before decoding; the comparison is otherwise
    /// case-sensitive, as base-58 strings are.
    pub fn parse(input: &str) -> Result<Self, RecoveryKeyError> {
        let stripped: String = input.chars().filter(|c| !c.is_whitespace()).collect();

        let decoded = bs58::decode(&stripped)
            .into_vec()
            .map_err(|e| RecoveryKeyError::Base58(e.to_string()))?;

        let expected_len = VERSION_PREFIX.len() + KEY_LENGTH + 1;
        if decoded.len() != expected_len {
            return Err(RecoveryKeyError::Length { expected: expected_len, got: decoded.len() });
        }

        let (body, checksum_byte) = decoded.split_at(decoded.len() - 1);
        if checksum_byte[0] != checksum(body) {
            return Err(RecoveryKeyError::Checksum);
        }

        if body[..VERSION_PREFIX.len()] != VERSION_PREFIX {
            return Err(RecoveryKeyError::Version);
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&body[VERSION_PREFIX.len()..]);

        Ok(Self(key))
    }
}

impl std::fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buffer = Vec::with_capacity(VERSION_PREFIX.len() + KEY_LENGTH + 1);
        buffer.extend_from_slice(&VERSION_PREFIX);
        buffer.extend_from_slice(&self.0);
        buffer.push(checksum(&buffer));

        let encoded = bs58::encode(&buffer).into_string();
        f.write_str(&group(&encoded))
    }
}

/// A single-byte XOR checksum over every preceding byte (version prefix +
/// key bytes).
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Group a base-58 string into 4-character blocks separated by single
/// spaces. The final group may be shorter than 4 characters.
fn group(encoded: &str) -> String {
    encoded
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).expect("base58 alphabet is ASCII"))
        .collect::<Vec<_>>()
        .join(" ")
}
