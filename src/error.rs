// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! Error types returned by this crate's public API.

use thiserror::Error;

/// A recovery key string failed to decode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecoveryKeyError {
    /// The string didn't decode to valid base-58.
    #[error("the recovery key isn't valid base-58: {0}")]
    Base58(String),
    /// The decoded byte string has the wrong length.
    #[error("the recovery key has an unexpected length: expected {expected}, got {got}")]
    Length {
        /// The expected decoded length in bytes.
        expected: usize,
        /// The length we actually got.
        got: usize,
    },
    /// The two-byte version prefix didn't match the one we expect.
    #[error("the recovery key has an unknown version prefix")]
    Version,
    /// The trailing checksum byte didn't match.
    #[error("the recovery key's checksum doesn't match")]
    Checksum,
}

/// The passphrase-based key derivation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KdfError {
    /// The caller asked for fewer rounds than
    /// [`crate::config::BackupEngineConfig::min_kdf_iterations`] allows.
    #[error("refusing to derive a key with only {given} PBKDF2 rounds, minimum is {minimum}")]
    IterationsTooLow {
        /// The number of rounds that were requested.
        given: u32,
        /// The configured minimum.
        minimum: u32,
    },
    /// The salt wasn't the expected 32 bytes.
    #[error("the KDF salt must be 32 bytes, got {0}")]
    InvalidSaltLength(usize),
}

/// Asymmetric encryption, decryption, or signature verification failed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CryptoFailure {
    /// Decryption of a backed-up session failed authentication.
    #[error("failed to decrypt the session data: {0}")]
    Decryption(#[from] vodozemac::pk_encryption::DecryptionError),
    /// The plaintext produced by a successful decryption wasn't valid JSON,
    /// or didn't match the [`crate::store::GroupSessionKey`] shape.
    #[error("the decrypted session data isn't a valid group session key: {0}")]
    Deserialization(#[from] serde_json::Error),
    /// A base64 field in an [`crate::primitives::EncryptedSessionData`]
    /// envelope didn't decode.
    #[error("the {0} field isn't valid base64")]
    Encoding(&'static str),
}

/// A request to the homeserver's backup endpoints failed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackupClientError {
    /// A transient network error; the caller should retry later.
    #[error("network error talking to the homeserver: {0}")]
    Network(String),
    /// The server rejected the upload because the active version has been
    /// superseded (`M_WRONG_ROOM_KEYS_VERSION`).
    #[error("the backup version used for this upload is no longer the active one")]
    WrongBackupVersion,
    /// The requested version doesn't exist.
    #[error("no such backup version")]
    NotFound,
    /// Any other protocol-level error the homeserver reported.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Restoring room keys from a backup failed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RestoreError {
    /// The supplied recovery key string didn't decode.
    #[error("invalid recovery key: {0}")]
    InvalidRecoveryKey(#[from] RecoveryKeyError),
    /// The recovery key decoded fine, but decryption failed for every record
    /// that was fetched from the server (wrong key or wrong password).
    #[error("the recovery key or password doesn't match this backup")]
    InvalidRecoveryKeyOrPassword,
    /// [`crate::restore::RestoreEngine::restore_with_password`] was called
    /// against a version whose `auth_data` carries no `private_key_salt` /
    /// `private_key_iterations`.
    #[error("this backup version wasn't created with a passphrase")]
    NoPasswordSupport,
    /// A primitive crypto operation, or parsing a version's `auth_data`,
    /// failed.
    #[error(transparent)]
    Crypto(#[from] CryptoFailure),
    /// Deriving a password-based key failed.
    #[error(transparent)]
    Kdf(#[from] KdfError),
    /// Talking to the homeserver failed.
    #[error(transparent)]
    Client(#[from] BackupClientError),
    /// Importing the decoded sessions into the local store failed.
    #[error("failed to import restored sessions: {0}")]
    Store(String),
}

/// Driving the backup state machine or upload loop failed in a way that
/// couldn't be absorbed as a transient retry.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// The server has superseded our active backup version.
    #[error("the active backup version was superseded")]
    WrongBackupVersion,
    /// A primitive crypto operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoFailure),
    /// Deriving a passphrase-based key failed.
    #[error(transparent)]
    Kdf(#[from] KdfError),
    /// Talking to the homeserver failed outright (used only for the
    /// one-shot `prepare`/`create` calls; the backup loop itself never
    /// surfaces transient network errors, see module docs on
    /// [`crate::engine`]).
    #[error(transparent)]
    Client(#[from] BackupClientError),
    /// The local store couldn't be read or written.
    #[error("local store error: {0}")]
    Store(String),
}
