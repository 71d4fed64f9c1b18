// Copyright 2024 The Matrix.org Foundation C.I.C.
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

//! Tunables for the backup engine.

use std::time::Duration;

/// The Matrix algorithm identifier this crate implements.
///
/// [spec]: https://spec.matrix.org/unstable/client-server-api/#backup-algorithm-mmegolm_backupv1curve25519-aes-sha2
pub const BACKUP_ALGORITHM: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// Maximum number of sessions uploaded in a single backup chunk.
pub const KEY_BACKUP_SEND_KEYS_MAX_COUNT: usize = 100;

/// Upper bound, in milliseconds, of the jitter applied before a debounced
/// [`crate::engine::BackupEngine::maybe_backup_keys`] trigger starts a
/// backup chunk.
pub const KEY_BACKUP_WAITING_TIME_TO_SEND_KEY_BACKUP_MILLIS: u64 = 10_000;

/// Recommended number of PBKDF2 rounds for passphrase-derived backup keys.
pub const DEFAULT_KDF_ITERATIONS: u32 = 500_000;

/// The lowest iteration count [`crate::kdf::derive_key`] will accept unless
/// the caller opts out via [`BackupEngineConfig::allow_weak_kdf`].
pub const MINIMUM_KDF_ITERATIONS: u32 = 100_000;

/// Tunable knobs for a [`crate::engine::BackupEngine`] / [`crate::restore::RestoreEngine`]
/// pair.
///
/// `Default` reproduces the constants mandated by the backup algorithm's
/// external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupEngineConfig {
    /// Maximum number of sessions taken from the store per upload chunk.
    pub max_sessions_per_chunk: usize,
    /// Upper bound of the uniform jitter applied before `backup_keys` runs
    /// after a `maybe_backup_keys` trigger.
    pub backup_wait: Duration,
    /// The floor enforced on passphrase KDF iteration counts.
    pub min_kdf_iterations: u32,
    /// The iteration count used when the caller doesn't specify one.
    pub default_kdf_iterations: u32,
    /// If `true`, [`crate::kdf::derive_key`] will accept iteration counts
    /// below `min_kdf_iterations`. Only meant for tests; never flip this on
    /// in a client built against a real homeserver.
    pub allow_weak_kdf: bool,
}

impl Default for BackupEngineConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_chunk: KEY_BACKUP_SEND_KEYS_MAX_COUNT,
            backup_wait: Duration::from_millis(KEY_BACKUP_WAITING_TIME_TO_SEND_KEY_BACKUP_MILLIS),
            min_kdf_iterations: MINIMUM_KDF_ITERATIONS,
            default_kdf_iterations: DEFAULT_KDF_ITERATIONS,
            allow_weak_kdf: false,
        }
    }
}

#[cfg(test)]
impl BackupEngineConfig {
    /// A config suitable for tests: tiny KDF iteration counts and no backup
    /// jitter, so test suites don't spend real wall-clock time on either.
    pub(crate) fn fast_for_tests() -> Self {
        Self {
            max_sessions_per_chunk: KEY_BACKUP_SEND_KEYS_MAX_COUNT,
            backup_wait: Duration::from_millis(0),
            min_kdf_iterations: 1,
            default_kdf_iterations: 1,
            allow_weak_kdf: true,
        }
    }
}
