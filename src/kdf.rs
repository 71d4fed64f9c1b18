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

//! Derive a 32-byte backup private key from a passphrase.
//!
//! The salt and iteration count used for a given derivation are persisted in
//! the backup version's `auth_data` (`private_key_salt`, `private_key_iterations`)
//! so that any future device can reconstruct the same private key from the
//! same passphrase.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::{config::BackupEngineConfig, error::KdfError};

/// A freshly generated 32-byte salt, suitable for [`derive_key`].
pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte private key from a UTF-8 passphrase using
/// PBKDF2-HMAC-SHA-512.
///
/// `iterations` is checked against [`BackupEngineConfig::min_kdf_iterations`]
/// unless [`BackupEngineConfig::allow_weak_kdf`] is set.
pub fn derive_key(
    passphrase: &str,
    salt: &[u8; 32],
    iterations: u32,
    config: &BackupEngineConfig,
) -> Result<Zeroizing<[u8; 32]>, KdfError> {
    if iterations < config.min_kdf_iterations && !config.allow_weak_kdf {
        return Err(KdfError::IterationsTooLow { given: iterations, minimum: config.min_kdf_iterations });
    }

    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, iterations, key.as_mut());

    Ok(key)
}
