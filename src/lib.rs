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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod config;
pub mod engine;
mod error;
pub mod kdf;
pub mod primitives;
pub mod recovery_key;
pub mod restore;
pub mod state;
pub mod store;
pub mod trust;

pub use client::{BackupVersion, HomeserverClient};
pub use config::BackupEngineConfig;
pub use engine::{BackupCreationInfo, BackupEngine, Identity};
pub use error::{BackupClientError, CryptoFailure, EngineError, KdfError, RecoveryKeyError, RestoreError};
pub use recovery_key::RecoveryKey;
pub use restore::{RestoreEngine, RestoreSummary};
pub use state::{BackupState, StateMachine};
pub use store::{GroupSession, LocalStore, RoomKeyCounts};
pub use trust::{BackupVersionTrust, VerifiedDevice};
