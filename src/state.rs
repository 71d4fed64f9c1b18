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

//! The backup lifecycle state machine and its listener registry.
//!
//! This module only owns the state cell and the synchronous, in-order
//! listener fan-out; transitions themselves are driven by
//! [`crate::engine::BackupEngine`].

use std::sync::Mutex;

use tokio::sync::RwLock;
use tracing::debug;

/// The backup lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// No check has been made yet.
    Unknown,
    /// `checkAndStartKeysBackup` is querying the homeserver.
    CheckingBackUpOnHomeserver,
    /// No usable backup exists; backup is off.
    Disabled,
    /// A backup version exists but isn't signed by a verified device.
    NotTrusted,
    /// `createKeysBackupVersion` is in flight.
    Enabling,
    /// Enabled, idle, nothing scheduled.
    ReadyToBackUp,
    /// Enabled, a chunk upload has been scheduled after the jitter delay.
    WillBackUp,
    /// Enabled, a chunk upload is in flight.
    BackingUp,
    /// The server reported that our active version was superseded.
    WrongBackUpVersion,
}

impl BackupState {
    /// `true` for the three states in which the backup is actively armed.
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::ReadyToBackUp | Self::WillBackUp | Self::BackingUp)
    }
}

type Listener = Box<dyn Fn(BackupState) + Send + Sync>;

/// Owns the current [`BackupState`] and fans out transitions to registered
/// listeners, synchronously and in the order the transitions occurred.
///
/// Listeners are snapshotted before each notification so that a listener
/// may remove itself (by not re-registering) without deadlocking or
/// skipping a sibling.
pub struct StateMachine {
    state: RwLock<BackupState>,
    listeners: Mutex<Vec<Listener>>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine").field("listeners", &"..").finish()
    }
}

impl StateMachine {
    /// A fresh state machine starting in [`BackupState::Unknown`].
    pub fn new() -> Self {
        Self { state: RwLock::new(BackupState::Unknown), listeners: Mutex::new(Vec::new()) }
    }

    /// The current state.
    pub async fn get(&self) -> BackupState {
        *self.state.read().await
    }

    /// Transition to `new_state`, then notify every listener in
    /// registration order.
    pub async fn transition(&self, new_state: BackupState) {
        let previous = {
            let mut state = self.state.write().await;
            let previous = *state;
            *state = new_state;
            previous
        };

        debug!(?previous, ?new_state, "backup state transition");

        self.notify(new_state);
    }

    fn notify(&self, state: BackupState) {
        let listeners = self.listeners.lock().expect("listener lock poisoned");
        // Snapshot the current listener list before iterating: a listener
        // may want to remove itself from inside its own callback via
        // `set_listeners`, which would otherwise deadlock on this mutex.
        let snapshot: Vec<&Listener> = listeners.iter().collect();
        for listener in snapshot {
            listener(state);
        }
    }

    /// Register a new listener, appended after any already registered.
    pub fn add_listener(&self, listener: Listener) {
        self.listeners.lock().expect("listener lock poisoned").push(listener);
    }

    /// Replace the entire listener set. Used by
    /// [`crate::engine::BackupEngine::backup_all_group_sessions`], which
    /// keeps at most one aggregate listener active at a time.
    pub fn clear_listeners(&self) {
        self.listeners.lock().expect("listener lock poisoned").clear();
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
