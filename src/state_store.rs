// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Persistent ownership ledger, surviving process restarts so the
//! Reconciler can identify modules it created previously.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config_store::ConfigError;
use crate::model::RuntimeState;

pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new() -> Result<Self, ConfigError> {
        let state_dir = directories::ProjectDirs::from("", "", "audiorouter")
            .map(|d| d.state_dir().unwrap_or_else(|| d.data_dir()).to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        fs::create_dir_all(&state_dir)?;
        debug!("state directory: {:?}", state_dir);
        Ok(Self { state_dir })
    }

    pub fn with_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn path(&self) -> PathBuf {
        self.state_dir.join("state.json")
    }

    /// Load the ownership ledger, defaulting to empty maps if absent or
    /// unreadable.
    pub fn load(&self) -> RuntimeState {
        match fs::read_to_string(self.path()) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("failed to parse runtime state: {}, starting empty", e);
                RuntimeState::default()
            }),
            Err(_) => RuntimeState::default(),
        }
    }

    /// Whole-file replace.
    pub fn save(&self, state: &RuntimeState) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(state)?;
        let path = self.path();
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_state_file_yields_empty_maps() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_dir(dir.path());
        let state = store.load();
        assert!(state.bus_modules.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_dir(dir.path());
        let mut state = RuntimeState::default();
        state.bus_modules.insert("vsink.browser".to_string(), 42);
        store.save(&state).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.bus_modules.get("vsink.browser"), Some(&42));
    }
}
