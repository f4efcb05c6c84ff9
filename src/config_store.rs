// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Loading and saving the declarative desired state.
//!
//! Prefers the split-file layout (`vsinks.json`, `routing-rules.json`,
//! `input-routes.json`) when present, falls back to the legacy combined
//! `config.json`, and otherwise returns defaults. Saves always rewrite
//! both layouts so they stay coherent.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{Config, InputRoute, MicRule, StreamRule};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no config directory available")]
    NoConfigDir,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VSinksFile {
    #[serde(default)]
    buses: Vec<crate::model::Bus>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RoutingRulesFile {
    #[serde(default)]
    rules: Vec<StreamRule>,
    #[serde(default)]
    mic_routes: Vec<MicRule>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InputRoutesFile {
    #[serde(default)]
    input_routes: Vec<InputRoute>,
}

pub struct ConfigStore {
    config_dir: PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = directories::ProjectDirs::from("", "", "audiorouter")
            .map(|d| d.config_dir().to_path_buf())
            .ok_or(ConfigError::NoConfigDir)?;
        fs::create_dir_all(&config_dir)?;
        debug!("config directory: {:?}", config_dir);
        Ok(Self { config_dir })
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.config_dir.join(name)
    }

    /// Load the desired state, normalized to always carry all five keys.
    pub fn load(&self) -> Config {
        let vsinks_path = self.path("vsinks.json");
        let rules_path = self.path("routing-rules.json");
        let input_routes_path = self.path("input-routes.json");
        let combined_path = self.path("config.json");

        let has_split =
            vsinks_path.exists() || rules_path.exists() || input_routes_path.exists();

        if has_split {
            let vsinks: VSinksFile = read_json_or_default(&vsinks_path);
            let rules: RoutingRulesFile = read_json_or_default(&rules_path);
            let input_routes: InputRoutesFile = read_json_or_default(&input_routes_path);
            Config {
                buses: vsinks.buses,
                rules: rules.rules,
                mic_routes: rules.mic_routes,
                input_routes: input_routes.input_routes,
                companion: Default::default(),
            }
        } else if combined_path.exists() {
            read_json_or_default(&combined_path)
        } else {
            debug!("no configuration found on disk, using defaults");
            Config::default()
        }
    }

    /// Atomically write every split file and the combined file.
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let vsinks = VSinksFile {
            buses: config.buses.clone(),
        };
        let rules = RoutingRulesFile {
            rules: config.rules.clone(),
            mic_routes: config.mic_routes.clone(),
        };
        let input_routes = InputRoutesFile {
            input_routes: config.input_routes.clone(),
        };

        write_json_atomic(&self.path("vsinks.json"), &vsinks)?;
        write_json_atomic(&self.path("routing-rules.json"), &rules)?;
        write_json_atomic(&self.path("input-routes.json"), &input_routes)?;
        write_json_atomic(&self.path("config.json"), config)?;
        Ok(())
    }
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("failed to parse {:?}: {}, using defaults", path, e);
            T::default()
        }),
        Err(_) => T::default(),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
