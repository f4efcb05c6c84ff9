// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Desired-state data model: buses, stream rules, input routes, and the
//! runtime ownership ledger.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolution target for a [`Bus`]'s route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Track the server's current physical default sink.
    Default,
    /// No route; the bus is silent.
    None,
    /// A concrete sink name.
    Sink(String),
}

impl RouteTarget {
    pub fn as_str(&self) -> &str {
        match self {
            RouteTarget::Default => "default",
            RouteTarget::None => "none",
            RouteTarget::Sink(name) => name,
        }
    }
}

impl Serialize for RouteTarget {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RouteTarget {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(match raw.as_str() {
            "default" => RouteTarget::Default,
            "none" => RouteTarget::None,
            _ => RouteTarget::Sink(raw),
        })
    }
}

impl Default for RouteTarget {
    fn default() -> Self {
        RouteTarget::Default
    }
}

/// A virtual bus: a null sink plus the loopback routing its monitor onward.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bus {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub route_to: RouteTarget,
}

impl Bus {
    pub fn monitor_name(&self) -> String {
        format!("{}.monitor", self.name)
    }
}

/// The well-known bus used as a default destination for notifications.
pub const SYSTEM_BUS_NAME: &str = "vsink.system";

/// Property substrings a [`StreamRule`]/[`MicRule`] matches against.
///
/// Every present field is matched as a lowercase substring of the
/// corresponding stream property; an absent field imposes no constraint.
/// A rule whose every field is `None` never matches anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl StreamMatch {
    pub fn is_empty(&self) -> bool {
        self.binary.is_none() && self.app.is_none() && self.app_id.is_none()
    }

    /// True iff every present key's substring is contained in the
    /// corresponding lowercased stream property. Always false for an
    /// empty match.
    pub fn matches(&self, props: &HashMap<String, String>) -> bool {
        if self.is_empty() {
            return false;
        }
        let check = |needle: &Option<String>, key: &str| -> bool {
            match needle {
                None => true,
                Some(n) => props
                    .get(key)
                    .map(|v| v.to_lowercase().contains(&n.to_lowercase()))
                    .unwrap_or(false),
            }
        };
        check(&self.binary, "application.process.binary")
            && check(&self.app, "application.name")
            && check(&self.app_id, "pipewire.access.portal.app_id")
    }
}

/// An ordered stream-placement rule for playback streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamRule {
    #[serde(rename = "match", default)]
    pub match_: StreamMatch,
    pub target_bus: String,
}

/// Same shape as [`StreamRule`] but applies to capture streams; its
/// `target_bus` resolves to that bus's monitor source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicRule {
    #[serde(rename = "match", default)]
    pub match_: StreamMatch,
    pub target_bus: String,
}

/// A persistent loopback from a physical capture source into a bus sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputRoute {
    pub source: String,
    pub target_bus: String,
}

/// Configuration for the (out of scope) Companion HTTP push. Pure data;
/// never consulted by the Reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompanionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_volume_suffix")]
    pub volume_suffix: String,
    #[serde(default = "default_mute_suffix")]
    pub mute_suffix: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: f64,
}

fn default_volume_suffix() -> String {
    "Vol".to_string()
}

fn default_mute_suffix() -> String {
    "Mute".to_string()
}

fn default_timeout_sec() -> f64 {
    2.0
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            volume_suffix: default_volume_suffix(),
            mute_suffix: default_mute_suffix(),
            timeout_sec: default_timeout_sec(),
        }
    }
}

/// The full declarative desired state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub buses: Vec<Bus>,
    #[serde(default)]
    pub rules: Vec<StreamRule>,
    #[serde(default)]
    pub mic_routes: Vec<MicRule>,
    #[serde(default)]
    pub input_routes: Vec<InputRoute>,
    #[serde(default)]
    pub companion: CompanionConfig,
}

/// Persistent ownership ledger: which server modules this process created,
/// and for what. Survives process restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeState {
    #[serde(default)]
    pub bus_modules: HashMap<String, u32>,
    #[serde(default)]
    pub route_modules: HashMap<String, u32>,
    #[serde(default)]
    pub route_target: HashMap<String, String>,
    #[serde(default)]
    pub input_route_modules: HashMap<String, u32>,
    #[serde(default)]
    pub input_route_target: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_match_never_matches() {
        let m = StreamMatch::default();
        let mut props = HashMap::new();
        props.insert("application.name".to_string(), "anything".to_string());
        assert!(!m.matches(&props));
    }

    #[test]
    fn match_is_case_insensitive_substring() {
        let m = StreamMatch {
            binary: Some("vivaldi".to_string()),
            ..Default::default()
        };
        let mut props = HashMap::new();
        props.insert(
            "application.process.binary".to_string(),
            "/usr/bin/Vivaldi-bin".to_string(),
        );
        assert!(m.matches(&props));
    }

    #[test]
    fn route_target_round_trips_sentinels() {
        assert_eq!(
            serde_json::from_str::<RouteTarget>("\"default\"").unwrap(),
            RouteTarget::Default
        );
        assert_eq!(
            serde_json::from_str::<RouteTarget>("\"none\"").unwrap(),
            RouteTarget::None
        );
        assert_eq!(
            serde_json::from_str::<RouteTarget>("\"alsa_output.hw0\"").unwrap(),
            RouteTarget::Sink("alsa_output.hw0".to_string())
        );
    }
}
