// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single-stream routing for newly created sink-inputs and source-outputs,
//! run before a full reconciliation can reach them. Prevents an audible
//! transient on the wrong sink.

use crate::classifier::is_system_stream;
use crate::model::{Config, SYSTEM_BUS_NAME};
use crate::server_driver::ServerDriver;
use crate::trace::trace;

/// Route a single sink-input immediately. Returns `true` iff a move was
/// issued and succeeded. Errors are swallowed; an unrouted stream is left
/// for the next full reconciliation.
pub fn route_sink_input_now(id: u32, config: &Config, driver: &dyn ServerDriver) -> bool {
    let Some(stream) = driver.list_sink_inputs().into_iter().find(|s| s.id == id) else {
        return false;
    };

    for rule in &config.rules {
        if rule.match_.matches(&stream.props) && driver.sink_exists(&rule.target_bus) {
            return if driver.move_sink_input(id, &rule.target_bus).is_ok() {
                trace(&format!(
                    "route_sink_input_now moved sink_input={} target={} reason=rule",
                    id, rule.target_bus
                ));
                true
            } else {
                trace(&format!(
                    "route_sink_input_now_error sink_input={} target={} reason=rule",
                    id, rule.target_bus
                ));
                false
            };
        }
    }

    if is_system_stream(&stream.props) {
        if let Some(sink) = driver.list_sinks().into_iter().find(|s| s.name == SYSTEM_BUS_NAME) {
            if stream.attached_id == Some(sink.id) {
                return false;
            }
            // No mute window: a short system sound can finish playing
            // before a mute/unmute round-trip would complete.
            return if driver.move_sink_input(id, SYSTEM_BUS_NAME).is_ok() {
                trace(&format!(
                    "route_sink_input_now moved sink_input={} target={} reason=system",
                    id, SYSTEM_BUS_NAME
                ));
                true
            } else {
                trace(&format!(
                    "route_sink_input_now_error sink_input={} target={} reason=system",
                    id, SYSTEM_BUS_NAME
                ));
                false
            };
        }
    }

    false
}

/// Route a single source-output immediately, analogous to
/// [`route_sink_input_now`] but against MicRules and bus monitor sources.
pub fn route_source_output_now(id: u32, config: &Config, driver: &dyn ServerDriver) -> bool {
    let Some(stream) = driver.list_source_outputs().into_iter().find(|s| s.id == id) else {
        return false;
    };

    for rule in &config.mic_routes {
        if rule.match_.matches(&stream.props) {
            let target = format!("{}.monitor", rule.target_bus);
            return if driver.move_source_output(id, &target).is_ok() {
                trace(&format!(
                    "route_source_output_now moved source_output={} target={} reason=rule",
                    id, target
                ));
                true
            } else {
                trace(&format!(
                    "route_source_output_now_error source_output={} target={} reason=rule",
                    id, target
                ));
                false
            };
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MicRule, StreamMatch, StreamRule};
    use crate::server_driver::test_support::FakeDriver;

    #[test]
    fn unknown_stream_id_returns_false() {
        let driver = FakeDriver::new();
        let config = Config::default();
        assert!(!route_sink_input_now(999, &config, &driver));
    }

    #[test]
    fn rule_match_wins_over_system_bus_fallback() {
        let driver = FakeDriver::new()
            .with_default_sink("alsa_output.hw0")
            .with_sink("vsink.browser");
        let config = Config {
            rules: vec![StreamRule {
                match_: StreamMatch {
                    binary: Some("vivaldi".to_string()),
                    ..Default::default()
                },
                target_bus: "vsink.browser".to_string(),
            }],
            ..Default::default()
        };
        let id = driver.add_sink_input_on(
            "alsa_output.hw0",
            &[
                ("application.process.binary", "vivaldi-bin"),
                ("media.role", "event"),
            ],
        );

        assert!(route_sink_input_now(id, &config, &driver));
        assert_eq!(
            driver.sink_input_attached_sink(0),
            Some("vsink.browser".to_string())
        );
    }

    #[test]
    fn unmatched_system_sound_falls_back_to_system_bus() {
        let driver = FakeDriver::new()
            .with_default_sink("alsa_output.hw0")
            .with_sink("vsink.system");
        let config = Config::default();
        let id = driver.add_sink_input_on("alsa_output.hw0", &[("media.role", "notification")]);

        assert!(route_sink_input_now(id, &config, &driver));
        assert_eq!(
            driver.sink_input_attached_sink(0),
            Some("vsink.system".to_string())
        );
    }

    #[test]
    fn already_on_system_bus_is_not_re_moved() {
        let driver = FakeDriver::new().with_sink("vsink.system");
        let config = Config::default();
        let id = driver.add_sink_input_on("vsink.system", &[("media.role", "event")]);

        assert!(!route_sink_input_now(id, &config, &driver));
    }

    #[test]
    fn ordinary_stream_with_no_rule_and_no_system_marker_is_left_alone() {
        let driver = FakeDriver::new().with_default_sink("alsa_output.hw0");
        let config = Config::default();
        let id = driver.add_sink_input_on("alsa_output.hw0", &[("application.name", "Firefox")]);

        assert!(!route_sink_input_now(id, &config, &driver));
    }

    #[test]
    fn mic_rule_routes_source_output_to_bus_monitor() {
        let driver = FakeDriver::new().with_source("vsink.mic.monitor");
        let id = driver.add_source_output_on("mic-capture-raw", &[("application.name", "discord")]);
        let config = Config {
            mic_routes: vec![MicRule {
                match_: StreamMatch {
                    app: Some("discord".to_string()),
                    ..Default::default()
                },
                target_bus: "vsink.mic".to_string(),
            }],
            ..Default::default()
        };

        assert!(route_source_output_now(id, &config, &driver));
        assert_eq!(
            driver.source_output_attached_source(0),
            Some("vsink.mic.monitor".to_string())
        );
    }
}
