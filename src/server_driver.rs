// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The sole gateway to the sound server: issues control commands and
//! parses its tabular/verbose text responses into structured
//! observations. Hides whether commands cross a sandbox boundary.

use std::collections::HashMap;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Bounded per-command timeout so a frozen server cannot stall the event
/// loop indefinitely. The source sends commands without one; this is
/// policy, not a tuning knob left to the caller.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
#[error("server command failed: {argv:?}: {stderr}")]
pub struct ServerCommandError {
    pub argv: Vec<String>,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing expected field {0}")]
    MissingField(&'static str),
    #[error("malformed listing: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkInfo {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: u32,
    pub name: String,
    pub args: String,
}

/// A sink-input or source-output. `attached_id` is the sink id (for a
/// sink-input) or source id (for a source-output).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: u32,
    pub attached_id: Option<u32>,
    pub owner_module: Option<u32>,
    pub props: HashMap<String, String>,
}

/// Gateway to the sound server's control tool. Listing operations degrade
/// to empty results on failure (the "try_" contract in the source spec);
/// mutating operations return a typed error the caller decides whether to
/// swallow.
pub trait ServerDriver: Send + Sync {
    fn list_sinks(&self) -> Vec<SinkInfo>;
    fn list_sink_descriptions(&self) -> HashMap<String, String>;
    fn list_sources(&self) -> Vec<SourceInfo>;
    fn list_source_descriptions(&self) -> HashMap<String, String>;
    fn list_modules(&self) -> Vec<ModuleInfo>;
    fn list_sink_inputs(&self) -> Vec<StreamInfo>;
    fn list_source_outputs(&self) -> Vec<StreamInfo>;
    fn get_default_sink(&self) -> Option<String>;

    fn load_null_sink(&self, name: &str, label: &str) -> Result<u32, ServerCommandError>;
    fn load_loopback(
        &self,
        source: &str,
        sink: &str,
        latency_ms: u32,
    ) -> Result<u32, ServerCommandError>;
    fn unload_module(&self, id: u32) -> Result<(), ServerCommandError>;
    fn move_sink_input(&self, id: u32, sink_name: &str) -> Result<(), ServerCommandError>;
    fn move_source_output(&self, id: u32, source_name: &str) -> Result<(), ServerCommandError>;
    fn set_sink_mute(&self, name: &str, mute: bool) -> Result<(), ServerCommandError>;
    fn set_source_mute(&self, name: &str, mute: bool) -> Result<(), ServerCommandError>;
    fn set_sink_input_mute(&self, id: u32, mute: bool) -> Result<(), ServerCommandError>;
    fn set_sink_volume(&self, name: &str, spec: &str) -> Result<(), ServerCommandError>;
    fn get_sink_mute(&self, name: &str) -> Option<bool>;
    fn set_sink_properties(&self, name: &str, props: &[(&str, &str)])
        -> Result<(), ServerCommandError>;
    fn set_source_properties(
        &self,
        name: &str,
        props: &[(&str, &str)],
    ) -> Result<(), ServerCommandError>;

    /// True iff the server is reachable at all. Used by startup's
    /// server-wait and nowhere else.
    fn try_info(&self) -> bool;

    fn sink_exists(&self, name: &str) -> bool {
        self.list_sinks().iter().any(|s| s.name == name)
    }

    fn source_exists(&self, name: &str) -> bool {
        self.list_sources().iter().any(|s| s.name == name)
    }

    fn ensure_module_loaded(&self, name: &str, args: &str) -> Result<(), ServerCommandError> {
        if self.list_modules().iter().any(|m| m.name == name) {
            return Ok(());
        }
        load_module_raw(name, args).map(|_| ())
    }

    fn loopback_exists(&self, source: &str, sink: &str) -> bool {
        self.list_modules().iter().any(|m| {
            m.name == "module-loopback"
                && m.args.contains(&format!("source={}", source))
                && m.args.contains(&format!("sink={}", sink))
        })
    }

    fn cleanup_wrong_loopbacks_for_source(&self, source: &str, wanted_sink: &str) {
        let wanted = format!("sink={}", wanted_sink);
        let src = format!("source={}", source);
        for m in self.list_modules() {
            if m.name == "module-loopback" && m.args.contains(&src) && !m.args.contains(&wanted) {
                if let Err(e) = self.unload_module(m.id) {
                    debug!("cleanup unload of module {} failed (ignored): {}", m.id, e);
                }
            }
        }
    }

    fn sink_inputs_for_owner_module(&self, module_id: u32) -> Vec<u32> {
        self.list_sink_inputs()
            .into_iter()
            .filter(|s| s.owner_module == Some(module_id))
            .map(|s| s.id)
            .collect()
    }
}

/// `true` iff running inside a Flatpak sandbox: detected by the
/// `FLATPAK_ID` environment variable or the well-known
/// `/.flatpak-info` marker file, exactly as `pactl.py::_in_flatpak` and
/// `system_policy.py::_in_flatpak` in the original implementation.
pub fn in_flatpak() -> bool {
    std::env::var_os("FLATPAK_ID").is_some() || std::path::Path::new("/.flatpak-info").exists()
}

/// Build a `Command` for `program` with `args`, transparently prefixing
/// the `flatpak-spawn --host` wrapper when running inside a sandbox.
/// Shared by the blocking one-shot commands in this module and by the
/// daemon's long-lived `pactl subscribe` child process.
pub fn sandboxed_command(program: &str, args: &[&str]) -> Command {
    if in_flatpak() {
        let mut cmd = Command::new("flatpak-spawn");
        cmd.arg("--host").arg(program).args(args);
        cmd
    } else {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }
}

/// Spawn a control-tool invocation, transparently prefixing the
/// host-execution wrapper when running inside a sandbox, with a bounded
/// timeout so a frozen server cannot stall the caller.
fn run(args: &[&str]) -> Result<(i32, String, String), std::io::Error> {
    let cmd = sandboxed_command("pactl", args);
    run_with_timeout(cmd, DEFAULT_COMMAND_TIMEOUT)
}

fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<(i32, String, String), std::io::Error> {
    use std::sync::mpsc;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = cmd.output();
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(output)) => Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        )),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "server command timed out",
        )),
    }
}

fn pactl(args: &[&str]) -> Result<String, ServerCommandError> {
    let argv: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    match run(args) {
        Ok((0, stdout, _)) => Ok(stdout),
        Ok((_, _, stderr)) => Err(ServerCommandError { argv, stderr }),
        Err(e) => Err(ServerCommandError {
            argv,
            stderr: e.to_string(),
        }),
    }
}

fn try_pactl(args: &[&str]) -> String {
    pactl(args).unwrap_or_default()
}

fn load_module_raw(name: &str, args: &str) -> Result<u32, ServerCommandError> {
    let arg_string = format!("{} {}", name, args);
    let out = pactl(&["load-module", name, args])?;
    let trimmed = out.trim();
    trimmed.parse::<u32>().map_err(|_| ServerCommandError {
        argv: vec!["load-module".to_string(), arg_string],
        stderr: format!("could not parse module id from {:?}", trimmed),
    })
}

/// Production [`ServerDriver`] backed by `pactl`.
pub struct PactlDriver;

impl PactlDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PactlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerDriver for PactlDriver {
    fn list_sinks(&self) -> Vec<SinkInfo> {
        parse_short_listing(&try_pactl(&["list", "short", "sinks"]))
            .into_iter()
            .map(|(id, name)| SinkInfo { id, name })
            .collect()
    }

    fn list_sink_descriptions(&self) -> HashMap<String, String> {
        parse_descriptions(&try_pactl(&["list", "sinks"]))
    }

    fn list_sources(&self) -> Vec<SourceInfo> {
        parse_short_listing(&try_pactl(&["list", "short", "sources"]))
            .into_iter()
            .map(|(id, name)| SourceInfo { id, name })
            .collect()
    }

    fn list_source_descriptions(&self) -> HashMap<String, String> {
        parse_descriptions(&try_pactl(&["list", "sources"]))
    }

    fn list_modules(&self) -> Vec<ModuleInfo> {
        try_pactl(&["list", "short", "modules"])
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '\t');
                let id = parts.next()?.trim().parse().ok()?;
                let name = parts.next()?.trim().to_string();
                let args = parts.next().unwrap_or("").trim().to_string();
                Some(ModuleInfo { id, name, args })
            })
            .collect()
    }

    fn list_sink_inputs(&self) -> Vec<StreamInfo> {
        parse_verbose_streams(&try_pactl(&["list", "sink-inputs"]), "sink")
    }

    fn list_source_outputs(&self) -> Vec<StreamInfo> {
        parse_verbose_streams(&try_pactl(&["list", "source-outputs"]), "source")
    }

    fn get_default_sink(&self) -> Option<String> {
        let out = try_pactl(&["get-default-sink"]);
        let trimmed = out.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    fn load_null_sink(&self, name: &str, label: &str) -> Result<u32, ServerCommandError> {
        let args = format!(
            "sink_name={} sink_properties=device.description=\"{}\"",
            name, label
        );
        let id = load_module_raw("module-null-sink", &args)?;

        let _ = self.set_sink_properties(name, &[("media.class", "Audio/Sink")]);
        let monitor = format!("{}.monitor", name);
        let _ = self.set_source_properties(&monitor, &[("node.hidden", "true"), ("node.passive", "true")]);

        if name == crate::model::SYSTEM_BUS_NAME {
            self.tag_system_sink(name);
        }
        Ok(id)
    }

    fn load_loopback(
        &self,
        source: &str,
        sink: &str,
        latency_ms: u32,
    ) -> Result<u32, ServerCommandError> {
        let args = format!(
            "source={} sink={} latency_msec={} sink_dont_move=true",
            source, sink, latency_ms
        );
        let id = load_module_raw("module-loopback", &args)?;

        let loop_name = format!("loopback-{}", id);
        let _ = self.set_sink_properties(
            &loop_name,
            &[("node.hidden", "true"), ("node.passive", "true")],
        );
        let _ = self.set_source_properties(
            &loop_name,
            &[("node.hidden", "true"), ("node.passive", "true")],
        );

        Ok(id)
    }

    fn unload_module(&self, id: u32) -> Result<(), ServerCommandError> {
        match pactl(&["unload-module", &id.to_string()]) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Unloads of already-gone module ids are tolerated by every
                // caller in this crate; surface the error so callers that
                // care (ghost cleanup logs) still see it.
                Err(e)
            }
        }
    }

    fn move_sink_input(&self, id: u32, sink_name: &str) -> Result<(), ServerCommandError> {
        pactl(&["move-sink-input", &id.to_string(), sink_name]).map(|_| ())
    }

    fn move_source_output(&self, id: u32, source_name: &str) -> Result<(), ServerCommandError> {
        pactl(&["move-source-output", &id.to_string(), source_name]).map(|_| ())
    }

    fn set_sink_mute(&self, name: &str, mute: bool) -> Result<(), ServerCommandError> {
        pactl(&["set-sink-mute", name, if mute { "1" } else { "0" }]).map(|_| ())
    }

    fn set_source_mute(&self, name: &str, mute: bool) -> Result<(), ServerCommandError> {
        pactl(&["set-source-mute", name, if mute { "1" } else { "0" }]).map(|_| ())
    }

    fn set_sink_input_mute(&self, id: u32, mute: bool) -> Result<(), ServerCommandError> {
        pactl(&[
            "set-sink-input-mute",
            &id.to_string(),
            if mute { "1" } else { "0" },
        ])
        .map(|_| ())
    }

    fn set_sink_volume(&self, name: &str, spec: &str) -> Result<(), ServerCommandError> {
        pactl(&["set-sink-volume", name, spec]).map(|_| ())
    }

    fn get_sink_mute(&self, name: &str) -> Option<bool> {
        let out = try_pactl(&["list", "sinks"]);
        let mut in_block = false;
        for line in out.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("Name:") && trimmed[5..].trim() == name {
                in_block = true;
                continue;
            }
            if trimmed.starts_with("Name:") && in_block {
                break;
            }
            if in_block {
                if let Some(rest) = trimmed.strip_prefix("Mute:") {
                    return Some(rest.trim().eq_ignore_ascii_case("yes"));
                }
            }
        }
        None
    }

    fn try_info(&self) -> bool {
        !try_pactl(&["info"]).trim().is_empty()
    }

    fn set_sink_properties(
        &self,
        name: &str,
        props: &[(&str, &str)],
    ) -> Result<(), ServerCommandError> {
        let joined: Vec<String> = props.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args = vec!["set-sink-properties".to_string(), name.to_string()];
        args.extend(joined);
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        pactl(&refs).map(|_| ())
    }

    fn set_source_properties(
        &self,
        name: &str,
        props: &[(&str, &str)],
    ) -> Result<(), ServerCommandError> {
        let joined: Vec<String> = props.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let mut args = vec!["set-source-properties".to_string(), name.to_string()];
        args.extend(joined);
        let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        pactl(&refs).map(|_| ())
    }
}

impl PactlDriver {
    /// Tag the system bus's sink so intended-roles placement (phase e of
    /// reconciliation) can route notification/event streams here directly.
    fn tag_system_sink(&self, name: &str) {
        if let Err(e) =
            self.set_sink_properties(name, &[("device.intended_roles", "event notification")])
        {
            warn!("failed to tag system sink {}: {}", name, e);
        }
    }
}

/// `id\tname\t...` short listings.
fn parse_short_listing(raw: &str) -> Vec<(u32, String)> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let id = parts.next()?.trim().parse().ok()?;
            let name = parts.next()?.trim().to_string();
            Some((id, name))
        })
        .collect()
}

/// `Name:`/`Description:` (or German `Beschreibung:`) pairs from a verbose
/// `list sinks`/`list sources` dump.
fn parse_descriptions(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut current_name: Option<String> = None;
    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Name:") {
            current_name = Some(rest.trim().to_string());
        } else if let Some(rest) = header_value(trimmed, &["Description:", "Beschreibung:"]) {
            if let Some(name) = current_name.take() {
                out.insert(name, rest.to_string());
            }
        }
    }
    out
}

fn header_value<'a>(line: &'a str, synonyms: &[&str]) -> Option<&'a str> {
    for prefix in synonyms {
        if let Some(rest) = line.strip_prefix(prefix) {
            return Some(rest.trim());
        }
    }
    None
}

const OWNER_MODULE_ABSENT: &[&str] = &["n/a", "k. A."];

/// Dual-locale parser for `pactl list sink-inputs`/`source-outputs`.
/// `attached_field` is `"sink"` or `"source"`.
fn parse_verbose_streams(raw: &str, attached_field: &str) -> Vec<StreamInfo> {
    let header_synonyms: &[&str] = if attached_field == "sink" {
        &["Sink Input #", "Ziel-Eingabe #"]
    } else {
        &["Source Output #", "Quell-Ausgabe #"]
    };
    let attached_synonyms: &[&str] = if attached_field == "sink" {
        &["Sink:", "Ziel:"]
    } else {
        &["Source:", "Quelle:"]
    };

    let mut streams = Vec::new();
    let mut current: Option<StreamInfo> = None;
    let mut in_properties = false;

    for line in raw.lines() {
        let trimmed = line.trim();

        if let Some(rest) = header_synonyms.iter().find_map(|h| trimmed.strip_prefix(h)) {
            if let Some(s) = current.take() {
                streams.push(s);
            }
            in_properties = false;
            let id = rest.trim().parse().ok();
            current = id.map(|id| StreamInfo {
                id,
                attached_id: None,
                owner_module: None,
                props: HashMap::new(),
            });
            continue;
        }

        let Some(stream) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = header_value(trimmed, attached_synonyms) {
            // "<id> <name>" e.g. "3 vsink.browser"
            stream.attached_id = rest.split_whitespace().next().and_then(|t| t.parse().ok());
            continue;
        }

        if let Some(rest) = header_value(trimmed, &["Owner Module:", "Besitzer-Modul:"]) {
            let rest = rest.trim();
            if !OWNER_MODULE_ABSENT.contains(&rest) {
                stream.owner_module = rest.parse().ok();
            }
            continue;
        }

        if header_value(trimmed, &["Properties:", "Eigenschaften:"]).is_some() {
            in_properties = true;
            continue;
        }

        if in_properties {
            if let Some((key, value)) = trimmed.split_once('=') {
                let value = value.trim().trim_matches('"');
                stream.props.insert(key.trim().to_string(), value.to_string());
            } else if !trimmed.is_empty() && trimmed.contains(' ') {
                // Some locales/properties render as `key "value"` without `=`.
                if let Some((key, value)) = trimmed.split_once(' ') {
                    stream
                        .props
                        .insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
                }
            } else if trimmed.is_empty() {
                in_properties = false;
            }
        }
    }

    if let Some(s) = current.take() {
        streams.push(s);
    }
    trace!("parsed {} streams from verbose listing", streams.len());
    streams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_listing() {
        let raw = "1\talsa_output.hw0\tmodule-alsa-card.c\ts16le 2ch 44100Hz\tRUNNING\n\
                   2\tvsink.browser\tmodule-null-sink.c\ts16le 2ch 44100Hz\tIDLE\n";
        let parsed = parse_short_listing(raw);
        assert_eq!(
            parsed,
            vec![
                (1, "alsa_output.hw0".to_string()),
                (2, "vsink.browser".to_string())
            ]
        );
    }

    #[test]
    fn parses_english_sink_input_block() {
        let raw = "Sink Input #42\n\tSink: 2\n\tOwner Module: 7\n\tProperties:\n\t\tapplication.name = \"Vivaldi\"\n\t\tapplication.process.binary = \"vivaldi-bin\"\n\n";
        let streams = parse_verbose_streams(raw, "sink");
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].id, 42);
        assert_eq!(streams[0].attached_id, Some(2));
        assert_eq!(streams[0].owner_module, Some(7));
        assert_eq!(streams[0].props.get("application.name").unwrap(), "Vivaldi");
    }

    #[test]
    fn parses_german_sink_input_block_with_absent_owner() {
        let raw = "Ziel-Eingabe #5\n\tZiel: 3\n\tBesitzer-Modul: n/a\n\tEigenschaften:\n\t\tmedia.role = \"event\"\n\n";
        let streams = parse_verbose_streams(raw, "sink");
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].id, 5);
        assert_eq!(streams[0].attached_id, Some(3));
        assert_eq!(streams[0].owner_module, None);
        assert_eq!(streams[0].props.get("media.role").unwrap(), "event");
    }

    #[test]
    fn loopback_exists_matches_on_both_substrings() {
        struct FakeDriver(Vec<ModuleInfo>);
        impl ServerDriver for FakeDriver {
            fn list_sinks(&self) -> Vec<SinkInfo> {
                vec![]
            }
            fn list_sink_descriptions(&self) -> HashMap<String, String> {
                HashMap::new()
            }
            fn list_sources(&self) -> Vec<SourceInfo> {
                vec![]
            }
            fn list_source_descriptions(&self) -> HashMap<String, String> {
                HashMap::new()
            }
            fn list_modules(&self) -> Vec<ModuleInfo> {
                self.0.clone()
            }
            fn list_sink_inputs(&self) -> Vec<StreamInfo> {
                vec![]
            }
            fn list_source_outputs(&self) -> Vec<StreamInfo> {
                vec![]
            }
            fn get_default_sink(&self) -> Option<String> {
                None
            }
            fn load_null_sink(&self, _: &str, _: &str) -> Result<u32, ServerCommandError> {
                unimplemented!()
            }
            fn load_loopback(&self, _: &str, _: &str, _: u32) -> Result<u32, ServerCommandError> {
                unimplemented!()
            }
            fn unload_module(&self, _: u32) -> Result<(), ServerCommandError> {
                Ok(())
            }
            fn move_sink_input(&self, _: u32, _: &str) -> Result<(), ServerCommandError> {
                unimplemented!()
            }
            fn move_source_output(&self, _: u32, _: &str) -> Result<(), ServerCommandError> {
                unimplemented!()
            }
            fn set_sink_mute(&self, _: &str, _: bool) -> Result<(), ServerCommandError> {
                Ok(())
            }
            fn set_source_mute(&self, _: &str, _: bool) -> Result<(), ServerCommandError> {
                Ok(())
            }
            fn set_sink_input_mute(&self, _: u32, _: bool) -> Result<(), ServerCommandError> {
                Ok(())
            }
            fn set_sink_volume(&self, _: &str, _: &str) -> Result<(), ServerCommandError> {
                Ok(())
            }
            fn get_sink_mute(&self, _: &str) -> Option<bool> {
                None
            }
            fn set_sink_properties(
                &self,
                _: &str,
                _: &[(&str, &str)],
            ) -> Result<(), ServerCommandError> {
                Ok(())
            }
            fn set_source_properties(
                &self,
                _: &str,
                _: &[(&str, &str)],
            ) -> Result<(), ServerCommandError> {
                Ok(())
            }
            fn try_info(&self) -> bool {
                true
            }
        }

        let driver = FakeDriver(vec![ModuleInfo {
            id: 1,
            name: "module-loopback".to_string(),
            args: "source=vsink.browser.monitor sink=alsa_output.hw0 latency_msec=30".to_string(),
        }]);
        assert!(driver.loopback_exists("vsink.browser.monitor", "alsa_output.hw0"));
        assert!(!driver.loopback_exists("vsink.browser.monitor", "alsa_output.hw1"));
    }
}
