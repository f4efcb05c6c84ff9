// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Optional line-oriented trace log under the cache directory, independent
//! of `tracing`. Enabled by `AUDIOROUTER_TRACE` or a sentinel file so a
//! user can turn it on without restarting anything that reads env vars at
//! startup only.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "audiorouter")
        .map(|d| d.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".cache/audiorouter"))
}

fn sentinel_path() -> PathBuf {
    cache_dir().join("trace.on")
}

fn trace_file_path() -> PathBuf {
    cache_dir().join("trace.log")
}

fn env_enabled() -> bool {
    std::env::var("AUDIOROUTER_TRACE")
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn enabled() -> bool {
    env_enabled() || sentinel_path().is_file()
}

/// Append a timestamped line to the trace log if tracing is enabled.
/// Failures (missing cache dir, permissions) are swallowed; this is a
/// best-effort diagnostic aid, never load-bearing.
pub fn trace(msg: &str) {
    if !enabled() {
        return;
    }

    let dir = cache_dir();
    if fs::create_dir_all(&dir).is_err() {
        return;
    }

    let Ok(elapsed) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return;
    };
    let ts = elapsed.as_secs_f64();

    if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(trace_file_path()) {
        let _ = writeln!(f, "{ts:.6} {msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_enabled_accepts_known_truthy_values() {
        for v in ["1", "true", "YES", "On"] {
            std::env::set_var("AUDIOROUTER_TRACE", v);
            assert!(env_enabled());
        }
        std::env::set_var("AUDIOROUTER_TRACE", "0");
        assert!(!env_enabled());
        std::env::remove_var("AUDIOROUTER_TRACE");
    }
}
