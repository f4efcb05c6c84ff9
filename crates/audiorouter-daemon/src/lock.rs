// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Single-instance guard: an exclusively-created pid file under the user
//! cache directory. Mirrors `gui.py::_is_pid_alive`'s three-way pid
//! liveness classification (`os.kill(pid, 0)` / `ProcessLookupError` /
//! `PermissionError`), translated to the libc errno equivalents.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::AudioRouterError;

const LOCK_FILE_NAME: &str = "audiorouter-daemon.lock";

fn lock_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "audiorouter")
        .map(|d| d.cache_dir().join(LOCK_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(".cache/audiorouter").join(LOCK_FILE_NAME))
}

/// `true` iff `pid` names a process we believe is still alive. A foreign
/// uid we're not permitted to signal (`EPERM`) is treated as alive: we
/// have no way to tell it apart from a live process we simply can't see.
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ESRCH) => false,
        _ => true,
    }
}

/// Held for the lifetime of the process; removes the lock file on drop,
/// but only if it still names our own pid (a stale lock we stole should
/// not be deleted out from under whoever stole it back).
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Ok(content) = fs::read_to_string(&self.path) {
            if content.trim().parse::<u32>() == Ok(self.pid) {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

/// Acquire the single-instance lock. Exclusive creation; if the file
/// already exists and its pid is alive, returns `LockContention`. If the
/// pid is dead, the stale file is removed and creation retried once.
pub fn acquire() -> Result<InstanceLock, AudioRouterError> {
    let path = lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let pid = std::process::id();
    match try_create(&path, pid) {
        Ok(()) => Ok(InstanceLock { path, pid }),
        Err(_) => {
            let existing_pid = fs::read_to_string(&path)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());

            match existing_pid {
                Some(existing) if is_pid_alive(existing) => {
                    Err(AudioRouterError::LockContention(existing))
                }
                _ => {
                    // Dead or unreadable: drop the stale file and retry once.
                    let _ = fs::remove_file(&path);
                    try_create(&path, pid).map_err(AudioRouterError::Io)?;
                    Ok(InstanceLock { path, pid })
                }
            }
        }
    }
}

fn try_create(path: &Path, pid: u32) -> std::io::Result<()> {
    let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(f, "{}", pid)?;
    Ok(())
}
