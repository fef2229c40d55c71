// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Service preferences, stored as JSON under the platform config directory.
//!
//! Best-effort on both ends: a missing or unreadable file yields defaults,
//! and a failed save is logged, never fatal. `GROVE_SOCKET` overrides the
//! socket path for ad-hoc runs. Nothing here affects the wire format.

use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use grove_proto::MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Tunable node preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prefs {
    /// Unix socket the node listens on.
    pub socket_path: String,
    /// Per-frame payload cap in bytes.
    pub max_frame_bytes: usize,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            socket_path: grove_proto::default_socket_path().display().to_string(),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

fn config_file() -> Option<PathBuf> {
    ProjectDirs::from("dev", "grove", "Grove").map(|dirs| dirs.config_dir().join("service.json"))
}

/// Load preferences: config file, then environment overrides, then defaults.
pub fn load() -> Prefs {
    let mut prefs: Prefs = config_file()
        .and_then(|path| fs::read(path).ok())
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default();
    if let Ok(socket) = std::env::var("GROVE_SOCKET") {
        prefs.socket_path = socket;
    }
    prefs
}

/// Persist preferences so the defaults materialize on first run.
pub fn save(prefs: &Prefs) {
    let Some(path) = config_file() else {
        return;
    };
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            warn!(?err, "could not create config dir");
            return;
        }
    }
    match serde_json::to_vec_pretty(prefs) {
        Ok(bytes) => {
            if let Err(err) = fs::write(&path, bytes) {
                warn!(?err, path = %path.display(), "could not save prefs");
            }
        }
        Err(err) => warn!(?err, "could not serialize prefs"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── 1. defaults are sane ────────────────────────────────────────────

    #[test]
    fn defaults_are_sane() {
        let prefs = Prefs::default();
        assert!(prefs.socket_path.ends_with("grove.sock"));
        assert_eq!(prefs.max_frame_bytes, MAX_FRAME_BYTES);
    }

    // ── 2. prefs survive a JSON round-trip ──────────────────────────────

    #[test]
    fn prefs_round_trip_json() {
        let prefs = Prefs {
            socket_path: "/tmp/custom.sock".into(),
            max_frame_bytes: 1024,
        };
        let bytes = serde_json::to_vec(&prefs).unwrap();
        let back: Prefs = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.socket_path, prefs.socket_path);
        assert_eq!(back.max_frame_bytes, prefs.max_frame_bytes);
    }
}
