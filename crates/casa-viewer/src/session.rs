//! Session registry
//!
//! Maps each (viewer, camera) pair to a previously negotiated media session
//! so a viewer can resume a stream instead of renegotiating from scratch.
//! Backed by a JSON file in the platform data directory. This is a cache,
//! not a system of record: any storage failure degrades to "no session"
//! and full renegotiation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use casa_core::ids::{generate_session_id, unix_secs};
use casa_core::SESSION_TTL_SECS;

/// Persisted session record. Expiry invalidates the whole record, not
/// per-device entries: one stale entry forces full renegotiation for all
/// devices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,

    /// Unix seconds at creation; the TTL is measured from here
    pub created_at: u64,

    /// deviceId -> negotiated media session id
    #[serde(default)]
    pub device_sessions: HashMap<String, String>,
}

impl SessionInfo {
    fn fresh() -> Self {
        Self {
            session_id: generate_session_id(),
            created_at: unix_secs(),
            device_sessions: HashMap::new(),
        }
    }

    /// Whether the record as a whole has outlived the TTL
    pub fn is_expired(&self) -> bool {
        unix_secs().saturating_sub(self.created_at) > SESSION_TTL_SECS
    }
}

/// Durable session registry
pub struct SessionRegistry {
    path: PathBuf,
}

impl SessionRegistry {
    /// Create a registry storing its session file under `dir`
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: dir.as_ref().join("session.json"),
        }
    }

    /// Current session id, creating and persisting a fresh one if none
    /// exists or the existing one is expired
    pub fn get_or_create_session_id(&self) -> String {
        if let Some(info) = self.read_live() {
            return info.session_id;
        }

        let info = SessionInfo::fresh();
        self.write(&info);
        info.session_id
    }

    /// Record a resumable media session for a device. Idempotent; creates
    /// the session if none exists.
    pub fn set_device_session(&self, device_id: &str, media_session_id: &str) {
        let mut info = self.read_live().unwrap_or_else(SessionInfo::fresh);
        info.device_sessions
            .insert(device_id.to_string(), media_session_id.to_string());
        self.write(&info);
    }

    /// Resumable media session for a device, if the session is live and
    /// the device has an entry
    pub fn get_device_session(&self, device_id: &str) -> Option<String> {
        self.read_live()?.device_sessions.get(device_id).cloned()
    }

    /// Drop one device entry, keeping the session itself
    pub fn clear_device_session(&self, device_id: &str) {
        if let Some(mut info) = self.read_live() {
            if info.device_sessions.remove(device_id).is_some() {
                self.write(&info);
            }
        }
    }

    /// Invalidate the whole session record
    pub fn clear_session(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Session cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clear session file {:?}: {}", self.path, e),
        }
    }

    /// Read the session record, treating errors and expiry as "no session"
    fn read_live(&self) -> Option<SessionInfo> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read session file {:?}: {}", self.path, e);
                return None;
            }
        };

        let info: SessionInfo = match serde_json::from_str(&content) {
            Ok(i) => i,
            Err(e) => {
                warn!("Discarding unreadable session file {:?}: {}", self.path, e);
                return None;
            }
        };

        if info.is_expired() {
            debug!("Session {} expired", info.session_id);
            return None;
        }

        Some(info)
    }

    /// Persist the session record. Write failures are logged, not surfaced.
    fn write(&self, info: &SessionInfo) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create session dir {:?}: {}", parent, e);
                return;
            }
        }

        let json = match serde_json::to_string_pretty(info) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize session: {}", e);
                return;
            }
        };

        if let Err(e) = std::fs::write(&self.path, json) {
            warn!("Failed to write session file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, SessionRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path());
        (dir, registry)
    }

    /// Write a session record with a back-dated creation time
    fn write_aged(dir: &Path, age_secs: u64, devices: &[(&str, &str)]) -> String {
        let info = SessionInfo {
            session_id: generate_session_id(),
            created_at: unix_secs() - age_secs,
            device_sessions: devices
                .iter()
                .map(|(d, m)| (d.to_string(), m.to_string()))
                .collect(),
        };
        std::fs::write(
            dir.join("session.json"),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();
        info.session_id
    }

    #[test]
    fn test_session_id_is_stable() {
        let (_dir, registry) = registry();

        let first = registry.get_or_create_session_id();
        let second = registry.get_or_create_session_id();
        assert_eq!(first, second);
    }

    #[test]
    fn test_device_session_round_trip() {
        let (_dir, registry) = registry();

        assert_eq!(registry.get_device_session("porch"), None);

        registry.set_device_session("porch", "media-1");
        assert_eq!(registry.get_device_session("porch"), Some("media-1".into()));

        // Idempotent
        registry.set_device_session("porch", "media-1");
        assert_eq!(registry.get_device_session("porch"), Some("media-1".into()));

        registry.clear_device_session("porch");
        assert_eq!(registry.get_device_session("porch"), None);
    }

    #[test]
    fn test_expiry_invalidates_whole_record() {
        let (dir, registry) = registry();

        // Deliberate behavior: expiry drops every device entry, not just
        // stale ones. A fresh session never inherits the old mapping.
        let old_id = write_aged(
            dir.path(),
            SESSION_TTL_SECS + 1,
            &[("porch", "media-1"), ("garage", "media-2")],
        );

        assert_eq!(registry.get_device_session("porch"), None);
        assert_eq!(registry.get_device_session("garage"), None);

        let new_id = registry.get_or_create_session_id();
        assert_ne!(new_id, old_id);
        assert_eq!(registry.get_device_session("porch"), None);
    }

    #[test]
    fn test_session_within_ttl_survives() {
        let (dir, registry) = registry();

        let id = write_aged(dir.path(), SESSION_TTL_SECS - 60, &[("porch", "media-1")]);

        assert_eq!(registry.get_or_create_session_id(), id);
        assert_eq!(registry.get_device_session("porch"), Some("media-1".into()));
    }

    #[test]
    fn test_clear_session() {
        let (_dir, registry) = registry();

        registry.set_device_session("porch", "media-1");
        let old_id = registry.get_or_create_session_id();

        registry.clear_session();
        // Idempotent
        registry.clear_session();

        assert_eq!(registry.get_device_session("porch"), None);
        assert_ne!(registry.get_or_create_session_id(), old_id);
    }

    #[test]
    fn test_corrupt_file_degrades_to_no_session() {
        let (dir, registry) = registry();

        std::fs::write(dir.path().join("session.json"), "not json").unwrap();

        assert_eq!(registry.get_device_session("porch"), None);
        // Recovers by writing a fresh record
        let id = registry.get_or_create_session_id();
        assert_eq!(registry.get_or_create_session_id(), id);
    }

    #[test]
    fn test_unwritable_dir_never_panics() {
        // Parent path is a file, so every read and write fails
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let registry = SessionRegistry::new(&blocker);

        registry.set_device_session("porch", "media-1");
        assert_eq!(registry.get_device_session("porch"), None);
        assert!(!registry.get_or_create_session_id().is_empty());
    }
}
