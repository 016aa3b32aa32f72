//! Persistence contract for connection state.
//!
//! One JSON document per connection plus one global document. The format is
//! versioned with an integer field: readers ignore unknown fields and
//! default missing ones, so documents move across versions in both
//! directions. Persistence failures never reach API callers; the manager
//! turns them into events.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::state::quality::{ConnectionQuality, HealthBand};
use crate::transport::ConnectionType;

/// Current document format version
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Persistence failure. Only ever logged or emitted as an event.
#[derive(Debug, thiserror::Error)]
#[error("persistence error: {cause}")]
pub struct PersistenceError {
    /// What went wrong
    pub cause: String,
}

impl PersistenceError {
    fn new(cause: impl std::fmt::Display) -> Self {
        Self {
            cause: cause.to_string(),
        }
    }
}

/// Persisted snapshot of one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDocument {
    /// Document format version
    #[serde(default)]
    pub version: u32,
    /// Connection id
    pub connection_id: String,
    /// Scanner the connection targets
    pub scanner: String,
    /// Link kind
    pub connection_type: ConnectionType,
    /// Last observed state, as a plain string
    #[serde(default)]
    pub last_state: String,
    /// Unix timestamp of registration, milliseconds
    #[serde(default)]
    pub registered_at_ms: u64,
    /// Last known quality measurements
    #[serde(default)]
    pub quality: Option<ConnectionQuality>,
}

/// Persisted global view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStateDocument {
    /// Document format version
    #[serde(default)]
    pub version: u32,
    /// Number of connections in the connected state
    #[serde(default)]
    pub active_connections: usize,
    /// Number of registered connections
    #[serde(default)]
    pub total_connections: usize,
    /// Aggregate health across connections
    #[serde(default = "default_health")]
    pub overall_health: HealthBand,
}

fn default_health() -> HealthBand {
    HealthBand::Poor
}

/// Storage backend for connection state documents.
pub trait StateRepository: Send {
    /// Writes the global document
    fn save_global(&mut self, state: &GlobalStateDocument) -> Result<(), PersistenceError>;
    /// Writes one connection document
    fn save_connection(&mut self, info: &ConnectionDocument) -> Result<(), PersistenceError>;
    /// Reads the global document, if one was ever written
    fn load_global(&mut self) -> Result<Option<GlobalStateDocument>, PersistenceError>;
    /// Reads every stored connection document
    fn load_all_connections(&mut self) -> Result<Vec<ConnectionDocument>, PersistenceError>;
    /// Deletes one connection document
    fn remove_connection(&mut self, connection_id: &str) -> Result<(), PersistenceError>;
    /// Deletes everything
    fn clear_all(&mut self) -> Result<(), PersistenceError>;
}

/// [StateRepository] writing JSON files under a state directory:
/// `<state_dir>/connections/<id>.json` and `<state_dir>/global_state.json`.
#[derive(Debug)]
pub struct JsonFileRepository {
    state_dir: PathBuf,
}

impl JsonFileRepository {
    /// Creates the repository, making sure the directory layout exists.
    pub fn new(state_dir: &Path) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(state_dir.join("connections")).map_err(PersistenceError::new)?;
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
        })
    }

    fn global_path(&self) -> PathBuf {
        self.state_dir.join("global_state.json")
    }

    fn connection_path(&self, id: &str) -> PathBuf {
        // Keep ids from escaping the directory
        let safe: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.state_dir.join("connections").join(format!("{safe}.json"))
    }
}

impl StateRepository for JsonFileRepository {
    fn save_global(&mut self, state: &GlobalStateDocument) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(state).map_err(PersistenceError::new)?;
        std::fs::write(self.global_path(), json).map_err(PersistenceError::new)
    }

    fn save_connection(&mut self, info: &ConnectionDocument) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(info).map_err(PersistenceError::new)?;
        std::fs::write(self.connection_path(&info.connection_id), json)
            .map_err(PersistenceError::new)
    }

    fn load_global(&mut self) -> Result<Option<GlobalStateDocument>, PersistenceError> {
        let path = self.global_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(PersistenceError::new)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(PersistenceError::new)
    }

    fn load_all_connections(&mut self) -> Result<Vec<ConnectionDocument>, PersistenceError> {
        let dir = self.state_dir.join("connections");
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(PersistenceError::new)? {
            let path = entry.map_err(PersistenceError::new)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // A corrupt document is skipped, not fatal to the rest
            match std::fs::read_to_string(&path)
                .map_err(PersistenceError::new)
                .and_then(|raw| serde_json::from_str(&raw).map_err(PersistenceError::new))
            {
                Ok(doc) => out.push(doc),
                Err(e) => log::warn!("skipping corrupt state document {:?}: {}", path, e),
            }
        }
        Ok(out)
    }

    fn remove_connection(&mut self, connection_id: &str) -> Result<(), PersistenceError> {
        let path = self.connection_path(connection_id);
        if path.exists() {
            std::fs::remove_file(path).map_err(PersistenceError::new)?;
        }
        Ok(())
    }

    fn clear_all(&mut self) -> Result<(), PersistenceError> {
        let _ = std::fs::remove_file(self.global_path());
        let dir = self.state_dir.join("connections");
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }
}

/// Repository that stores nothing. Useful when persistence is not wanted.
#[derive(Debug, Default)]
pub struct NullRepository;

impl StateRepository for NullRepository {
    fn save_global(&mut self, _: &GlobalStateDocument) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn save_connection(&mut self, _: &ConnectionDocument) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn load_global(&mut self) -> Result<Option<GlobalStateDocument>, PersistenceError> {
        Ok(None)
    }
    fn load_all_connections(&mut self) -> Result<Vec<ConnectionDocument>, PersistenceError> {
        Ok(Vec::new())
    }
    fn remove_connection(&mut self, _: &str) -> Result<(), PersistenceError> {
        Ok(())
    }
    fn clear_all(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> ConnectionDocument {
        ConnectionDocument {
            version: STATE_FORMAT_VERSION,
            connection_id: id.into(),
            scanner: "scanner-1".into(),
            connection_type: ConnectionType::Wifi,
            last_state: "connected".into(),
            registered_at_ms: 1_700_000_000_000,
            quality: Some(ConnectionQuality {
                signal_strength_dbm: Some(-60),
                response_time_ms: 120,
                error_rate_percent: 1.0,
                throughput_bps: 250_000,
                uptime_ms: 30_000,
            }),
        }
    }

    #[test]
    fn round_trips_connection_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = JsonFileRepository::new(dir.path()).unwrap();
        repo.save_connection(&doc("conn-a")).unwrap();
        repo.save_connection(&doc("conn-b")).unwrap();
        let mut loaded = repo.load_all_connections().unwrap();
        loaded.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        assert_eq!(loaded, vec![doc("conn-a"), doc("conn-b")]);

        repo.remove_connection("conn-a").unwrap();
        assert_eq!(repo.load_all_connections().unwrap().len(), 1);
    }

    #[test]
    fn unknown_fields_are_ignored_and_missing_fields_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = JsonFileRepository::new(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("connections").join("future.json"),
            r#"{"version": 7, "connection_id": "future", "scanner": "s",
                "connection_type": "Usb", "some_new_field": [1,2,3]}"#,
        )
        .unwrap();
        let loaded = repo.load_all_connections().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].version, 7);
        assert_eq!(loaded[0].last_state, "");
        assert!(loaded[0].quality.is_none());
    }

    #[test]
    fn corrupt_documents_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = JsonFileRepository::new(dir.path()).unwrap();
        repo.save_connection(&doc("good")).unwrap();
        std::fs::write(dir.path().join("connections").join("bad.json"), "garbage").unwrap();
        let loaded = repo.load_all_connections().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].connection_id, "good");
    }

    #[test]
    fn global_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = JsonFileRepository::new(dir.path()).unwrap();
        assert!(repo.load_global().unwrap().is_none());
        let g = GlobalStateDocument {
            version: STATE_FORMAT_VERSION,
            active_connections: 2,
            total_connections: 3,
            overall_health: HealthBand::Good,
        };
        repo.save_global(&g).unwrap();
        assert_eq!(repo.load_global().unwrap(), Some(g));
    }
}
