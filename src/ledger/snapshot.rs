use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{Key, StateError, WorldState};

/// On-disk form of a [`WorldState`]. Values are hex so arbitrary bytes survive
/// the JSON round trip.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    pub height: u64,
    pub entries: BTreeMap<Key, String>,
    pub state_root: String,
}

impl WorldState {
    /// SHA-256 over the height and every entry in key order.
    pub fn state_root(&self) -> [u8; 32] {
        compute_state_root(self.height, &self.entries)
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            height: self.height,
            entries: self
                .entries
                .iter()
                .map(|(key, value)| (key.clone(), hex::encode(value)))
                .collect(),
            state_root: hex::encode(self.state_root()),
        }
    }

    /// Rebuilds state from a snapshot, rejecting it if the recorded root does
    /// not match its contents. `origin` only labels errors.
    pub fn from_snapshot(snapshot: StateSnapshot, origin: &str) -> Result<Self, StateError> {
        let mut entries = BTreeMap::new();
        for (key, value) in snapshot.entries {
            if key.is_empty() {
                return Err(StateError::CorruptSnapshot {
                    path: origin.to_owned(),
                    reason: "empty key".into(),
                });
            }
            entries.insert(key, hex::decode(value)?);
        }
        let state = Self {
            height: snapshot.height,
            entries,
        };
        let actual = hex::encode(state.state_root());
        if actual != snapshot.state_root {
            return Err(StateError::CorruptSnapshot {
                path: origin.to_owned(),
                reason: format!(
                    "state root mismatch: recorded {}, computed {actual}",
                    snapshot.state_root
                ),
            });
        }
        Ok(state)
    }

    /// Loads a snapshot file. A missing file is an empty state.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if !path.exists() {
            debug!(path = %path.display(), "no snapshot on disk, starting empty");
            return Ok(Self::new());
        }
        let bytes = fs::read(path)?;
        let snapshot: StateSnapshot = serde_json::from_slice(&bytes)?;
        let state = Self::from_snapshot(snapshot, &path.display().to_string())?;
        debug!(
            path = %path.display(),
            height = state.height,
            entries = state.len(),
            "loaded world state"
        );
        Ok(state)
    }

    /// Writes the snapshot next to `path` and renames it into place.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), height = self.height, "saved world state");
        Ok(())
    }
}

fn compute_state_root(height: u64, entries: &BTreeMap<Key, Vec<u8>>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"badge-world-state");
    hasher.update(height.to_le_bytes());
    for (key, value) in entries {
        hasher.update(b"kv");
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::ChaincodeStub;

    fn sample() -> WorldState {
        let mut state = WorldState::new();
        state
            .submit("seed", |tx| -> Result<(), StateError> {
                tx.put_state("alpha", br#"{"n":1}"#.to_vec())?;
                tx.put_state("beta", vec![0, 159, 255])?;
                Ok(())
            })
            .unwrap();
        state
    }

    #[test]
    fn state_root_is_deterministic_and_tracks_contents() {
        let state = sample();
        assert_eq!(state.state_root(), sample().state_root());

        let mut changed = sample();
        changed
            .submit("tx", |tx| tx.put_state("alpha", b"other".to_vec()))
            .unwrap();
        assert_ne!(state.state_root(), changed.state_root());
    }

    #[test]
    fn snapshot_file_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("world_state.json");
        let state = sample();
        state.save(&path).unwrap();

        let loaded = WorldState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.get("beta"), Some(&[0u8, 159, 255][..]));
    }

    #[test]
    fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = WorldState::load(&dir.path().join("absent.json")).unwrap();
        assert!(state.is_empty());
        assert_eq!(state.height(), 0);
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let mut snapshot = sample().snapshot();
        snapshot
            .entries
            .insert("alpha".into(), hex::encode(b"forged"));
        let err = WorldState::from_snapshot(snapshot, "mem").unwrap_err();
        assert!(matches!(err, StateError::CorruptSnapshot { .. }));
    }
}
