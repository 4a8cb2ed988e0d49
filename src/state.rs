//! Persisted process state. A single JSON file in the state directory, the
//! only on-disk artifact the gateway writes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    /// Stable identity for this installation, minted on first start.
    pub instance_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<bool>,
    /// Last backend version observed; used to gate upgrade paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_version: Option<String>,
}

impl PersistedState {
    fn fresh() -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            telemetry: None,
            backend_version: None,
        }
    }
}

pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// Open (or initialize) the state file under `dir`. Creates the directory
    /// and a fresh state when missing; a corrupt file is replaced rather than
    /// failing startup.
    pub fn open(dir: &Path) -> Result<(Self, PersistedState)> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Msg(format!("cannot create state dir {}: {e}", dir.display())))?;
        let path = dir.join(STATE_FILE);
        let file = Self { path };

        let state = match fs::read(&file.path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(path = %file.path.display(), error = %e, "state file corrupt; reinitializing");
                    let state = PersistedState::fresh();
                    file.save(&state)?;
                    state
                }
            },
            Err(_) => {
                let state = PersistedState::fresh();
                file.save(&state)?;
                state
            }
        };
        Ok((file, state))
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Msg(format!("state serialize: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)
            .map_err(|e| Error::Msg(format!("state write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Msg(format!("state rename {}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("oxgate-state-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn initializes_and_reloads() {
        let dir = scratch_dir();
        let (_, first) = StateFile::open(&dir).unwrap();
        let (_, second) = StateFile::open(&dir).unwrap();
        assert_eq!(first.instance_id, second.instance_id);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn save_round_trip() {
        let dir = scratch_dir();
        let (file, mut state) = StateFile::open(&dir).unwrap();
        state.telemetry = Some(false);
        state.backend_version = Some("1.0".into());
        file.save(&state).unwrap();
        let (_, reloaded) = StateFile::open(&dir).unwrap();
        assert_eq!(reloaded, state);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_file_reinitialized() {
        let dir = scratch_dir();
        fs::write(dir.join(STATE_FILE), b"not json").unwrap();
        let (_, state) = StateFile::open(&dir).unwrap();
        assert!(state.telemetry.is_none());
        fs::remove_dir_all(&dir).unwrap();
    }
}
