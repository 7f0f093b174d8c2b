use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{Persistence, StateStore, StoreState};
use crate::error::StoreError;

/// On-disk layout: the state plus a SHA-256 checksum of its canonical JSON
#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    state: StoreState,
}

fn compute_checksum(state: &StoreState) -> Result<String, StoreError> {
    let bytes =
        serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Writes the whole state to a temp file, syncs it and renames it over the previous one,
/// so a crash leaves either the old or the new state on disk.
#[derive(Clone, Debug)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    fn load(&self) -> Result<StoreState, StoreError> {
        if !self.path.exists() {
            info!("No state at {}, starting fresh", self.path.display());
            return Ok(StoreState::default());
        }

        let data = std::fs::read(&self.path)
            .map_err(|e| StoreError::Io(format!("Failed to read {}: {}", self.path.display(), e)))?;
        let envelope: Envelope = serde_json::from_slice(&data)
            .map_err(|e| StoreError::Corrupted(format!("Unreadable state file: {}", e)))?;

        if compute_checksum(&envelope.state)? != envelope.checksum {
            warn!("State checksum mismatch in {}", self.path.display());
            return Err(StoreError::Corrupted("checksum mismatch".into()));
        }

        info!(
            "Loaded {} confirmations, {} payments and {} payment tokens (checksum verified)",
            envelope.state.confirmations.len(),
            envelope.state.payments.len(),
            envelope.state.payment_tokens.len()
        );
        Ok(envelope.state)
    }
}

impl Persistence for JsonFile {
    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let envelope = Envelope {
            checksum: compute_checksum(state)?,
            state: state.clone(),
        };
        let data = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&temp_path)
                .map_err(|e| StoreError::Io(format!("Failed to create temp state file: {}", e)))?;
            file.write_all(&data)
                .map_err(|e| StoreError::Io(format!("Failed to write state: {}", e)))?;
            file.sync_all()
                .map_err(|e| StoreError::Io(format!("Failed to sync state: {}", e)))?;
        }

        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| StoreError::Io(format!("Failed to rename state file: {}", e)))?;
        Ok(())
    }
}

impl StateStore<JsonFile> {
    /// Opens the store at `path`, creating it on first write. A file that fails its
    /// checksum is refused rather than silently replaced.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let persistence = JsonFile {
            path: path.as_ref().to_path_buf(),
        };
        let state = persistence.load()?;
        Ok(Self::with_state(state, persistence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::{AdEvent, ConfirmationType, CreativeAd};
    use crate::store::{ConfirmationStore, JsonFileStore};
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("confirmations.json");
        let now = Utc::now();
        let event = AdEvent::new(&CreativeAd::new("c", "s", "p"), ConfirmationType::Served, now);

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.append_ad_event(&event).await.unwrap();
            store.set_next_payout_at(now).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.ad_events().await.unwrap(), vec![event]);
        assert_eq!(reopened.next_payout_at().await.unwrap(), Some(now));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_tampered_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("confirmations.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            store
                .append_ad_event(&AdEvent::new(
                    &CreativeAd::new("c", "s", "p"),
                    ConfirmationType::Served,
                    Utc::now(),
                ))
                .await
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replace("\"served\"", "\"view\"")).unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn test_garbage_file_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("confirmations.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Corrupted(_))
        ));
    }
}
