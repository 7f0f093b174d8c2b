use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

use ads_confirmations::tokens::TokenPreimage;

use crate::error::{IssuerError, Result};

pub fn hash_preimage(preimage: &TokenPreimage) -> [u8; 32] {
    Sha256::digest(preimage.as_bytes()).into()
}

/// Hashes of every payment token preimage already spent. Persisted so a restart does not
/// reopen the door to double spends.
pub struct SpentTokenStore {
    cache: HashSet<[u8; 32]>,
    /// `None` keeps the store in memory
    path: Option<PathBuf>,
}

impl SpentTokenStore {
    pub fn in_memory() -> Self {
        Self {
            cache: HashSet::new(),
            path: None,
        }
    }

    fn compute_checksum(tokens: &HashSet<[u8; 32]>) -> [u8; 32] {
        let mut hasher = Sha256::new();

        // sorted for a deterministic checksum
        let mut sorted: Vec<_> = tokens.iter().collect();
        sorted.sort();
        for token in sorted {
            hasher.update(token);
        }

        hasher.finalize().into()
    }

    /// Loads the store, refusing to start from a file whose checksum does not match.
    pub fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            info!("No spent token store at {}, starting empty", path.display());
            return Ok(Self {
                cache: HashSet::new(),
                path: Some(path),
            });
        }

        let data = std::fs::read(&path)
            .map_err(|e| IssuerError::Internal(format!("Failed to read spent token store: {}", e)))?;
        if data.len() % 32 != 0 {
            return Err(IssuerError::Internal(format!(
                "Spent token store {} has a truncated record",
                path.display()
            )));
        }

        let cache: HashSet<[u8; 32]> = data
            .chunks_exact(32)
            .map(|chunk| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let checksum_path = path.with_extension("checksum");
        match std::fs::read(&checksum_path) {
            Ok(stored) if stored.as_slice() == Self::compute_checksum(&cache).as_slice() => {}
            Ok(_) => {
                return Err(IssuerError::Internal(
                    "Spent token store checksum mismatch, file may be corrupted".into(),
                ))
            }
            Err(e) => {
                warn!("Could not read checksum file, proceeding without verification: {}", e)
            }
        }

        info!("Loaded {} spent tokens from {}", cache.len(), path.display());
        Ok(Self {
            cache,
            path: Some(path),
        })
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn contains(&self, hash: &[u8; 32]) -> bool {
        self.cache.contains(hash)
    }

    /// Marks every hash spent, or none of them. Fails with `TokenAlreadySpent` if any
    /// hash was spent before or repeats within `hashes`.
    pub fn spend_all(&mut self, hashes: &[[u8; 32]]) -> Result<()> {
        let mut batch = HashSet::new();
        for hash in hashes {
            if self.cache.contains(hash) || !batch.insert(*hash) {
                return Err(IssuerError::TokenAlreadySpent);
            }
        }

        let mut next = self.cache.clone();
        next.extend(batch);
        self.persist(&next)?;
        self.cache = next;
        Ok(())
    }

    fn persist(&self, tokens: &HashSet<[u8; 32]>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let temp_path = path.with_extension("tmp");
        let checksum_path = path.with_extension("checksum");

        {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp_path).map_err(|e| {
                IssuerError::Internal(format!("Failed to create temp spent token store: {}", e))
            })?;
            for token in tokens {
                file.write_all(token).map_err(|e| {
                    IssuerError::Internal(format!("Failed to write spent token: {}", e))
                })?;
            }
            file.sync_all().map_err(|e| {
                IssuerError::Internal(format!("Failed to sync spent token store: {}", e))
            })?;
        }

        std::fs::write(&checksum_path, Self::compute_checksum(tokens))
            .map_err(|e| IssuerError::Internal(format!("Failed to write checksum: {}", e)))?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            IssuerError::Internal(format!("Failed to rename spent token store: {}", e))
        })?;
        Ok(())
    }
}
