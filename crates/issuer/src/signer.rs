//! Issuer key custody. The signing key is saved to disk so tokens signed before a
//! restart can still be spent after it.
use std::path::Path;

use ads_confirmations::tokens::{
    Base64Encoding, BatchDleqProof, BlindedToken, PublicKey, SignedToken, SigningKey,
    TokenPreimage, VerificationSignature,
};
use ads_confirmations::{Issuer, Issuers};
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::error::{IssuerError, Result};

pub struct IssuerSigner {
    signing_key: SigningKey,
    issuer: Issuer,
}

impl IssuerSigner {
    pub fn new(signing_key: SigningKey, name: &str, valid_days: i64) -> Self {
        let now = Utc::now();
        let issuer = Issuer {
            public_key: signing_key.public_key(),
            name: name.to_string(),
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(valid_days),
        };
        Self {
            signing_key,
            issuer,
        }
    }

    pub fn new_or_load(key_path: &Path, name: &str, valid_days: i64) -> Result<Self> {
        if key_path.exists() {
            let signing_key = Self::load_from_file(key_path)?;
            info!("Loaded issuer key from {}", key_path.display());
            return Ok(Self::new(signing_key, name, valid_days));
        }

        let signing_key = SigningKey::random();
        info!("Generated issuer key {}", signing_key.public_key().encode_base64());
        if let Err(e) = Self::save_to_file(&signing_key, key_path) {
            warn!("Failed to save issuer key to {}: {}", key_path.display(), e);
            warn!("Tokens signed by this process will not survive a restart");
        } else {
            info!("Saved issuer key to {}", key_path.display());
        }

        Ok(Self::new(signing_key, name, valid_days))
    }

    // an unreadable key is fatal: generating a fresh one would orphan every issued token
    fn load_from_file(path: &Path) -> Result<SigningKey> {
        let encoded = std::fs::read_to_string(path)
            .map_err(|e| IssuerError::Crypto(format!("Failed to read key file: {}", e)))?;
        SigningKey::decode_base64(encoded.trim())
            .map_err(|e| IssuerError::Crypto(format!("Invalid signing key: {}", e)))
    }

    fn save_to_file(signing_key: &SigningKey, path: &Path) -> Result<()> {
        std::fs::write(path, signing_key.encode_base64())
            .map_err(|e| IssuerError::Crypto(format!("Failed to write key file: {}", e)))
    }

    pub fn public_key(&self) -> PublicKey {
        self.signing_key.public_key()
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn catalog(&self) -> Issuers {
        Issuers::new(vec![self.issuer.clone()])
    }

    /// Signs every blinded token and proves the whole batch used this key.
    pub fn sign_batch(&self, blinded: &[BlindedToken]) -> Result<(Vec<SignedToken>, BatchDleqProof)> {
        if blinded.is_empty() {
            return Err(IssuerError::InvalidRequest(
                "batch carries no tokens to sign".into(),
            ));
        }

        let signed: Vec<SignedToken> = blinded.iter().map(|token| self.signing_key.sign(token)).collect();
        let proof = BatchDleqProof::new(blinded, &signed, &self.signing_key)
            .map_err(|e| IssuerError::Crypto(format!("Failed to build proof: {}", e)))?;
        Ok((signed, proof))
    }

    /// Checks a spend: the client must hold the unblinded token for `preimage` to have
    /// produced `signature` over `payload`.
    pub fn verify_spend(
        &self,
        preimage: &TokenPreimage,
        public_key: &PublicKey,
        signature: &VerificationSignature,
        payload: &[u8],
    ) -> Result<()> {
        if public_key != &self.public_key() {
            return Err(IssuerError::UnknownPublicKey);
        }

        let token = self.signing_key.rederive_unblinded_token(preimage);
        if !token.derive_verification_key().verify(signature, payload) {
            return Err(IssuerError::InvalidSignature);
        }
        Ok(())
    }
}
