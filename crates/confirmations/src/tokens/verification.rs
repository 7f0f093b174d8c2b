use hmac::{Hmac, Mac};
use sha2::{Digest, Sha512};
use std::fmt;

use super::encoding::impl_base64_serde;
use super::{Base64Encoding, UnblindedToken};
use crate::error::TokenError;

type HmacSha512 = Hmac<Sha512>;

const DOMAIN_DERIVE_KEY: &[u8] = b"ads-confirmations/derive-key/v1";
pub const VERIFICATION_SIGNATURE_LENGTH: usize = 64;

/// Shared MAC key derived from an unblinded token. The issuer can rederive it from the
/// revealed preimage, so a valid MAC proves possession of `W` without sending it.
#[derive(Clone)]
pub struct VerificationKey([u8; 64]);

#[derive(Clone, PartialEq, Eq)]
pub struct VerificationSignature([u8; VERIFICATION_SIGNATURE_LENGTH]);

impl VerificationKey {
    pub fn derive(token: &UnblindedToken) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(DOMAIN_DERIVE_KEY);
        hasher.update(token.preimage().as_bytes());
        hasher.update(token.point().compress().as_bytes());

        let mut key = [0u8; 64];
        key.copy_from_slice(&hasher.finalize());
        Self(key)
    }

    fn mac(&self) -> HmacSha512 {
        HmacSha512::new_from_slice(&self.0).expect("HMAC accepts keys of any length")
    }

    pub fn sign(&self, message: &[u8]) -> VerificationSignature {
        let mut mac = self.mac();
        mac.update(message);

        let mut signature = [0u8; VERIFICATION_SIGNATURE_LENGTH];
        signature.copy_from_slice(&mac.finalize().into_bytes());
        VerificationSignature(signature)
    }

    /// Constant-time comparison.
    pub fn verify(&self, signature: &VerificationSignature, message: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(message);
        mac.verify_slice(&signature.0).is_ok()
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VerificationKey(..)")
    }
}

impl Base64Encoding for VerificationSignature {
    const NAME: &'static str = "verification signature";

    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let signature: [u8; VERIFICATION_SIGNATURE_LENGTH] = bytes.try_into().map_err(|_| {
            TokenError::Decode(format!(
                "verification signature must be {} bytes, got {}",
                VERIFICATION_SIGNATURE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(signature))
    }
}

impl fmt::Debug for VerificationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerificationSignature({})", self.encode_base64())
    }
}

impl_base64_serde!(VerificationSignature);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{SigningKey, Token};

    #[test]
    fn test_issuer_rederives_same_verification_key() {
        let signing_key = SigningKey::random();
        let token = Token::random();
        let unblinded = token.unblind(&signing_key.sign(&token.blind().0));

        let message = b"{\"payload\":\"payment\"}";
        let signature = unblinded.derive_verification_key().sign(message);

        let issuer_side = signing_key.rederive_unblinded_token(unblinded.preimage());
        assert!(issuer_side.derive_verification_key().verify(&signature, message));
    }

    #[test]
    fn test_signature_bound_to_message_and_token() {
        let signing_key = SigningKey::random();
        let first = Token::random();
        let second = Token::random();
        let first = first.unblind(&signing_key.sign(&first.blind().0));
        let second = second.unblind(&signing_key.sign(&second.blind().0));

        let signature = first.derive_verification_key().sign(b"message");
        assert!(!first.derive_verification_key().verify(&signature, b"other message"));
        assert!(!second.derive_verification_key().verify(&signature, b"message"));
    }
}
