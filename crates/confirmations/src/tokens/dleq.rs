use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use sha2::{Digest, Sha512};
use std::fmt;

use super::encoding::{decode_scalar, impl_base64_serde, scalar_from_digest};
use super::{Base64Encoding, BlindedToken, PublicKey, SignedToken, SigningKey, Token, UnblindedToken};
use crate::error::TokenError;

const DOMAIN_CHALLENGE: &[u8] = b"ads-confirmations/dleq-challenge/v1";
const DOMAIN_BATCH: &[u8] = b"ads-confirmations/dleq-batch/v1";

/// Proof that `log_G(Y) == log_P(Q)`: the signed token was produced with the key behind
/// the presented public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DleqProof {
    c: Scalar,
    s: Scalar,
}

/// A single DLEQ proof over a random linear combination of every token in a batch.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BatchDleqProof(DleqProof);

impl DleqProof {
    pub fn new(blinded: &BlindedToken, signed: &SignedToken, signing_key: &SigningKey) -> Self {
        Self::prove(blinded.point(), signed.point(), signing_key)
    }

    fn prove(p: RistrettoPoint, q: RistrettoPoint, signing_key: &SigningKey) -> Self {
        let y = signing_key.public_key().point();
        let nonce = Scalar::random(&mut rand::thread_rng());

        let a = nonce * RISTRETTO_BASEPOINT_POINT;
        let b = nonce * p;
        let c = challenge(&y, &p, &q, &a, &b);
        let s = nonce - c * signing_key.scalar();

        Self { c, s }
    }

    /// Fails closed: any algebraic mismatch is `false`.
    pub fn verify(&self, blinded: &BlindedToken, signed: &SignedToken, public_key: &PublicKey) -> bool {
        self.check(blinded.point(), signed.point(), public_key.point())
    }

    fn check(&self, p: RistrettoPoint, q: RistrettoPoint, y: RistrettoPoint) -> bool {
        let a = self.s * RISTRETTO_BASEPOINT_POINT + self.c * y;
        let b = self.s * p + self.c * q;
        challenge(&y, &p, &q, &a, &b) == self.c
    }
}

impl BatchDleqProof {
    pub fn new(
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        signing_key: &SigningKey,
    ) -> Result<Self, TokenError> {
        let (m, z) = composite(blinded, signed, &signing_key.public_key())?;
        Ok(Self(DleqProof::prove(m, z, signing_key)))
    }

    pub fn verify(&self, blinded: &[BlindedToken], signed: &[SignedToken], public_key: &PublicKey) -> bool {
        match composite(blinded, signed, public_key) {
            Ok((m, z)) => self.0.check(m, z, public_key.point()),
            Err(_) => false,
        }
    }

    /// Verifies the batch and, only on success, unblinds every signed token with the
    /// token that produced the matching blinded token.
    pub fn verify_and_unblind(
        &self,
        tokens: &[Token],
        blinded: &[BlindedToken],
        signed: &[SignedToken],
        public_key: &PublicKey,
    ) -> Result<Vec<UnblindedToken>, TokenError> {
        if tokens.len() != signed.len() {
            return Err(TokenError::LengthMismatch {
                blinded: tokens.len(),
                signed: signed.len(),
            });
        }

        if !self.verify(blinded, signed, public_key) {
            return Err(TokenError::ProofVerification);
        }

        Ok(tokens
            .iter()
            .zip(signed)
            .map(|(token, signed)| token.unblind(signed))
            .collect())
    }
}

fn challenge(
    y: &RistrettoPoint,
    p: &RistrettoPoint,
    q: &RistrettoPoint,
    a: &RistrettoPoint,
    b: &RistrettoPoint,
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(DOMAIN_CHALLENGE);
    for point in [&RISTRETTO_BASEPOINT_POINT, y, p, q, a, b] {
        hasher.update(point.compress().as_bytes());
    }
    scalar_from_digest(&hasher.finalize())
}

/// `M = sum(c_i * P_i)`, `Z = sum(c_i * Q_i)` with `c_i` bound to the whole batch.
fn composite(
    blinded: &[BlindedToken],
    signed: &[SignedToken],
    public_key: &PublicKey,
) -> Result<(RistrettoPoint, RistrettoPoint), TokenError> {
    if blinded.is_empty() || blinded.len() != signed.len() {
        return Err(TokenError::LengthMismatch {
            blinded: blinded.len(),
            signed: signed.len(),
        });
    }

    let mut seed_hasher = Sha512::new();
    seed_hasher.update(DOMAIN_BATCH);
    seed_hasher.update(public_key.point().compress().as_bytes());
    for token in blinded {
        seed_hasher.update(token.point().compress().as_bytes());
    }
    for token in signed {
        seed_hasher.update(token.point().compress().as_bytes());
    }
    let seed = seed_hasher.finalize();

    let mut m = RistrettoPoint::identity();
    let mut z = RistrettoPoint::identity();
    for (index, (p, q)) in blinded.iter().zip(signed).enumerate() {
        let mut hasher = Sha512::new();
        hasher.update(seed);
        hasher.update((index as u64).to_le_bytes());
        let c = scalar_from_digest(&hasher.finalize());

        m += c * p.point();
        z += c * q.point();
    }

    Ok((m, z))
}

impl Base64Encoding for DleqProof {
    const NAME: &'static str = "DLEQ proof";

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(self.c.as_bytes());
        bytes.extend_from_slice(self.s.as_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != 64 {
            return Err(TokenError::Decode(format!(
                "DLEQ proof must be 64 bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self {
            c: decode_scalar("DLEQ proof challenge", &bytes[..32])?,
            s: decode_scalar("DLEQ proof response", &bytes[32..])?,
        })
    }
}

impl Base64Encoding for BatchDleqProof {
    const NAME: &'static str = "batch DLEQ proof";

    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        DleqProof::from_bytes(bytes).map(Self)
    }
}

impl fmt::Debug for DleqProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DleqProof({})", self.encode_base64())
    }
}

impl fmt::Debug for BatchDleqProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchDleqProof({})", self.encode_base64())
    }
}

impl_base64_serde!(DleqProof);
impl_base64_serde!(BatchDleqProof);

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(signing_key: &SigningKey, count: usize) -> (Vec<Token>, Vec<BlindedToken>, Vec<SignedToken>) {
        let tokens: Vec<Token> = (0..count).map(|_| Token::random()).collect();
        let blinded: Vec<BlindedToken> = tokens.iter().map(|t| t.blind().0).collect();
        let signed = blinded.iter().map(|b| signing_key.sign(b)).collect();
        (tokens, blinded, signed)
    }

    #[test]
    fn test_single_proof_verifies() {
        let signing_key = SigningKey::random();
        let (_, blinded, signed) = issue(&signing_key, 1);

        let proof = DleqProof::new(&blinded[0], &signed[0], &signing_key);
        assert!(proof.verify(&blinded[0], &signed[0], &signing_key.public_key()));
    }

    #[test]
    fn test_single_proof_rejects_other_public_key() {
        let signing_key = SigningKey::random();
        let other = SigningKey::random();
        let (_, blinded, signed) = issue(&signing_key, 1);

        let proof = DleqProof::new(&blinded[0], &signed[0], &signing_key);
        assert!(!proof.verify(&blinded[0], &signed[0], &other.public_key()));
    }

    #[test]
    fn test_single_proof_rejects_signature_from_other_key() {
        let signing_key = SigningKey::random();
        let other = SigningKey::random();
        let (_, blinded, _) = issue(&signing_key, 1);

        let forged = other.sign(&blinded[0]);
        let proof = DleqProof::new(&blinded[0], &forged, &signing_key);
        assert!(!proof.verify(&blinded[0], &forged, &signing_key.public_key()));
    }

    #[test]
    fn test_batch_proof_verifies_and_unblinds() {
        let signing_key = SigningKey::random();
        let (tokens, blinded, signed) = issue(&signing_key, 5);

        let proof = BatchDleqProof::new(&blinded, &signed, &signing_key).unwrap();
        let unblinded = proof
            .verify_and_unblind(&tokens, &blinded, &signed, &signing_key.public_key())
            .unwrap();

        assert_eq!(unblinded.len(), 5);
        for (token, unblinded) in tokens.iter().zip(&unblinded) {
            assert_eq!(unblinded, &signing_key.rederive_unblinded_token(&token.preimage()));
        }
    }

    #[test]
    fn test_batch_proof_rejects_swapped_signatures() {
        let signing_key = SigningKey::random();
        let (tokens, blinded, mut signed) = issue(&signing_key, 3);
        let proof = BatchDleqProof::new(&blinded, &signed, &signing_key).unwrap();

        signed.swap(0, 1);
        assert_eq!(
            proof.verify_and_unblind(&tokens, &blinded, &signed, &signing_key.public_key()),
            Err(TokenError::ProofVerification)
        );
    }

    #[test]
    fn test_batch_proof_fails_closed_on_length_mismatch() {
        let signing_key = SigningKey::random();
        let (_, blinded, signed) = issue(&signing_key, 3);
        let proof = BatchDleqProof::new(&blinded, &signed, &signing_key).unwrap();

        assert!(!proof.verify(&blinded[..2], &signed, &signing_key.public_key()));
        assert!(!proof.verify(&[], &[], &signing_key.public_key()));
        assert!(BatchDleqProof::new(&[], &[], &signing_key).is_err());
    }

    #[test]
    fn test_proof_base64_roundtrip_and_malformed_input() {
        let signing_key = SigningKey::random();
        let (_, blinded, signed) = issue(&signing_key, 2);
        let proof = BatchDleqProof::new(&blinded, &signed, &signing_key).unwrap();

        let decoded = BatchDleqProof::decode_base64(&proof.encode_base64()).unwrap();
        assert!(decoded.verify(&blinded, &signed, &signing_key.public_key()));

        assert!(BatchDleqProof::decode_base64("").is_err());
        assert!(BatchDleqProof::decode_base64("AAAA").is_err());
    }
}
