//! Blind-signature token algebra over ristretto255 (VOPRF with DLEQ proofs).
//!
//! Flow:
//! 1. Client generates a `Token` and blinds it: `P = r * H(t)`
//! 2. Issuer signs the `BlindedToken` without learning `t`: `Q = k * P`
//! 3. Issuer proves `log_G(Y) == log_P(Q)` with a DLEQ proof
//! 4. Client verifies the proof and unblinds: `W = r^-1 * Q = k * H(t)`
//! 5. `(t, W)` is an `UnblindedToken`; its derived key MACs the spend payload
//!
//! Nothing in here performs I/O or holds state.
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::fmt;

use crate::error::TokenError;

pub mod dleq;
pub mod encoding;
pub mod verification;

pub use dleq::{BatchDleqProof, DleqProof};
pub use encoding::Base64Encoding;
pub use verification::{VerificationKey, VerificationSignature};

use encoding::{decode_point, decode_scalar, impl_base64_serde, scalar_from_digest};

pub const TOKEN_SECRET_LENGTH: usize = 32;
pub const TOKEN_PREIMAGE_LENGTH: usize = 64;
pub const POINT_LENGTH: usize = 32;

const DOMAIN_PREIMAGE: &[u8] = b"ads-confirmations/token-preimage/v1";
const DOMAIN_BLINDING: &[u8] = b"ads-confirmations/blinding-factor/v1";
const DOMAIN_HASH_TO_CURVE: &[u8] = b"ads-confirmations/hash-to-curve/v1";

/// Client secret. Preimage and blinding factor are both derived from it, so blinding
/// is deterministic for a given token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    secret: [u8; TOKEN_SECRET_LENGTH],
}

/// The value the issuer eventually sees at spend time
#[derive(Clone, PartialEq, Eq)]
pub struct TokenPreimage([u8; TOKEN_PREIMAGE_LENGTH]);

#[derive(Clone, PartialEq, Eq)]
pub struct BlindingFactor(Scalar);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlindedToken(RistrettoPoint);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignedToken(RistrettoPoint);

/// Redeemable credential: preimage plus unblinded signature `W = k * H(t)`.
#[derive(Clone, PartialEq, Eq)]
pub struct UnblindedToken {
    preimage: TokenPreimage,
    point: RistrettoPoint,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(RistrettoPoint);

/// Issuer private key. Lives on the issuer side and in tests.
#[derive(Clone)]
pub struct SigningKey {
    k: Scalar,
    public_key: PublicKey,
}

impl Token {
    pub fn random() -> Self {
        let mut secret = [0u8; TOKEN_SECRET_LENGTH];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    pub fn from_secret(secret: [u8; TOKEN_SECRET_LENGTH]) -> Self {
        Self { secret }
    }

    pub fn preimage(&self) -> TokenPreimage {
        let mut hasher = Sha512::new();
        hasher.update(DOMAIN_PREIMAGE);
        hasher.update(self.secret);
        let digest = hasher.finalize();

        let mut preimage = [0u8; TOKEN_PREIMAGE_LENGTH];
        preimage.copy_from_slice(&digest);
        TokenPreimage(preimage)
    }

    pub fn blinding_factor(&self) -> BlindingFactor {
        let mut hasher = Sha512::new();
        hasher.update(DOMAIN_BLINDING);
        hasher.update(self.secret);
        let r = scalar_from_digest(&hasher.finalize());

        // r == 0 happens with negligible probability but would make unblinding impossible
        if r == Scalar::ZERO {
            BlindingFactor(Scalar::ONE)
        } else {
            BlindingFactor(r)
        }
    }

    pub fn blind(&self) -> (BlindedToken, BlindingFactor) {
        let factor = self.blinding_factor();
        let blinded = BlindedToken(factor.0 * self.preimage().to_point());
        (blinded, factor)
    }

    pub fn unblind(&self, signed: &SignedToken) -> UnblindedToken {
        self.blinding_factor().unblind(self.preimage(), signed)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

impl TokenPreimage {
    pub fn to_point(&self) -> RistrettoPoint {
        let mut hasher = Sha512::new();
        hasher.update(DOMAIN_HASH_TO_CURVE);
        hasher.update(self.0);
        let digest = hasher.finalize();

        let mut uniform = [0u8; 64];
        uniform.copy_from_slice(&digest);
        RistrettoPoint::from_uniform_bytes(&uniform)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_PREIMAGE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for TokenPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenPreimage({}..)", hex::encode(&self.0[..8]))
    }
}

impl BlindingFactor {
    pub fn unblind(&self, preimage: TokenPreimage, signed: &SignedToken) -> UnblindedToken {
        UnblindedToken {
            preimage,
            point: self.0.invert() * signed.0,
        }
    }
}

impl fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BlindingFactor(..)")
    }
}

impl BlindedToken {
    pub(crate) fn point(&self) -> RistrettoPoint {
        self.0
    }
}

impl SignedToken {
    pub(crate) fn point(&self) -> RistrettoPoint {
        self.0
    }
}

impl UnblindedToken {
    pub fn preimage(&self) -> &TokenPreimage {
        &self.preimage
    }

    pub fn derive_verification_key(&self) -> VerificationKey {
        VerificationKey::derive(self)
    }

    pub(crate) fn point(&self) -> RistrettoPoint {
        self.point
    }
}

impl PublicKey {
    pub(crate) fn point(&self) -> RistrettoPoint {
        self.0
    }
}

impl SigningKey {
    pub fn random() -> Self {
        let mut wide = [0u8; 64];
        rand::thread_rng().fill_bytes(&mut wide);
        Self::from_scalar(Scalar::from_bytes_mod_order_wide(&wide))
    }

    fn from_scalar(k: Scalar) -> Self {
        let public_key = PublicKey(k * RISTRETTO_BASEPOINT_POINT);
        Self { k, public_key }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn sign(&self, blinded: &BlindedToken) -> SignedToken {
        SignedToken(self.k * blinded.0)
    }

    /// Recomputes `W = k * H(t)` from a revealed preimage; used by the issuer at spend time.
    pub fn rederive_unblinded_token(&self, preimage: &TokenPreimage) -> UnblindedToken {
        UnblindedToken {
            preimage: preimage.clone(),
            point: self.k * preimage.to_point(),
        }
    }

    pub(crate) fn scalar(&self) -> Scalar {
        self.k
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

macro_rules! impl_point_encoding {
    ($ty:ident, $name:literal) => {
        impl Base64Encoding for $ty {
            const NAME: &'static str = $name;

            fn to_bytes(&self) -> Vec<u8> {
                self.0.compress().to_bytes().to_vec()
            }

            fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
                decode_point($name, bytes).map($ty)
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($ty), self.encode_base64())
            }
        }

        impl_base64_serde!($ty);
    };
}

impl_point_encoding!(BlindedToken, "blinded token");
impl_point_encoding!(SignedToken, "signed token");
impl_point_encoding!(PublicKey, "public key");

impl Base64Encoding for Token {
    const NAME: &'static str = "token";

    fn to_bytes(&self) -> Vec<u8> {
        self.secret.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let secret: [u8; TOKEN_SECRET_LENGTH] = bytes.try_into().map_err(|_| {
            TokenError::Decode(format!(
                "token must be {} bytes, got {}",
                TOKEN_SECRET_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self { secret })
    }
}

impl Base64Encoding for TokenPreimage {
    const NAME: &'static str = "token preimage";

    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let preimage: [u8; TOKEN_PREIMAGE_LENGTH] = bytes.try_into().map_err(|_| {
            TokenError::Decode(format!(
                "token preimage must be {} bytes, got {}",
                TOKEN_PREIMAGE_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(preimage))
    }
}

impl Base64Encoding for BlindingFactor {
    const NAME: &'static str = "blinding factor";

    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let r = decode_scalar("blinding factor", bytes)?;
        if r == Scalar::ZERO {
            return Err(TokenError::Decode("blinding factor must be non-zero".into()));
        }
        Ok(Self(r))
    }
}

impl Base64Encoding for UnblindedToken {
    const NAME: &'static str = "unblinded token";

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(TOKEN_PREIMAGE_LENGTH + POINT_LENGTH);
        bytes.extend_from_slice(&self.preimage.0);
        bytes.extend_from_slice(self.point.compress().as_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != TOKEN_PREIMAGE_LENGTH + POINT_LENGTH {
            return Err(TokenError::Decode(format!(
                "unblinded token must be {} bytes, got {}",
                TOKEN_PREIMAGE_LENGTH + POINT_LENGTH,
                bytes.len()
            )));
        }

        let preimage = TokenPreimage::from_bytes(&bytes[..TOKEN_PREIMAGE_LENGTH])?;
        let point = decode_point("unblinded token", &bytes[TOKEN_PREIMAGE_LENGTH..])?;
        Ok(Self { preimage, point })
    }
}

impl Base64Encoding for SigningKey {
    const NAME: &'static str = "signing key";

    fn to_bytes(&self) -> Vec<u8> {
        self.k.to_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        let k = decode_scalar("signing key", bytes)?;
        if k == Scalar::ZERO {
            return Err(TokenError::Decode("signing key must be non-zero".into()));
        }
        Ok(Self::from_scalar(k))
    }
}

impl fmt::Debug for UnblindedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnblindedToken")
            .field("preimage", &self.preimage)
            .finish_non_exhaustive()
    }
}

impl_base64_serde!(Token);
impl_base64_serde!(TokenPreimage);
impl_base64_serde!(UnblindedToken);
