use base64::{engine::general_purpose::STANDARD, Engine as _};
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;

use crate::error::TokenError;

/// Canonical byte and base64 wire form shared by every token algebra value.
pub trait Base64Encoding: Sized {
    const NAME: &'static str;

    fn to_bytes(&self) -> Vec<u8>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError>;

    fn encode_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    fn decode_base64(encoded: &str) -> Result<Self, TokenError> {
        if encoded.is_empty() {
            return Err(TokenError::Decode(format!("empty {}", Self::NAME)));
        }

        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| TokenError::Decode(format!("invalid base64 {}: {}", Self::NAME, e)))?;
        Self::from_bytes(&bytes)
    }
}

macro_rules! impl_base64_serde {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&$crate::tokens::Base64Encoding::encode_base64(self))
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let encoded = <String as serde::Deserialize>::deserialize(deserializer)?;
                <$ty as $crate::tokens::Base64Encoding>::decode_base64(&encoded)
                    .map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use impl_base64_serde;

pub(crate) fn decode_point(name: &str, bytes: &[u8]) -> Result<RistrettoPoint, TokenError> {
    let compressed = CompressedRistretto::from_slice(bytes).map_err(|_| {
        TokenError::Decode(format!("{} must be 32 bytes, got {}", name, bytes.len()))
    })?;

    compressed
        .decompress()
        .ok_or_else(|| TokenError::Decode(format!("{} is not a valid ristretto point", name)))
}

pub(crate) fn decode_scalar(name: &str, bytes: &[u8]) -> Result<Scalar, TokenError> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        TokenError::Decode(format!("{} must be 32 bytes, got {}", name, bytes.len()))
    })?;

    Option::from(Scalar::from_canonical_bytes(array))
        .ok_or_else(|| TokenError::Decode(format!("{} is not a canonical scalar", name)))
}

/// Wide reduction of a SHA-512 digest into a scalar.
pub(crate) fn scalar_from_digest(digest: &[u8]) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest[..64]);
    Scalar::from_bytes_mod_order_wide(&wide)
}
