use thiserror::Error;

use crate::ads::ConfirmationType;

pub type Result<T> = std::result::Result<T, ConfirmationsError>;

/// Failures at the Token Algebra boundary. Never panics on attacker-controlled bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Proof verification failed")]
    ProofVerification,

    #[error("Length mismatch: {blinded} blinded tokens, {signed} signed tokens")]
    LengthMismatch { blinded: usize, signed: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("State corrupted: {0}")]
    Corrupted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Outcome of a failed redemption attempt. Contained inside the redeemers; callers only
/// ever see the resulting lifecycle events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedemptionError {
    #[error("Malformed issuer response: {0}")]
    Decode(String),

    #[error("Issuer proof did not verify")]
    ProofVerification,

    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    #[error("Issuer rejected request with status {status}: {message}")]
    PermanentServer { status: u16, message: String },

    #[error("No valid issuer for public key")]
    NoIssuers,

    #[error("Issuer has no signed credentials yet (status {status})")]
    CredentialsPending { status: u16 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RedemptionError {
    pub fn should_retry(&self) -> bool {
        !matches!(self, RedemptionError::PermanentServer { .. })
    }

    /// Local store failures and credentials the issuer has not created yet are retried
    /// without growing the delay.
    pub fn should_backoff(&self) -> bool {
        !matches!(
            self,
            RedemptionError::PermanentServer { .. }
                | RedemptionError::Store(_)
                | RedemptionError::CredentialsPending { .. }
        )
    }
}

impl From<TokenError> for RedemptionError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::ProofVerification => RedemptionError::ProofVerification,
            other => RedemptionError::Decode(other.to_string()),
        }
    }
}

impl From<NetworkError> for RedemptionError {
    fn from(err: NetworkError) -> Self {
        RedemptionError::TransientNetwork(err.to_string())
    }
}

/// Normal "not eligible" outcome of the exclusion rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{rule} excluded {creative_instance_id} ({confirmation_type}): {message}")]
pub struct CapExceededError {
    pub rule: &'static str,
    pub creative_instance_id: String,
    pub confirmation_type: ConfirmationType,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ConfirmationsError {
    #[error(transparent)]
    CapExceeded(#[from] CapExceededError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Confirmations service has stopped")]
    ServiceStopped,
}
