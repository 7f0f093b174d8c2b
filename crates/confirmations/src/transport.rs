//! Issuer wire protocol and the transport seam it travels over.
//!
//! | Request                         | Body                                  | Success            |
//! |---------------------------------|---------------------------------------|--------------------|
//! | `POST /credentials/{id}`        | `CredentialsRequest`                  | 201, empty         |
//! | `GET /credentials/{id}`         | -                                     | 200, `SignedCredentials` |
//! | `POST /payments/{payment_id}`   | `PaymentRequest`                      | 200, empty         |
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ads::ConfirmationType;
use crate::error::{NetworkError, RedemptionError};
use crate::tokens::{BlindedToken, PublicKey, TokenPreimage, VerificationSignature};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IssuerRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl IssuerRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self, RedemptionError> {
        let body = serde_json::to_value(body)
            .map_err(|e| RedemptionError::Decode(format!("Failed to encode request: {}", e)))?;
        Ok(Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IssuerResponse {
    pub status: u16,
    pub body: String,
}

impl IssuerResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, RedemptionError> {
        serde_json::from_str(&self.body)
            .map_err(|e| RedemptionError::Decode(format!("Invalid response body: {}", e)))
    }
}

/// Carries requests to the issuer. Implementations report transport-level failures only;
/// HTTP statuses are classified by `check_status`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: IssuerRequest) -> Result<IssuerResponse, NetworkError>;
}

/// 2xx passes. 408, 429 and 5xx are transient; any other status is a permanent rejection.
pub fn check_status(response: &IssuerResponse) -> Result<(), RedemptionError> {
    match response.status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(RedemptionError::TransientNetwork(format!(
            "issuer returned {}",
            response.status
        ))),
        status => Err(RedemptionError::PermanentServer {
            status,
            message: response.body.chars().take(256).collect(),
        }),
    }
}

pub fn credentials_path(confirmation_id: &str) -> String {
    format!("/credentials/{}", confirmation_id)
}

pub fn payments_path(payment_id: &str) -> String {
    format!("/payments/{}", payment_id)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRequest {
    /// Empty for opted-out confirmations
    pub blinded_tokens: Vec<BlindedToken>,
    pub confirmation_type: ConfirmationType,
    pub creative_instance_id: String,
}

/// Raw response to `GET /credentials/{id}`; decoded by the redeemer so malformed
/// values surface as decode failures rather than transport errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedCredentials {
    pub signed_tokens: Vec<String>,
    /// Batch DLEQ proof over all blinded/signed pairs
    pub proof: String,
    pub public_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCredential {
    /// Token preimage `t`
    pub t: TokenPreimage,
    pub public_key: PublicKey,
    /// Verification-key MAC over the request payload
    pub signature: VerificationSignature,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub payment_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// JSON-encoded `PaymentPayload`; signatures cover these exact bytes
    pub payload: String,
    pub payment_credentials: Vec<PaymentCredential>,
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockFailure, MockIssuer};

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use super::*;
    use crate::tokens::{Base64Encoding, BatchDleqProof, SigningKey};
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    /// Scripted misbehaviour for the next request
    #[derive(Clone, Debug, PartialEq)]
    pub enum MockFailure {
        Status(u16),
        Timeout,
        /// Never answers; exercises the caller's deadline
        Hang,
        /// Signs with a key other than the advertised one
        WrongKey,
        MalformedBody,
    }

    #[derive(Default)]
    struct MockState {
        batches: HashMap<String, Vec<BlindedToken>>,
        spent: HashSet<Vec<u8>>,
        payments: HashMap<String, Vec<Vec<u8>>>,
        script: VecDeque<Option<MockFailure>>,
        requests: Vec<IssuerRequest>,
    }

    /// In-process issuer speaking the wire protocol above
    pub struct MockIssuer {
        signing_key: SigningKey,
        state: Mutex<MockState>,
    }

    impl MockIssuer {
        pub fn new(signing_key: SigningKey) -> Self {
            Self {
                signing_key,
                state: Mutex::new(MockState::default()),
            }
        }

        pub fn public_key(&self) -> PublicKey {
            self.signing_key.public_key()
        }

        pub fn fail_next(&self, failure: MockFailure) {
            self.lock().script.push_back(Some(failure));
        }

        /// Lets the next request through so a later scripted failure hits a later request
        pub fn pass_next(&self) {
            self.lock().script.push_back(None);
        }

        pub fn requests(&self) -> Vec<IssuerRequest> {
            self.lock().requests.clone()
        }

        pub fn count(&self, method: Method, path_prefix: &str) -> usize {
            self.lock()
                .requests
                .iter()
                .filter(|r| r.method == method && r.path.starts_with(path_prefix))
                .count()
        }

        pub fn spent_count(&self) -> usize {
            self.lock().spent.len()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        fn handle(&self, request: &IssuerRequest, failure: Option<MockFailure>) -> IssuerResponse {
            let wrong_key = failure == Some(MockFailure::WrongKey);
            let malformed = failure == Some(MockFailure::MalformedBody);
            let mut state = self.lock();

            if let Some(id) = request.path.strip_prefix("/credentials/") {
                match request.method {
                    Method::Post => {
                        let Some(body) = request.body.clone() else {
                            return IssuerResponse::new(400, "missing body");
                        };
                        let Ok(body) = serde_json::from_value::<CredentialsRequest>(body) else {
                            return IssuerResponse::new(400, "invalid body");
                        };
                        match state.batches.get(id).cloned() {
                            Some(existing) if existing != body.blinded_tokens => {
                                IssuerResponse::new(409, "confirmation already exists")
                            }
                            Some(_) => IssuerResponse::new(201, ""),
                            None => {
                                state.batches.insert(id.to_string(), body.blinded_tokens);
                                IssuerResponse::new(201, "")
                            }
                        }
                    }
                    Method::Get => {
                        let Some(blinded) = state.batches.get(id) else {
                            return IssuerResponse::new(404, "unknown confirmation");
                        };
                        if malformed {
                            return IssuerResponse::new(200, "{\"signedTokens\":[\"!!\"]}");
                        }
                        let key = if wrong_key {
                            SigningKey::random()
                        } else {
                            self.signing_key.clone()
                        };
                        let signed: Vec<_> = blinded.iter().map(|b| key.sign(b)).collect();
                        let proof = match BatchDleqProof::new(blinded, &signed, &key) {
                            Ok(proof) => proof,
                            Err(_) => return IssuerResponse::new(500, "proof failed"),
                        };
                        let body = SignedCredentials {
                            signed_tokens: signed.iter().map(|s| s.encode_base64()).collect(),
                            proof: proof.encode_base64(),
                            public_key: self.signing_key.public_key().encode_base64(),
                        };
                        IssuerResponse::new(200, serde_json::to_string(&body).unwrap_or_default())
                    }
                }
            } else if let Some(payment_id) = request
                .path
                .strip_prefix("/payments/")
                .filter(|_| request.method == Method::Post)
            {
                let Some(Ok(body)) = request
                    .body
                    .clone()
                    .map(serde_json::from_value::<PaymentRequest>)
                else {
                    return IssuerResponse::new(400, "invalid body");
                };

                let mut preimages = Vec::new();
                for credential in &body.payment_credentials {
                    if credential.public_key != self.signing_key.public_key() {
                        return IssuerResponse::new(400, "unknown public key");
                    }
                    let token = self.signing_key.rederive_unblinded_token(&credential.t);
                    let key = token.derive_verification_key();
                    if !key.verify(&credential.signature, body.payload.as_bytes()) {
                        return IssuerResponse::new(401, "bad signature");
                    }
                    preimages.push(credential.t.as_bytes().to_vec());
                }

                if let Some(accepted) = state.payments.get(payment_id) {
                    return if *accepted == preimages {
                        IssuerResponse::new(200, "")
                    } else {
                        IssuerResponse::new(409, "payment already exists")
                    };
                }
                let unique: HashSet<_> = preimages.iter().collect();
                if unique.len() != preimages.len() || preimages.iter().any(|p| state.spent.contains(p))
                {
                    return IssuerResponse::new(409, "token already spent");
                }
                state.spent.extend(preimages.iter().cloned());
                state.payments.insert(payment_id.to_string(), preimages);
                IssuerResponse::new(200, "")
            } else {
                IssuerResponse::new(404, "not found")
            }
        }
    }

    #[async_trait]
    impl Transport for MockIssuer {
        async fn send(&self, request: IssuerRequest) -> Result<IssuerResponse, NetworkError> {
            let failure = {
                let mut state = self.lock();
                state.requests.push(request.clone());
                state.script.pop_front().flatten()
            };

            match failure {
                Some(MockFailure::Status(status)) => {
                    Ok(IssuerResponse::new(status, "scripted failure"))
                }
                Some(MockFailure::Timeout) => Err(NetworkError::Timeout),
                Some(MockFailure::Hang) => {
                    std::future::pending::<()>().await;
                    Err(NetworkError::Timeout)
                }
                other => Ok(self.handle(&request, other)),
            }
        }
    }
}
