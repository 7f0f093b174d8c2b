//! Spending pooled unblinded tokens at the issuer.
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{NetworkError, RedemptionError};
use crate::tokens::{PublicKey, UnblindedToken};
use crate::transport::{
    check_status, payments_path, IssuerRequest, PaymentCredential, PaymentPayload,
    PaymentRequest, Transport,
};

/// Payout timer delay once the window has already passed
pub const OVERDUE_PAYOUT_DELAY: Duration = Duration::from_secs(60);

/// An unblinded token in the pool, with the issuer key that signed it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentToken {
    pub unblinded_token: UnblindedToken,
    pub public_key: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentBatch {
    pub payment_id: String,
    pub tokens: Vec<PaymentToken>,
    /// Transactions settled by this payout
    pub transaction_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Randomised point inside `[now + delay/2, next_payout_at]` for the payout timer, so
/// payouts from many clients do not line up.
pub fn payout_timer(now: DateTime<Utc>, next_payout_at: DateTime<Utc>) -> DateTime<Utc> {
    let Ok(delay) = (next_payout_at - now).to_std() else {
        return now + crate::queue::to_chrono(OVERDUE_PAYOUT_DELAY);
    };
    if delay.is_zero() {
        return now + crate::queue::to_chrono(OVERDUE_PAYOUT_DELAY);
    }

    let secs = delay.as_secs_f64();
    let sampled = rand::thread_rng().gen_range(secs / 2.0..=secs);
    now + crate::queue::to_chrono(Duration::from_secs_f64(sampled))
}

pub fn payment_request(batch: &PaymentBatch) -> Result<PaymentRequest, RedemptionError> {
    let payload = serde_json::to_string(&PaymentPayload {
        payment_id: batch.payment_id.clone(),
    })
    .map_err(|e| RedemptionError::Decode(format!("Failed to encode payload: {}", e)))?;

    let payment_credentials = batch
        .tokens
        .iter()
        .map(|token| PaymentCredential {
            t: token.unblinded_token.preimage().clone(),
            public_key: token.public_key,
            signature: token
                .unblinded_token
                .derive_verification_key()
                .sign(payload.as_bytes()),
        })
        .collect();

    Ok(PaymentRequest {
        payload,
        payment_credentials,
    })
}

/// Submits one payment batch per attempt
pub struct PaymentRedeemer {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl PaymentRedeemer {
    pub fn new(transport: Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self {
            transport,
            request_timeout,
        }
    }

    pub async fn redeem(&self, batch: &PaymentBatch) -> Result<(), RedemptionError> {
        let request = IssuerRequest::post(payments_path(&batch.payment_id), &payment_request(batch)?)?;

        let response = match tokio::time::timeout(self.request_timeout, self.transport.send(request)).await {
            Ok(response) => response?,
            Err(_) => {
                debug!("Payment {} timed out", batch.payment_id);
                return Err(NetworkError::Timeout.into());
            }
        };
        check_status(&response)?;

        info!(
            "Redeemed {} payment tokens in {}",
            batch.tokens.len(),
            batch.payment_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{SigningKey, Token};
    use crate::transport::{MockFailure, MockIssuer};

    fn batch(key: &SigningKey, count: usize) -> PaymentBatch {
        let tokens = (0..count)
            .map(|_| {
                let token = Token::random();
                let (blinded, _) = token.blind();
                PaymentToken {
                    unblinded_token: token.unblind(&key.sign(&blinded)),
                    public_key: key.public_key(),
                }
            })
            .collect();
        PaymentBatch {
            payment_id: uuid::Uuid::new_v4().to_string(),
            tokens,
            transaction_ids: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_payout_timer_within_second_half_of_window() {
        let now = Utc::now();
        let next = now + chrono::Duration::hours(24);
        for _ in 0..50 {
            let at = payout_timer(now, next);
            assert!(at >= now + chrono::Duration::hours(12) && at <= next);
        }
    }

    #[test]
    fn test_overdue_payout_runs_after_one_minute() {
        let now = Utc::now();
        assert_eq!(
            payout_timer(now, now - chrono::Duration::days(3)),
            now + chrono::Duration::minutes(1)
        );
    }

    #[test]
    fn test_signatures_verify_under_issuer_rederived_keys() {
        let key = SigningKey::random();
        let request = payment_request(&batch(&key, 3)).unwrap();

        for credential in &request.payment_credentials {
            let rederived = key.rederive_unblinded_token(&credential.t);
            assert!(rederived
                .derive_verification_key()
                .verify(&credential.signature, request.payload.as_bytes()));
        }
    }

    #[tokio::test]
    async fn test_double_spend_is_permanent() {
        let key = SigningKey::random();
        let issuer = Arc::new(MockIssuer::new(key.clone()));
        let redeemer = PaymentRedeemer::new(issuer.clone(), Duration::from_secs(5));
        let mut batch = batch(&key, 2);

        redeemer.redeem(&batch).await.unwrap();
        assert_eq!(issuer.spent_count(), 2);

        batch.payment_id = "replayed".into();
        let err = redeemer.redeem(&batch).await.unwrap_err();
        assert!(matches!(err, RedemptionError::PermanentServer { status: 409, .. }));
    }

    #[tokio::test]
    async fn test_resent_payment_is_accepted_once() {
        let key = SigningKey::random();
        let issuer = Arc::new(MockIssuer::new(key.clone()));
        let redeemer = PaymentRedeemer::new(issuer.clone(), Duration::from_secs(5));
        let batch = batch(&key, 2);

        redeemer.redeem(&batch).await.unwrap();
        redeemer.redeem(&batch).await.unwrap();
        assert_eq!(issuer.spent_count(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_is_transient() {
        let key = SigningKey::random();
        let issuer = Arc::new(MockIssuer::new(key.clone()));
        issuer.fail_next(MockFailure::Timeout);

        let err = PaymentRedeemer::new(issuer, Duration::from_secs(5))
            .redeem(&batch(&key, 1))
            .await
            .unwrap_err();
        assert!(err.should_retry() && err.should_backoff());
    }
}
