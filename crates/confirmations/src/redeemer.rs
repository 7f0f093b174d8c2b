use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::confirmation::{Confirmation, ConfirmationToken};
use crate::error::{NetworkError, RedemptionError};
use crate::events::{Notifier, RedemptionEvent};
use crate::issuers::Issuers;
use crate::tokens::{Base64Encoding, BatchDleqProof, PublicKey, SignedToken, UnblindedToken};
use crate::transport::{
    check_status, credentials_path, CredentialsRequest, IssuerRequest, SignedCredentials,
    Transport,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Redemption {
    /// The issuer counted the event; there is nothing to unblind
    OptedOut,
    OptedIn {
        unblinded_tokens: Vec<UnblindedToken>,
        public_key: PublicKey,
        estimated_redemption_value: f64,
    },
}

/// Runs one network attempt for a confirmation: create it at the issuer unless that
/// already happened, then fetch, verify and unblind the signed token.
pub struct Redeemer {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    request_timeout: Duration,
}

impl Redeemer {
    pub fn new(
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            notifier,
            request_timeout,
        }
    }

    /// The whole attempt shares one deadline. Progress made before it fires (such as
    /// `was_created`) is kept in `confirmation`.
    pub async fn redeem(
        &self,
        confirmation: &mut Confirmation,
        issuers: &Issuers,
    ) -> Result<Redemption, RedemptionError> {
        match tokio::time::timeout(self.request_timeout, self.attempt(confirmation, issuers)).await
        {
            Ok(result) => result,
            Err(_) => {
                debug!("Redemption of {} timed out", confirmation.id);
                Err(NetworkError::Timeout.into())
            }
        }
    }

    async fn attempt(
        &self,
        confirmation: &mut Confirmation,
        issuers: &Issuers,
    ) -> Result<Redemption, RedemptionError> {
        if confirmation.is_opted_in() && issuers.is_empty() {
            return Err(RedemptionError::NoIssuers);
        }

        if !confirmation.was_created {
            self.create(confirmation).await?;
        }

        let Some(token) = confirmation.token.clone() else {
            return Ok(Redemption::OptedOut);
        };

        let result = self.fetch(&confirmation.request_id, &token, issuers).await;
        if let Err(RedemptionError::CredentialsPending { .. }) = result {
            confirmation.was_created = false;
        }
        result
    }

    async fn create(&self, confirmation: &mut Confirmation) -> Result<(), RedemptionError> {
        let body = CredentialsRequest {
            blinded_tokens: confirmation.blinded_tokens(),
            confirmation_type: confirmation.confirmation_type,
            creative_instance_id: confirmation.creative_instance_id.clone(),
        };
        let request = IssuerRequest::post(credentials_path(&confirmation.request_id), &body)?;

        let result = match self.transport.send(request).await {
            Ok(response) => check_status(&response),
            Err(err) => Err(err.into()),
        };

        if let Err(err) = result {
            self.notifier.notify(RedemptionEvent::FailedToSend {
                id: confirmation.id.clone(),
                error: err.to_string(),
            });
            return Err(err);
        }

        confirmation.was_created = true;
        info!(
            "Sent {} confirmation {}",
            confirmation.confirmation_type, confirmation.id
        );
        self.notifier.notify(RedemptionEvent::Sent {
            id: confirmation.id.clone(),
            confirmation_type: confirmation.confirmation_type,
        });
        Ok(())
    }

    async fn fetch(
        &self,
        id: &str,
        token: &ConfirmationToken,
        issuers: &Issuers,
    ) -> Result<Redemption, RedemptionError> {
        let response = self.transport.send(IssuerRequest::get(credentials_path(id))).await?;
        if matches!(response.status, 202 | 404) {
            debug!("Issuer has not created credentials for {} yet", id);
            return Err(RedemptionError::CredentialsPending {
                status: response.status,
            });
        }
        check_status(&response)?;
        let body: SignedCredentials = response.json()?;

        let public_key = PublicKey::decode_base64(&body.public_key)?;
        if !issuers.is_valid_public_key(&public_key, self.clock.now()) {
            debug!("Response public key for {} is not a current issuer", id);
            return Err(RedemptionError::NoIssuers);
        }

        let signed_tokens = body
            .signed_tokens
            .iter()
            .map(|encoded| SignedToken::decode_base64(encoded))
            .collect::<Result<Vec<_>, _>>()?;
        let proof = BatchDleqProof::decode_base64(&body.proof)?;

        let unblinded_tokens = proof.verify_and_unblind(
            std::slice::from_ref(&token.token),
            std::slice::from_ref(&token.blinded_token),
            &signed_tokens,
            &public_key,
        )?;

        Ok(Redemption::OptedIn {
            unblinded_tokens,
            public_key,
            estimated_redemption_value: issuers.estimated_redemption_value(&public_key),
        })
    }
}
