use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::ads::{AdEvent, ConfirmationType};
use crate::issuers::Issuers;
use crate::tokens::{BlindedToken, PublicKey, Token};

/// Source of fresh client tokens
pub trait TokenGenerator: Send + Sync {
    fn generate(&self, count: usize) -> Vec<Token>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self, count: usize) -> Vec<Token> {
        (0..count).map(|_| Token::random()).collect()
    }
}

/// The token half of an opted-in confirmation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationToken {
    pub token: Token,
    pub blinded_token: BlindedToken,
}

impl ConfirmationToken {
    pub fn new(token: Token) -> Self {
        let (blinded_token, _) = token.blind();
        Self {
            token,
            blinded_token,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub id: String,
    /// Batch id the issuer knows this request by; replaced on reblind
    pub request_id: String,
    pub creative_instance_id: String,
    pub confirmation_type: ConfirmationType,
    /// `None` when rewards are disabled; the issuer then only counts the event
    pub token: Option<ConfirmationToken>,
    /// Issuer key current at creation, if any issuer was known
    pub issuer_public_key: Option<PublicKey>,
    /// Set once the issuer accepted the request; a retry then only fetches the result
    pub was_created: bool,
    pub created_at: DateTime<Utc>,
}

impl Confirmation {
    pub fn is_opted_in(&self) -> bool {
        self.token.is_some()
    }

    pub fn blinded_tokens(&self) -> Vec<BlindedToken> {
        self.token
            .iter()
            .map(|token| token.blinded_token)
            .collect()
    }
}

#[derive(Clone)]
pub struct ConfirmationBuilder {
    generator: Arc<dyn TokenGenerator>,
    rewards_enabled: bool,
}

impl ConfirmationBuilder {
    pub fn new(generator: Arc<dyn TokenGenerator>, rewards_enabled: bool) -> Self {
        Self {
            generator,
            rewards_enabled,
        }
    }

    pub fn build(&self, event: &AdEvent, issuers: &Issuers, now: DateTime<Utc>) -> Confirmation {
        let token = self.rewards_enabled.then(|| ConfirmationToken::new(self.next_token()));
        let id = Uuid::new_v4().to_string();
        let confirmation = Confirmation {
            request_id: id.clone(),
            id,
            creative_instance_id: event.creative_instance_id.clone(),
            confirmation_type: event.confirmation_type,
            token,
            issuer_public_key: issuers.current(now).map(|issuer| issuer.public_key),
            was_created: false,
            created_at: now,
        };

        debug!(
            "Built {} confirmation {} for {} (opted in: {})",
            confirmation.confirmation_type,
            confirmation.id,
            confirmation.creative_instance_id,
            confirmation.is_opted_in()
        );
        confirmation
    }

    /// Replaces the token after the issuer's proof failed to verify, so the retry starts
    /// from a fresh request.
    pub fn reblind(&self, confirmation: &mut Confirmation) {
        if confirmation.token.is_some() {
            confirmation.token = Some(ConfirmationToken::new(self.next_token()));
        }
        confirmation.request_id = Uuid::new_v4().to_string();
        confirmation.was_created = false;
    }

    fn next_token(&self) -> Token {
        self.generator
            .generate(1)
            .into_iter()
            .next()
            .unwrap_or_else(Token::random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::CreativeAd;
    use crate::issuers::Issuer;
    use crate::tokens::SigningKey;
    use chrono::Duration;

    struct SequentialTokens(std::sync::atomic::AtomicU8);

    impl TokenGenerator for SequentialTokens {
        fn generate(&self, count: usize) -> Vec<Token> {
            (0..count)
                .map(|_| {
                    let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Token::from_secret([n; 32])
                })
                .collect()
        }
    }

    fn builder(rewards_enabled: bool) -> ConfirmationBuilder {
        ConfirmationBuilder::new(
            Arc::new(SequentialTokens(std::sync::atomic::AtomicU8::new(1))),
            rewards_enabled,
        )
    }

    fn event(now: DateTime<Utc>) -> AdEvent {
        AdEvent::new(
            &CreativeAd::new("creative-1", "set-1", "campaign-1"),
            ConfirmationType::Viewed,
            now,
        )
    }

    #[test]
    fn test_opted_in_confirmation_carries_blinded_token() {
        let now = Utc::now();
        let issuer = Issuer {
            public_key: SigningKey::random().public_key(),
            name: "0.05BAT".into(),
            valid_from: now - Duration::days(1),
            valid_until: now + Duration::days(1),
        };
        let confirmation = builder(true).build(&event(now), &Issuers::new(vec![issuer.clone()]), now);

        let token = confirmation.token.as_ref().unwrap();
        assert_eq!(token.blinded_token, Token::from_secret([1; 32]).blind().0);
        assert_eq!(confirmation.issuer_public_key, Some(issuer.public_key));
        assert_eq!(confirmation.creative_instance_id, "creative-1");
        assert_eq!(confirmation.request_id, confirmation.id);
        assert!(!confirmation.was_created);
    }

    #[test]
    fn test_opted_out_confirmation_has_no_token() {
        let now = Utc::now();
        let confirmation = builder(false).build(&event(now), &Issuers::default(), now);

        assert!(!confirmation.is_opted_in());
        assert!(confirmation.blinded_tokens().is_empty());
        assert_eq!(confirmation.issuer_public_key, None);
    }

    #[test]
    fn test_reblind_uses_fresh_token() {
        let now = Utc::now();
        let builder = builder(true);
        let mut confirmation = builder.build(&event(now), &Issuers::default(), now);
        confirmation.was_created = true;
        let before = confirmation.blinded_tokens();

        builder.reblind(&mut confirmation);

        assert_ne!(confirmation.blinded_tokens(), before);
        assert_ne!(confirmation.request_id, confirmation.id);
        assert!(!confirmation.was_created);
    }

    #[test]
    fn test_confirmation_serde_round_trip() {
        let now = Utc::now();
        let confirmation = builder(true).build(&event(now), &Issuers::default(), now);
        let json = serde_json::to_string(&confirmation).unwrap();

        assert!(json.contains("\"confirmationType\":\"view\""));
        let restored: Confirmation = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, confirmation);
    }
}
