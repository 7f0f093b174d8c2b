use super::{Persistence, StateStore, StoreState};
use crate::error::StoreError;

/// No-op persistence; state lives as long as the store
#[derive(Clone, Copy, Debug, Default)]
pub struct InMemory;

impl Persistence for InMemory {
    fn persist(&self, _state: &StoreState) -> Result<(), StoreError> {
        Ok(())
    }
}

impl StateStore<InMemory> {
    pub fn new() -> Self {
        Self::with_state(StoreState::default(), InMemory)
    }
}

impl Default for StateStore<InMemory> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ads::{AdEvent, ConfirmationType, CreativeAd};
    use crate::payout::PaymentToken;
    use crate::queue::{QueueEntry, RedemptionState};
    use crate::store::{ConfirmationStore, MemoryStore, ARCHIVE_LIMIT};
    use crate::tokens::{SigningKey, Token};
    use crate::transactions::Transaction;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn payment_token(key: &SigningKey) -> PaymentToken {
        let token = Token::random();
        let (blinded, _) = token.blind();
        PaymentToken {
            unblinded_token: token.unblind(&key.sign(&blinded)),
            public_key: key.public_key(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_take_token_hands_out_each_token_once() {
        let store = Arc::new(MemoryStore::new());
        let key = SigningKey::random();
        for _ in 0..20 {
            store.save_token(payment_token(&key)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.take_token().await.unwrap() }));
        }

        let mut taken = Vec::new();
        for handle in handles {
            if let Some(token) = handle.await.unwrap() {
                taken.push(token);
            }
        }

        assert_eq!(taken.len(), 20);
        for (i, a) in taken.iter().enumerate() {
            assert!(taken[i + 1..].iter().all(|b| b != a));
        }
        assert_eq!(store.token_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ad_events_are_append_only_in_order() {
        let store = MemoryStore::new();
        let ad = CreativeAd::new("c", "s", "p");
        let now = Utc::now();
        store.append_ad_event(&AdEvent::new(&ad, ConfirmationType::Served, now)).await.unwrap();
        store.append_ad_event(&AdEvent::new(&ad, ConfirmationType::Viewed, now)).await.unwrap();

        let kinds: Vec<_> = store
            .ad_events()
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.confirmation_type)
            .collect();
        assert_eq!(kinds, vec![ConfirmationType::Served, ConfirmationType::Viewed]);
    }

    fn transaction(id: &str) -> Transaction {
        Transaction {
            id: id.into(),
            created_at: Utc::now(),
            estimated_redemption_value: 0.05,
            confirmation_type: ConfirmationType::Viewed,
            paid_out: false,
        }
    }

    #[tokio::test]
    async fn test_redemption_is_recorded_once() {
        let store = MemoryStore::new();
        let key = SigningKey::random();
        let token = payment_token(&key);

        assert!(store
            .record_redemption(vec![token.clone()], &transaction("confirmation-1"))
            .await
            .unwrap());
        assert!(!store
            .record_redemption(vec![token.clone()], &transaction("confirmation-1"))
            .await
            .unwrap());

        assert_eq!(store.token_count().await.unwrap(), 1);
        assert_eq!(store.transactions().await.unwrap().len(), 1);

        // a token already pooled is never pooled twice
        store.save_token(token).await.unwrap();
        assert_eq!(store.token_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compaction_folds_old_events_into_tallies() {
        let store = MemoryStore::new();
        let ad = CreativeAd::new("c", "s", "p");
        let now = Utc::now();
        for age in [40, 35, 1] {
            store
                .append_ad_event(&AdEvent::new(&ad, ConfirmationType::Served, now - Duration::days(age)))
                .await
                .unwrap();
        }
        store
            .append_ad_event(&AdEvent::new(&ad, ConfirmationType::Viewed, now - Duration::days(30)))
            .await
            .unwrap();

        let cutoff = now - Duration::days(28);
        assert_eq!(store.compact_ad_events(cutoff).await.unwrap(), 3);
        assert_eq!(store.compact_ad_events(cutoff).await.unwrap(), 0);

        assert_eq!(store.ad_events().await.unwrap().len(), 1);
        let tallies = store.ad_event_tallies().await.unwrap();
        assert_eq!(tallies.len(), 2);
        let served = tallies
            .iter()
            .find(|tally| tally.confirmation_type == ConfirmationType::Served)
            .unwrap();
        assert_eq!(served.count, 2);
    }

    #[tokio::test]
    async fn test_archive_keeps_most_recent_entries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for n in 0..ARCHIVE_LIMIT + 5 {
            let entry = QueueEntry {
                id: n.to_string(),
                item: crate::payout::PaymentBatch {
                    payment_id: n.to_string(),
                    tokens: Vec::new(),
                    transaction_ids: Vec::new(),
                    created_at: now,
                },
                state: RedemptionState::Redeemed,
                retry_count: 0,
                next_retry_at: now,
                enqueued_at: now,
                sequence: n as u64,
                cancel_requested: false,
                last_error: None,
            };
            store.archive_payment(&entry).await.unwrap();
        }

        let archived = store.snapshot().await.archived_payments;
        assert_eq!(archived.len(), ARCHIVE_LIMIT);
        assert_eq!(archived[0].id, "5");
    }
}
