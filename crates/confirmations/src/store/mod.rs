//! Durable state behind the service: both redemption queues, the unblinded payment token
//! pool, the ad event log, transaction history and the archive.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::ads::{AdEvent, AdEventTally};
use crate::confirmation::Confirmation;
use crate::error::StoreError;
use crate::payout::{PaymentBatch, PaymentToken};
use crate::queue::QueueEntry;
use crate::transactions::Transaction;

mod file;
mod memory;

pub use file::JsonFile;
pub use memory::InMemory;

pub type MemoryStore = StateStore<InMemory>;
pub type JsonFileStore = StateStore<JsonFile>;

/// Most recent archived entries kept per queue
pub const ARCHIVE_LIMIT: usize = 1000;

#[async_trait]
pub trait ConfirmationStore: Send + Sync {
    /// Inserts or replaces by id
    async fn save_confirmation(&self, entry: &QueueEntry<Confirmation>) -> Result<(), StoreError>;
    async fn load_confirmations(&self) -> Result<Vec<QueueEntry<Confirmation>>, StoreError>;
    /// Removes the entry from the active set and appends it to the archive in one write
    async fn archive_confirmation(&self, entry: &QueueEntry<Confirmation>) -> Result<(), StoreError>;
    async fn archived_confirmations(&self) -> Result<Vec<QueueEntry<Confirmation>>, StoreError>;

    async fn save_payment(&self, entry: &QueueEntry<PaymentBatch>) -> Result<(), StoreError>;
    async fn load_payments(&self) -> Result<Vec<QueueEntry<PaymentBatch>>, StoreError>;
    async fn archive_payment(&self, entry: &QueueEntry<PaymentBatch>) -> Result<(), StoreError>;

    /// Adds a token to the pool unless an equal token is already pooled
    async fn save_token(&self, token: PaymentToken) -> Result<(), StoreError>;
    /// Removes and returns one token; a token is never handed out twice
    async fn take_token(&self) -> Result<Option<PaymentToken>, StoreError>;
    async fn take_all_tokens(&self) -> Result<Vec<PaymentToken>, StoreError>;
    async fn token_count(&self) -> Result<usize, StoreError>;

    async fn append_ad_event(&self, event: &AdEvent) -> Result<(), StoreError>;
    async fn ad_events(&self) -> Result<Vec<AdEvent>, StoreError>;
    /// Folds events created before `before` into per-creative tallies. Returns how many
    /// events were folded.
    async fn compact_ad_events(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
    async fn ad_event_tallies(&self) -> Result<Vec<AdEventTally>, StoreError>;

    /// Pools the tokens of one redemption and appends its transaction in one write. Returns
    /// `false` without changing anything when the transaction id is already recorded.
    async fn record_redemption(
        &self,
        tokens: Vec<PaymentToken>,
        transaction: &Transaction,
    ) -> Result<bool, StoreError>;

    async fn transactions(&self) -> Result<Vec<Transaction>, StoreError>;
    async fn mark_transactions_paid(&self, ids: &[String]) -> Result<(), StoreError>;

    async fn set_next_payout_at(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn next_payout_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}

/// Everything the store holds, serialized as one document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreState {
    pub confirmations: Vec<QueueEntry<Confirmation>>,
    pub payments: Vec<QueueEntry<PaymentBatch>>,
    pub payment_tokens: Vec<PaymentToken>,
    pub ad_events: Vec<AdEvent>,
    pub ad_event_tallies: Vec<AdEventTally>,
    pub transactions: Vec<Transaction>,
    pub archived_confirmations: Vec<QueueEntry<Confirmation>>,
    pub archived_payments: Vec<QueueEntry<PaymentBatch>>,
    pub next_payout_at: Option<DateTime<Utc>>,
}

fn upsert<T: Clone>(entries: &mut Vec<QueueEntry<T>>, entry: &QueueEntry<T>) {
    match entries.iter_mut().find(|existing| existing.id == entry.id) {
        Some(existing) => *existing = entry.clone(),
        None => entries.push(entry.clone()),
    }
}

fn archive<T: Clone>(
    active: &mut Vec<QueueEntry<T>>,
    archived: &mut Vec<QueueEntry<T>>,
    entry: &QueueEntry<T>,
) {
    active.retain(|existing| existing.id != entry.id);
    archived.push(entry.clone());
    if archived.len() > ARCHIVE_LIMIT {
        let excess = archived.len() - ARCHIVE_LIMIT;
        archived.drain(..excess);
    }
}

fn pool_token(pool: &mut Vec<PaymentToken>, token: PaymentToken) {
    if !pool.contains(&token) {
        pool.push(token);
    }
}

/// Where a state change goes after it is applied in memory
pub trait Persistence: Send + Sync {
    fn persist(&self, state: &StoreState) -> Result<(), StoreError>;
}

/// `ConfirmationStore` over an in-memory `StoreState`, flushed through `P` on every
/// mutation. Mutations are serialized by the lock.
pub struct StateStore<P> {
    state: Mutex<StoreState>,
    persistence: P,
}

impl<P: Persistence> StateStore<P> {
    fn with_state(state: StoreState, persistence: P) -> Self {
        Self {
            state: Mutex::new(state),
            persistence,
        }
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> Result<R, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let result = f(&mut next);
        // only commit in memory what made it to disk
        self.persistence.persist(&next)?;
        *state = next;
        Ok(result)
    }

    async fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl<P: Persistence> ConfirmationStore for StateStore<P> {
    async fn save_confirmation(&self, entry: &QueueEntry<Confirmation>) -> Result<(), StoreError> {
        self.mutate(|state| upsert(&mut state.confirmations, entry)).await
    }

    async fn load_confirmations(&self) -> Result<Vec<QueueEntry<Confirmation>>, StoreError> {
        Ok(self.read(|state| state.confirmations.clone()).await)
    }

    async fn archive_confirmation(&self, entry: &QueueEntry<Confirmation>) -> Result<(), StoreError> {
        self.mutate(|state| {
            archive(
                &mut state.confirmations,
                &mut state.archived_confirmations,
                entry,
            )
        })
        .await
    }

    async fn archived_confirmations(&self) -> Result<Vec<QueueEntry<Confirmation>>, StoreError> {
        Ok(self.read(|state| state.archived_confirmations.clone()).await)
    }

    async fn save_payment(&self, entry: &QueueEntry<PaymentBatch>) -> Result<(), StoreError> {
        self.mutate(|state| upsert(&mut state.payments, entry)).await
    }

    async fn load_payments(&self) -> Result<Vec<QueueEntry<PaymentBatch>>, StoreError> {
        Ok(self.read(|state| state.payments.clone()).await)
    }

    async fn archive_payment(&self, entry: &QueueEntry<PaymentBatch>) -> Result<(), StoreError> {
        self.mutate(|state| archive(&mut state.payments, &mut state.archived_payments, entry))
            .await
    }

    async fn save_token(&self, token: PaymentToken) -> Result<(), StoreError> {
        self.mutate(|state| pool_token(&mut state.payment_tokens, token)).await
    }

    async fn take_token(&self) -> Result<Option<PaymentToken>, StoreError> {
        self.mutate(|state| {
            if state.payment_tokens.is_empty() {
                None
            } else {
                Some(state.payment_tokens.remove(0))
            }
        })
        .await
    }

    async fn take_all_tokens(&self) -> Result<Vec<PaymentToken>, StoreError> {
        self.mutate(|state| std::mem::take(&mut state.payment_tokens)).await
    }

    async fn token_count(&self) -> Result<usize, StoreError> {
        Ok(self.read(|state| state.payment_tokens.len()).await)
    }

    async fn append_ad_event(&self, event: &AdEvent) -> Result<(), StoreError> {
        self.mutate(|state| state.ad_events.push(event.clone())).await
    }

    async fn ad_events(&self) -> Result<Vec<AdEvent>, StoreError> {
        Ok(self.read(|state| state.ad_events.clone()).await)
    }

    async fn compact_ad_events(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale = self
            .read(|state| state.ad_events.iter().any(|event| event.created_at < before))
            .await;
        if !stale {
            return Ok(0);
        }

        self.mutate(|state| {
            let (folded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.ad_events)
                .into_iter()
                .partition(|event| event.created_at < before);
            state.ad_events = kept;
            for event in &folded {
                match state.ad_event_tallies.iter_mut().find(|tally| tally.matches(event)) {
                    Some(tally) => tally.count += 1,
                    None => state.ad_event_tallies.push(AdEventTally::from(event)),
                }
            }
            folded.len()
        })
        .await
    }

    async fn ad_event_tallies(&self) -> Result<Vec<AdEventTally>, StoreError> {
        Ok(self.read(|state| state.ad_event_tallies.clone()).await)
    }

    async fn record_redemption(
        &self,
        tokens: Vec<PaymentToken>,
        transaction: &Transaction,
    ) -> Result<bool, StoreError> {
        self.mutate(|state| {
            if state.transactions.iter().any(|tx| tx.id == transaction.id) {
                return false;
            }
            for token in tokens {
                pool_token(&mut state.payment_tokens, token);
            }
            state.transactions.push(transaction.clone());
            true
        })
        .await
    }

    async fn transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        Ok(self.read(|state| state.transactions.clone()).await)
    }

    async fn mark_transactions_paid(&self, ids: &[String]) -> Result<(), StoreError> {
        self.mutate(|state| {
            for tx in state.transactions.iter_mut() {
                if ids.contains(&tx.id) {
                    tx.paid_out = true;
                }
            }
        })
        .await
    }

    async fn set_next_payout_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(|state| state.next_payout_at = Some(at)).await
    }

    async fn next_payout_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.read(|state| state.next_payout_at).await)
    }
}
