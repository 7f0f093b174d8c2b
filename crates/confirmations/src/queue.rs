//! Durable-state machine shared by the confirmation and payment queues.
//!
//! ```text
//! Queued -> Redeeming -> Redeemed
//!              |
//!              +-> RetryScheduled -> Redeeming (loop)
//!              +-> Exhausted
//! Queued | RetryScheduled -> Cancelled
//! ```
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::RedemptionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionState {
    Queued,
    Redeeming,
    RetryScheduled,
    Redeemed,
    Exhausted,
    Cancelled,
}

impl RedemptionState {
    pub fn is_pending(&self) -> bool {
        matches!(self, RedemptionState::Queued | RedemptionState::RetryScheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RedemptionState::Redeemed | RedemptionState::Exhausted | RedemptionState::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry<T> {
    pub id: String,
    pub item: T,
    pub state: RedemptionState,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion order; breaks ties between entries due at the same instant
    pub sequence: u64,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Result of settling an in-flight entry
#[derive(Clone, Debug, PartialEq)]
pub enum Settlement<T> {
    Redeemed(QueueEntry<T>),
    Retry(QueueEntry<T>),
    Exhausted(QueueEntry<T>),
    /// Cancelled while in flight; the attempt's outcome is dropped
    Discarded(QueueEntry<T>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum CancelOutcome<T> {
    Cancelled(QueueEntry<T>),
    /// In flight; the entry is discarded when the attempt settles
    Deferred,
    NotFound,
}

pub struct RedemptionQueue<T> {
    entries: Vec<QueueEntry<T>>,
    next_sequence: u64,
    backoff: Backoff,
    max_retries: u32,
}

impl<T: Clone> RedemptionQueue<T> {
    pub fn new(backoff: Backoff, max_retries: u32) -> Self {
        Self {
            entries: Vec::new(),
            next_sequence: 0,
            backoff,
            max_retries,
        }
    }

    /// Rebuilds the queue from persisted entries. Anything left `Redeeming` by a crash goes
    /// back to `Queued` for another attempt.
    pub fn restore(backoff: Backoff, max_retries: u32, entries: Vec<QueueEntry<T>>) -> Self {
        let mut queue = Self::new(backoff, max_retries);

        for mut entry in entries {
            if entry.state.is_terminal() {
                continue;
            }
            if entry.state == RedemptionState::Redeeming {
                warn!("Recovering {} interrupted mid-redemption", entry.id);
                entry.state = RedemptionState::Queued;
            }
            entry.cancel_requested = false;
            queue.next_sequence = queue.next_sequence.max(entry.sequence + 1);
            queue.entries.push(entry);
        }

        queue.entries.sort_by_key(|entry| entry.sequence);
        info!("Restored {} queued entries", queue.entries.len());
        queue
    }

    pub fn push(&mut self, id: String, item: T, now: DateTime<Utc>) -> QueueEntry<T> {
        let entry = QueueEntry {
            id,
            item,
            state: RedemptionState::Queued,
            retry_count: 0,
            next_retry_at: now,
            enqueued_at: now,
            sequence: self.next_sequence,
            cancel_requested: false,
            last_error: None,
        };
        self.next_sequence += 1;
        self.entries.push(entry.clone());
        entry
    }

    /// Earliest pending entry whose retry time has passed; FIFO among equal times.
    pub fn next_due(&self, now: DateTime<Utc>) -> Option<&QueueEntry<T>> {
        self.entries
            .iter()
            .filter(|entry| entry.state.is_pending() && entry.next_retry_at <= now)
            .min_by_key(|entry| (entry.next_retry_at, entry.sequence))
    }

    /// Ids of every due entry in processing order
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<&QueueEntry<T>> = self
            .entries
            .iter()
            .filter(|entry| entry.state.is_pending() && entry.next_retry_at <= now)
            .collect();
        due.sort_by_key(|entry| (entry.next_retry_at, entry.sequence));
        due.into_iter().map(|entry| entry.id.clone()).collect()
    }

    /// Earliest time anything pending becomes due
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .filter(|entry| entry.state.is_pending())
            .map(|entry| entry.next_retry_at)
            .min()
    }

    /// Marks a pending entry as in flight. Returns `None` if it is not pending, which keeps
    /// each entry to at most one concurrent attempt.
    pub fn begin(&mut self, id: &str) -> Option<QueueEntry<T>> {
        let entry = self.entries.iter_mut().find(|entry| entry.id == id)?;
        if !entry.state.is_pending() {
            return None;
        }
        entry.state = RedemptionState::Redeeming;
        Some(entry.clone())
    }

    /// Stores changes the attempt made to the item (e.g. `was_created`)
    pub fn update_item(&mut self, id: &str, item: T) -> Option<QueueEntry<T>> {
        let entry = self.entries.iter_mut().find(|entry| entry.id == id)?;
        entry.item = item;
        Some(entry.clone())
    }

    /// Applies the outcome of an attempt to an in-flight entry. Terminal outcomes remove
    /// the entry from the queue.
    pub fn settle(
        &mut self,
        id: &str,
        outcome: Result<(), &RedemptionError>,
        now: DateTime<Utc>,
    ) -> Option<Settlement<T>> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == id && entry.state == RedemptionState::Redeeming)?;

        if self.entries[index].cancel_requested {
            let mut entry = self.entries.remove(index);
            entry.state = RedemptionState::Cancelled;
            debug!("Discarding result for cancelled {}", entry.id);
            return Some(Settlement::Discarded(entry));
        }

        let err = match outcome {
            Ok(()) => {
                let mut entry = self.entries.remove(index);
                entry.state = RedemptionState::Redeemed;
                entry.last_error = None;
                return Some(Settlement::Redeemed(entry));
            }
            Err(err) => err,
        };

        let entry = &mut self.entries[index];
        entry.last_error = Some(err.to_string());

        if !err.should_retry() || entry.retry_count >= self.max_retries {
            let mut entry = self.entries.remove(index);
            entry.state = RedemptionState::Exhausted;
            warn!(
                "Giving up on {} after {} retries: {}",
                entry.id, entry.retry_count, err
            );
            return Some(Settlement::Exhausted(entry));
        }

        entry.retry_count += 1;
        let delay = if err.should_backoff() {
            self.backoff.delay(entry.retry_count)
        } else {
            std::time::Duration::ZERO
        };
        entry.next_retry_at = now + to_chrono(delay);
        entry.state = RedemptionState::RetryScheduled;
        debug!(
            "Retry {} for {} in {:?}",
            entry.retry_count, entry.id, delay
        );
        Some(Settlement::Retry(entry.clone()))
    }

    /// Puts back an entry whose settlement could not be written to the store. It becomes
    /// due at `now`; an entry that was being cancelled keeps `cancel_requested`.
    pub fn reinstate(&mut self, mut entry: QueueEntry<T>, now: DateTime<Utc>) {
        entry.state = RedemptionState::RetryScheduled;
        entry.next_retry_at = now;
        warn!("Reinstating {} until its settlement is stored", entry.id);

        match self.entries.iter_mut().find(|existing| existing.id == entry.id) {
            Some(existing) => *existing = entry,
            None => {
                let index = self
                    .entries
                    .partition_point(|existing| existing.sequence < entry.sequence);
                self.entries.insert(index, entry);
            }
        }
    }

    pub fn cancel(&mut self, id: &str) -> CancelOutcome<T> {
        let Some(index) = self.entries.iter().position(|entry| entry.id == id) else {
            return CancelOutcome::NotFound;
        };

        if self.entries[index].state == RedemptionState::Redeeming {
            self.entries[index].cancel_requested = true;
            return CancelOutcome::Deferred;
        }

        let mut entry = self.entries.remove(index);
        entry.state = RedemptionState::Cancelled;
        CancelOutcome::Cancelled(entry)
    }

    pub fn get(&self, id: &str) -> Option<&QueueEntry<T>> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn entries(&self) -> &[QueueEntry<T>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
