use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ads::{AdEvent, CreativeAd};
use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::config::ConfirmationsConfig;
use crate::confirmation::{Confirmation, ConfirmationBuilder, RandomTokenGenerator, TokenGenerator};
use crate::error::{CapExceededError, RedemptionError, Result};
use crate::events::{Notifier, RedemptionEvent};
use crate::exclusion::{default_rules, ExclusionRule, ExclusionRules, HistorySnapshot};
use crate::issuers::Issuers;
use crate::payout::{payout_timer, PaymentBatch, PaymentRedeemer, PaymentToken};
use crate::queue::{to_chrono, CancelOutcome, QueueEntry, RedemptionQueue, Settlement};
use crate::redeemer::{Redeemer, Redemption};
use crate::store::ConfirmationStore;
use crate::transactions::{self, Transaction};
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cancellation {
    Cancelled,
    /// In flight; the result is discarded when the attempt finishes
    Deferred,
    NotFound,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmationsStatus {
    pub queued_confirmations: usize,
    pub queued_payments: usize,
    pub unblinded_payment_tokens: usize,
    pub estimated_pending_rewards: f64,
    pub ads_received_this_month: usize,
    pub next_payout_at: Option<DateTime<Utc>>,
}

/// Owns every collaborator and both redemption queues. All mutation goes through
/// `&mut self`, so one instance is one logical sequence; `spawn` wraps it in a task for
/// callers on other threads.
pub struct Confirmations {
    config: ConfirmationsConfig,
    store: Arc<dyn ConfirmationStore>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    issuers: Issuers,
    rules: Vec<Box<dyn ExclusionRule>>,
    builder: ConfirmationBuilder,
    redeemer: Redeemer,
    payment_redeemer: PaymentRedeemer,
    confirmations: RedemptionQueue<Confirmation>,
    payments: RedemptionQueue<PaymentBatch>,
    payout_timer: Option<DateTime<Utc>>,
}

impl Confirmations {
    /// Restores both queues from the store, requeueing anything interrupted mid-flight,
    /// and arms the payout timer.
    pub async fn load(
        config: ConfirmationsConfig,
        store: Arc<dyn ConfirmationStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
    ) -> Result<Self> {
        config.validate()?;
        let backoff = Backoff::from_config(&config);

        let confirmations = RedemptionQueue::restore(
            backoff.clone(),
            config.max_retries,
            store.load_confirmations().await?,
        );
        for entry in confirmations.entries() {
            store.save_confirmation(entry).await?;
        }

        let payments =
            RedemptionQueue::restore(backoff, config.max_retries, store.load_payments().await?);
        for entry in payments.entries() {
            store.save_payment(entry).await?;
        }

        let mut service = Self {
            store,
            issuers: Issuers::default(),
            rules: default_rules(config.per_hour_cap),
            builder: ConfirmationBuilder::new(Arc::new(RandomTokenGenerator), config.rewards_enabled),
            redeemer: Redeemer::new(
                transport.clone(),
                clock.clone(),
                notifier.clone(),
                config.request_timeout,
            ),
            payment_redeemer: PaymentRedeemer::new(transport, config.request_timeout),
            clock,
            notifier,
            confirmations,
            payments,
            payout_timer: None,
            config,
        };
        service.arm_payout_timer().await?;

        info!(
            "Confirmations loaded: {} confirmations and {} payments queued",
            service.confirmations.len(),
            service.payments.len()
        );
        Ok(service)
    }

    pub fn with_token_generator(mut self, generator: Arc<dyn TokenGenerator>) -> Self {
        self.builder = ConfirmationBuilder::new(generator, self.config.rewards_enabled);
        self
    }

    pub fn with_rules(mut self, rules: Vec<Box<dyn ExclusionRule>>) -> Self {
        self.rules = rules;
        self
    }

    pub fn set_issuers(&mut self, issuers: Issuers) {
        info!("Updated issuers ({} known)", issuers.iter().count());
        self.issuers = issuers;
    }

    pub fn issuers(&self) -> &Issuers {
        &self.issuers
    }

    pub fn config(&self) -> &ConfirmationsConfig {
        &self.config
    }

    /// Records the event and queues its confirmation. Capped event types are checked
    /// against the exclusion rules first; a capped event is neither recorded nor queued.
    pub async fn confirm(&mut self, event: AdEvent, ad: &CreativeAd) -> Result<String> {
        let now = self.clock.now();
        let folded = self
            .store
            .compact_ad_events(now - to_chrono(self.config.ad_event_retention))
            .await?;
        if folded > 0 {
            debug!("Folded {} old ad events into tallies", folded);
        }

        if event.confirmation_type.is_subject_to_caps() {
            let snapshot = self.history(now).await?;
            let mut rules = ExclusionRules::new(&self.rules, snapshot);
            if let Some(exclusion) = rules.should_exclude(ad) {
                info!("Not confirming {}: {}", event.creative_instance_id, exclusion.message);
                return Err(CapExceededError {
                    rule: exclusion.rule,
                    creative_instance_id: event.creative_instance_id,
                    confirmation_type: event.confirmation_type,
                    message: exclusion.message,
                }
                .into());
            }
        }

        self.store.append_ad_event(&event).await?;

        let confirmation = self.builder.build(&event, &self.issuers, now);
        let entry = self
            .confirmations
            .push(confirmation.id.clone(), confirmation, now);
        self.store.save_confirmation(&entry).await?;

        info!(
            "Queued {} confirmation {} for {}",
            entry.item.confirmation_type, entry.id, entry.item.creative_instance_id
        );
        Ok(entry.id)
    }

    /// Candidates that pass every rule, evaluated against one history snapshot
    pub async fn eligible_ads(
        &self,
        candidates: &[CreativeAd],
        last_served: Option<&CreativeAd>,
    ) -> Result<Vec<CreativeAd>> {
        let snapshot = self.history(self.clock.now()).await?;
        let mut rules = ExclusionRules::new(&self.rules, snapshot);
        let eligible = rules.apply(candidates, last_served);
        debug!(
            "{} of {} candidates eligible",
            eligible.len(),
            candidates.len()
        );
        Ok(eligible)
    }

    /// Runs one attempt for everything currently due in either queue and forms a payment
    /// batch when the payout timer has fired. Returns the number of attempts made. A store
    /// failure on one entry is logged and leaves that entry queued; the rest still run.
    pub async fn process_due(&mut self) -> Result<usize> {
        let mut attempts = 0;

        for id in self.confirmations.due(self.clock.now()) {
            if let Err(err) = self.process_confirmation(&id).await {
                error!("Failed to settle confirmation {}: {}", id, err);
            }
            attempts += 1;
        }

        if let Err(err) = self.maybe_form_payment().await {
            error!("Failed to form payment: {}", err);
        }

        for id in self.payments.due(self.clock.now()) {
            if let Err(err) = self.process_payment(&id).await {
                error!("Failed to settle payment {}: {}", id, err);
            }
            attempts += 1;
        }

        Ok(attempts)
    }

    pub async fn cancel(&mut self, id: &str) -> Result<Cancellation> {
        match self.confirmations.cancel(id) {
            CancelOutcome::Cancelled(mut entry) => {
                if let Err(err) = self.store.archive_confirmation(&entry).await {
                    // archived by the next tick instead
                    entry.cancel_requested = true;
                    self.confirmations.reinstate(entry, self.clock.now());
                    return Err(err.into());
                }
                info!("Cancelled confirmation {}", id);
                self.notifier.notify(RedemptionEvent::Cancelled { id: entry.id });
                Ok(Cancellation::Cancelled)
            }
            CancelOutcome::Deferred => {
                debug!("Cancellation of in-flight {} deferred", id);
                Ok(Cancellation::Deferred)
            }
            CancelOutcome::NotFound => Ok(Cancellation::NotFound),
        }
    }

    pub async fn status(&self) -> Result<ConfirmationsStatus> {
        let transactions = self.store.transactions().await?;
        Ok(ConfirmationsStatus {
            queued_confirmations: self.confirmations.len(),
            queued_payments: self.payments.len(),
            unblinded_payment_tokens: self.store.token_count().await?,
            estimated_pending_rewards: transactions::estimated_pending_rewards(&transactions),
            ads_received_this_month: transactions::ads_received_this_month(
                &transactions,
                self.clock.now(),
            ),
            next_payout_at: self.store.next_payout_at().await?,
        })
    }

    /// Earliest instant at which `process_due` has work
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        [
            self.confirmations.next_wakeup(),
            self.payments.next_wakeup(),
            self.payout_timer,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn confirmation(&self, id: &str) -> Option<&QueueEntry<Confirmation>> {
        self.confirmations.get(id)
    }

    async fn history(&self, now: DateTime<Utc>) -> Result<HistorySnapshot> {
        Ok(HistorySnapshot::new(self.store.ad_events().await?, now)
            .with_tallies(self.store.ad_event_tallies().await?))
    }

    async fn process_confirmation(&mut self, id: &str) -> Result<()> {
        let Some(mut entry) = self.confirmations.begin(id) else {
            return Ok(());
        };

        // durable before the request goes out
        let result = if entry.cancel_requested {
            Ok(Redemption::OptedOut)
        } else {
            match self.store.save_confirmation(&entry).await {
                Ok(()) => self.redeemer.redeem(&mut entry.item, &self.issuers).await,
                Err(err) => Err(RedemptionError::Store(err)),
            }
        };

        let cancelled = self
            .confirmations
            .get(id)
            .map(|queued| queued.cancel_requested)
            .unwrap_or(false);

        let result = match result {
            Ok(redemption) if !cancelled => self.keep_redemption(&entry.item, redemption).await,
            Ok(_) => Ok(0.0),
            Err(RedemptionError::ProofVerification) => {
                warn!("Proof for {} did not verify; retrying with a fresh token", id);
                self.builder.reblind(&mut entry.item);
                Err(RedemptionError::ProofVerification)
            }
            Err(err) => Err(err),
        };

        self.confirmations.update_item(id, entry.item.clone());
        let now = self.clock.now();
        let outcome = result.as_ref().map(|_| ());
        let Some(settlement) = self.confirmations.settle(id, outcome, now) else {
            return Ok(());
        };

        match settlement {
            Settlement::Redeemed(done) => {
                if let Err(err) = self.store.archive_confirmation(&done).await {
                    self.confirmations.reinstate(done, now);
                    return Err(err.into());
                }
                info!("Redeemed {} confirmation {}", done.item.confirmation_type, done.id);
                self.notifier.notify(RedemptionEvent::Redeemed {
                    id: done.id,
                    confirmation_type: done.item.confirmation_type,
                    estimated_redemption_value: result.unwrap_or(0.0),
                });
            }
            Settlement::Retry(retry) => {
                // the in-memory schedule stands; the store catches up on the next save
                if let Err(err) = self.store.save_confirmation(&retry).await {
                    warn!("Failed to store retry of {}: {}", retry.id, err);
                }
                let err = result.err();
                warn!(
                    "Failed to redeem {} (retry {}): {}",
                    retry.id,
                    retry.retry_count,
                    retry.last_error.as_deref().unwrap_or_default()
                );
                self.notifier.notify(RedemptionEvent::FailedToRedeem {
                    id: retry.id.clone(),
                    should_retry: true,
                    should_backoff: err.as_ref().map(|e| e.should_backoff()).unwrap_or(true),
                    error: retry.last_error.clone().unwrap_or_default(),
                });
                self.notifier.notify(RedemptionEvent::RetryScheduled {
                    id: retry.id,
                    retry_count: retry.retry_count,
                    at: retry.next_retry_at,
                });
            }
            Settlement::Exhausted(exhausted) => {
                if let Err(err) = self.store.archive_confirmation(&exhausted).await {
                    self.confirmations.reinstate(exhausted, now);
                    return Err(err.into());
                }
                let reason = exhausted.last_error.clone().unwrap_or_default();
                error!("Confirmation {} exhausted: {}", exhausted.id, reason);
                self.notifier.notify(RedemptionEvent::FailedToRedeem {
                    id: exhausted.id.clone(),
                    should_retry: false,
                    should_backoff: false,
                    error: reason.clone(),
                });
                self.notifier.notify(RedemptionEvent::Exhausted {
                    id: exhausted.id,
                    reason,
                });
            }
            Settlement::Discarded(cancelled) => {
                if let Err(err) = self.store.archive_confirmation(&cancelled).await {
                    self.confirmations.reinstate(cancelled, now);
                    return Err(err.into());
                }
                info!("Cancelled confirmation {}", cancelled.id);
                self.notifier.notify(RedemptionEvent::Cancelled { id: cancelled.id });
            }
        }
        Ok(())
    }

    /// Pools the unblinded tokens and records the transaction. Returns the estimated value.
    /// The transaction takes the confirmation id, so redeeming the same confirmation again
    /// records nothing new.
    async fn keep_redemption(
        &self,
        confirmation: &Confirmation,
        redemption: Redemption,
    ) -> std::result::Result<f64, RedemptionError> {
        let Redemption::OptedIn {
            unblinded_tokens,
            public_key,
            estimated_redemption_value,
        } = redemption
        else {
            return Ok(0.0);
        };

        let tokens = unblinded_tokens
            .into_iter()
            .map(|unblinded_token| PaymentToken {
                unblinded_token,
                public_key,
            })
            .collect();
        let transaction = Transaction {
            id: confirmation.id.clone(),
            created_at: self.clock.now(),
            estimated_redemption_value,
            confirmation_type: confirmation.confirmation_type,
            paid_out: false,
        };

        if !self.store.record_redemption(tokens, &transaction).await? {
            debug!("Redemption of {} was already recorded", confirmation.id);
        }
        Ok(estimated_redemption_value)
    }

    async fn arm_payout_timer(&mut self) -> Result<()> {
        let now = self.clock.now();
        let next_payout_at = match self.store.next_payout_at().await? {
            Some(at) => at,
            None => self.schedule_next_payout(now).await?,
        };
        self.payout_timer = Some(payout_timer(now, next_payout_at));
        Ok(())
    }

    async fn schedule_next_payout(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let at = now + to_chrono(self.config.payout_interval);
        self.store.set_next_payout_at(at).await?;
        info!("Scheduled next payout for {}", at);
        self.notifier
            .notify(RedemptionEvent::ScheduledNextRedemption { at });
        Ok(at)
    }

    async fn maybe_form_payment(&mut self) -> Result<()> {
        let now = self.clock.now();
        match self.payout_timer {
            Some(timer) if timer <= now => {}
            _ => return Ok(()),
        }

        let count = self.store.token_count().await?;
        if count >= self.config.min_unblinded_payment_tokens_for_payout.max(1) {
            let tokens = self.store.take_all_tokens().await?;
            let batched: Vec<&String> = self
                .payments
                .entries()
                .iter()
                .flat_map(|entry| entry.item.transaction_ids.iter())
                .collect();
            let transaction_ids = self
                .store
                .transactions()
                .await?
                .into_iter()
                .filter(|tx| !tx.paid_out && !batched.contains(&&tx.id))
                .map(|tx| tx.id)
                .collect();

            let batch = PaymentBatch {
                payment_id: Uuid::new_v4().to_string(),
                tokens,
                transaction_ids,
                created_at: now,
            };
            let entry = self.payments.push(batch.payment_id.clone(), batch, now);
            // the queued batch holds the tokens; its first attempt saves it again
            if let Err(err) = self.store.save_payment(&entry).await {
                warn!("Failed to store payment {}: {}", entry.id, err);
            }
            info!(
                "Queued payment {} with {} tokens",
                entry.id,
                entry.item.tokens.len()
            );
        } else {
            debug!("Skipping payout: {} tokens pooled", count);
        }

        let next_payout_at = self.schedule_next_payout(now).await?;
        self.payout_timer = Some(payout_timer(now, next_payout_at));
        Ok(())
    }

    async fn process_payment(&mut self, id: &str) -> Result<()> {
        let Some(entry) = self.payments.begin(id) else {
            return Ok(());
        };

        let result = if entry.cancel_requested {
            Ok(())
        } else {
            match self.store.save_payment(&entry).await {
                Ok(()) => self.payment_redeemer.redeem(&entry.item).await,
                Err(err) => Err(RedemptionError::Store(err)),
            }
        };

        let now = self.clock.now();
        let Some(settlement) = self.payments.settle(id, result.as_ref().map(|_| ()), now) else {
            return Ok(());
        };

        match settlement {
            Settlement::Redeemed(done) => {
                let stored = match self
                    .store
                    .mark_transactions_paid(&done.item.transaction_ids)
                    .await
                {
                    Ok(()) => self.store.archive_payment(&done).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = stored {
                    self.payments.reinstate(done, now);
                    return Err(err.into());
                }
                self.notifier.notify(RedemptionEvent::PaidOut {
                    payment_id: done.id,
                    token_count: done.item.tokens.len(),
                });
            }
            Settlement::Retry(retry) => {
                if let Err(err) = self.store.save_payment(&retry).await {
                    warn!("Failed to store retry of payment {}: {}", retry.id, err);
                }
                warn!(
                    "Failed to pay out {} (retry {})",
                    retry.id, retry.retry_count
                );
                self.notifier.notify(RedemptionEvent::FailedToPayOut {
                    payment_id: retry.id.clone(),
                    should_retry: true,
                    error: retry.last_error.clone().unwrap_or_default(),
                });
                self.notifier.notify(RedemptionEvent::RetryScheduled {
                    id: retry.id,
                    retry_count: retry.retry_count,
                    at: retry.next_retry_at,
                });
            }
            Settlement::Exhausted(exhausted) => {
                if let Err(err) = self.store.archive_payment(&exhausted).await {
                    self.payments.reinstate(exhausted, now);
                    return Err(err.into());
                }
                let reason = exhausted.last_error.clone().unwrap_or_default();
                error!("Payment {} exhausted: {}", exhausted.id, reason);
                self.notifier.notify(RedemptionEvent::FailedToPayOut {
                    payment_id: exhausted.id.clone(),
                    should_retry: false,
                    error: reason.clone(),
                });
                self.notifier.notify(RedemptionEvent::Exhausted {
                    id: exhausted.id,
                    reason,
                });
            }
            Settlement::Discarded(cancelled) => {
                if let Err(err) = self.store.archive_payment(&cancelled).await {
                    self.payments.reinstate(cancelled, now);
                    return Err(err.into());
                }
                self.notifier.notify(RedemptionEvent::Cancelled { id: cancelled.id });
            }
        }
        Ok(())
    }
}
