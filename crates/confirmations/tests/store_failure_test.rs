use ads_confirmations::tokens::SigningKey;
use ads_confirmations::transactions::Transaction;
use ads_confirmations::{
    AdEvent, AdEventTally, Cancellation, Clock, Confirmation, ConfirmationStore, ConfirmationType,
    Confirmations, ConfirmationsConfig, CreativeAd, Issuer, Issuers, ManualClock, MemoryStore,
    Method, MockIssuer, Notifier, PaymentBatch, PaymentToken, QueueEntry, RedemptionEvent,
    RedemptionState, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Memory store whose writes can be told to fail a given number of times
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing_records: AtomicUsize,
    failing_archives: AtomicUsize,
    failing_paid_marks: AtomicUsize,
}

impl FlakyStore {
    fn fail_records(&self, times: usize) {
        self.failing_records.store(times, Ordering::SeqCst);
    }

    fn fail_archives(&self, times: usize) {
        self.failing_archives.store(times, Ordering::SeqCst);
    }

    fn fail_paid_marks(&self, times: usize) {
        self.failing_paid_marks.store(times, Ordering::SeqCst);
    }
}

fn trip(remaining: &AtomicUsize) -> Result<(), StoreError> {
    match remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(StoreError::Io("disk full".into())),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl ConfirmationStore for FlakyStore {
    async fn save_confirmation(&self, entry: &QueueEntry<Confirmation>) -> Result<(), StoreError> {
        self.inner.save_confirmation(entry).await
    }

    async fn load_confirmations(&self) -> Result<Vec<QueueEntry<Confirmation>>, StoreError> {
        self.inner.load_confirmations().await
    }

    async fn archive_confirmation(&self, entry: &QueueEntry<Confirmation>) -> Result<(), StoreError> {
        trip(&self.failing_archives)?;
        self.inner.archive_confirmation(entry).await
    }

    async fn archived_confirmations(&self) -> Result<Vec<QueueEntry<Confirmation>>, StoreError> {
        self.inner.archived_confirmations().await
    }

    async fn save_payment(&self, entry: &QueueEntry<PaymentBatch>) -> Result<(), StoreError> {
        self.inner.save_payment(entry).await
    }

    async fn load_payments(&self) -> Result<Vec<QueueEntry<PaymentBatch>>, StoreError> {
        self.inner.load_payments().await
    }

    async fn archive_payment(&self, entry: &QueueEntry<PaymentBatch>) -> Result<(), StoreError> {
        self.inner.archive_payment(entry).await
    }

    async fn save_token(&self, token: PaymentToken) -> Result<(), StoreError> {
        self.inner.save_token(token).await
    }

    async fn take_token(&self) -> Result<Option<PaymentToken>, StoreError> {
        self.inner.take_token().await
    }

    async fn take_all_tokens(&self) -> Result<Vec<PaymentToken>, StoreError> {
        self.inner.take_all_tokens().await
    }

    async fn token_count(&self) -> Result<usize, StoreError> {
        self.inner.token_count().await
    }

    async fn append_ad_event(&self, event: &AdEvent) -> Result<(), StoreError> {
        self.inner.append_ad_event(event).await
    }

    async fn ad_events(&self) -> Result<Vec<AdEvent>, StoreError> {
        self.inner.ad_events().await
    }

    async fn compact_ad_events(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        self.inner.compact_ad_events(before).await
    }

    async fn ad_event_tallies(&self) -> Result<Vec<AdEventTally>, StoreError> {
        self.inner.ad_event_tallies().await
    }

    async fn record_redemption(
        &self,
        tokens: Vec<PaymentToken>,
        transaction: &Transaction,
    ) -> Result<bool, StoreError> {
        trip(&self.failing_records)?;
        self.inner.record_redemption(tokens, transaction).await
    }

    async fn transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        self.inner.transactions().await
    }

    async fn mark_transactions_paid(&self, ids: &[String]) -> Result<(), StoreError> {
        trip(&self.failing_paid_marks)?;
        self.inner.mark_transactions_paid(ids).await
    }

    async fn set_next_payout_at(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.set_next_payout_at(at).await
    }

    async fn next_payout_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.inner.next_payout_at().await
    }
}

struct Harness {
    service: Confirmations,
    issuer: Arc<MockIssuer>,
    clock: ManualClock,
    store: Arc<FlakyStore>,
    events: UnboundedReceiver<RedemptionEvent>,
}

async fn harness() -> Harness {
    let config = ConfirmationsConfig::default()
        .with_jitter(0.0)
        .with_payout_interval(std::time::Duration::from_secs(3600));
    let store = Arc::new(FlakyStore::default());
    let issuer = Arc::new(MockIssuer::new(SigningKey::random()));
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap());
    let (notifier, events) = Notifier::channel();

    let mut service = Confirmations::load(
        config,
        store.clone(),
        issuer.clone(),
        Arc::new(clock.clone()),
        notifier,
    )
    .await
    .unwrap();
    service.set_issuers(Issuers::new(vec![Issuer {
        public_key: issuer.public_key(),
        name: "0.05BAT".into(),
        valid_from: clock.now() - Duration::days(1),
        valid_until: clock.now() + Duration::days(90),
    }]));

    Harness {
        service,
        issuer,
        clock,
        store,
        events,
    }
}

async fn confirm(h: &mut Harness, creative: &str) -> String {
    let ad = CreativeAd::new(creative, "set-1", "campaign-1");
    let event = AdEvent::new(&ad, ConfirmationType::Viewed, h.clock.now());
    h.service.confirm(event, &ad).await.unwrap()
}

fn drain(events: &mut UnboundedReceiver<RedemptionEvent>) -> Vec<RedemptionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn redeemed(events: &[RedemptionEvent], id: &str) -> bool {
    events
        .iter()
        .any(|event| matches!(event, RedemptionEvent::Redeemed { id: redeemed, .. } if redeemed == id))
}

#[tokio::test]
async fn test_failed_token_write_does_not_duplicate_tokens() {
    let mut h = harness().await;
    let id = confirm(&mut h, "creative-1").await;
    h.store.fail_records(1);

    assert_eq!(h.service.process_due().await.unwrap(), 1);
    let entry = h.service.confirmation(&id).unwrap();
    assert_eq!(entry.state, RedemptionState::RetryScheduled);
    assert!(entry.item.was_created);
    assert_eq!(h.store.token_count().await.unwrap(), 0);
    assert!(h.store.transactions().await.unwrap().is_empty());

    // store failures retry without delay
    assert_eq!(h.service.process_due().await.unwrap(), 1);
    assert!(h.service.confirmation(&id).is_none());
    assert_eq!(h.store.token_count().await.unwrap(), 1);
    assert_eq!(h.store.transactions().await.unwrap().len(), 1);
    assert_eq!(h.issuer.count(Method::Post, "/credentials/"), 1);
    assert_eq!(h.issuer.count(Method::Get, "/credentials/"), 2);

    h.clock.advance(Duration::hours(1));
    h.service.process_due().await.unwrap();

    assert_eq!(h.issuer.spent_count(), 1);
    let events = drain(&mut h.events);
    assert!(events
        .iter()
        .any(|event| matches!(event, RedemptionEvent::PaidOut { token_count: 1, .. })));
    assert!(!events
        .iter()
        .any(|event| matches!(event, RedemptionEvent::Exhausted { .. })));
}

#[tokio::test]
async fn test_failed_archive_keeps_confirmation_queued() {
    let mut h = harness().await;
    let first = confirm(&mut h, "creative-1").await;
    let second = confirm(&mut h, "creative-2").await;
    h.store.fail_archives(1);

    // the failure on the first entry does not stop the second
    assert_eq!(h.service.process_due().await.unwrap(), 2);

    let entry = h.service.confirmation(&first).unwrap();
    assert_eq!(entry.state, RedemptionState::RetryScheduled);
    assert!(h.service.confirmation(&second).is_none());
    let events = drain(&mut h.events);
    assert!(!redeemed(&events, &first));
    assert!(redeemed(&events, &second));

    assert_eq!(h.service.process_due().await.unwrap(), 1);
    assert!(h.service.confirmation(&first).is_none());
    assert!(redeemed(&drain(&mut h.events), &first));

    assert_eq!(h.store.token_count().await.unwrap(), 2);
    assert_eq!(h.store.transactions().await.unwrap().len(), 2);
    assert!(h.store.load_confirmations().await.unwrap().is_empty());
    assert_eq!(h.store.archived_confirmations().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_cancel_archive_is_finished_next_tick() {
    let mut h = harness().await;
    let id = confirm(&mut h, "creative-1").await;
    h.store.fail_archives(1);

    assert!(h.service.cancel(&id).await.is_err());
    assert!(!drain(&mut h.events).contains(&RedemptionEvent::Cancelled { id: id.clone() }));

    h.service.process_due().await.unwrap();

    assert!(h.issuer.requests().is_empty());
    assert!(h.service.confirmation(&id).is_none());
    assert!(drain(&mut h.events).contains(&RedemptionEvent::Cancelled { id: id.clone() }));
    assert_eq!(h.service.cancel(&id).await.unwrap(), Cancellation::NotFound);
    assert_eq!(
        h.store.archived_confirmations().await.unwrap()[0].state,
        RedemptionState::Cancelled
    );
}

#[tokio::test]
async fn test_failed_payout_bookkeeping_resends_payment() {
    let mut h = harness().await;
    confirm(&mut h, "creative-1").await;
    h.service.process_due().await.unwrap();
    drain(&mut h.events);

    h.store.fail_paid_marks(1);
    h.clock.advance(Duration::hours(1));
    h.service.process_due().await.unwrap();

    assert_eq!(h.service.status().await.unwrap().queued_payments, 1);
    assert!(!drain(&mut h.events)
        .iter()
        .any(|event| matches!(event, RedemptionEvent::PaidOut { .. })));

    h.service.process_due().await.unwrap();

    let status = h.service.status().await.unwrap();
    assert_eq!(status.queued_payments, 0);
    assert_eq!(status.estimated_pending_rewards, 0.0);
    assert_eq!(h.issuer.count(Method::Post, "/payments/"), 2);
    assert_eq!(h.issuer.spent_count(), 1);
    assert!(drain(&mut h.events)
        .iter()
        .any(|event| matches!(event, RedemptionEvent::PaidOut { token_count: 1, .. })));
}
