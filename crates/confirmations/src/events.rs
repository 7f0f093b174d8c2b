use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::ads::ConfirmationType;

/// Lifecycle notifications. Exactly one terminal event (`Redeemed`, `Exhausted`,
/// `Cancelled`, `PaidOut`) is emitted per queue entry.
#[derive(Clone, Debug, PartialEq)]
pub enum RedemptionEvent {
    /// The issuer accepted the confirmation request
    Sent {
        id: String,
        confirmation_type: ConfirmationType,
    },
    FailedToSend {
        id: String,
        error: String,
    },
    Redeemed {
        id: String,
        confirmation_type: ConfirmationType,
        estimated_redemption_value: f64,
    },
    FailedToRedeem {
        id: String,
        should_retry: bool,
        should_backoff: bool,
        error: String,
    },
    RetryScheduled {
        id: String,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    Exhausted {
        id: String,
        reason: String,
    },
    Cancelled {
        id: String,
    },
    /// Next payout window
    ScheduledNextRedemption {
        at: DateTime<Utc>,
    },
    PaidOut {
        payment_id: String,
        token_count: usize,
    },
    FailedToPayOut {
        payment_id: String,
        should_retry: bool,
        error: String,
    },
}

/// Sending side of the event channel. A dropped receiver is not an error.
#[derive(Clone, Debug)]
pub struct Notifier {
    sender: Option<mpsc::UnboundedSender<RedemptionEvent>>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RedemptionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn notify(&self, event: RedemptionEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                debug!("Event receiver dropped");
            }
        }
    }
}
