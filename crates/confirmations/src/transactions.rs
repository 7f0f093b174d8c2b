use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::ads::ConfirmationType;

/// Ledger entry written when a confirmation is redeemed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub estimated_redemption_value: f64,
    pub confirmation_type: ConfirmationType,
    #[serde(default)]
    pub paid_out: bool,
}

/// Value earned but not yet paid out
pub fn estimated_pending_rewards(transactions: &[Transaction]) -> f64 {
    transactions
        .iter()
        .filter(|tx| !tx.paid_out)
        .map(|tx| tx.estimated_redemption_value)
        .sum()
}

/// Viewed ads confirmed in the calendar month of `now`
pub fn ads_received_this_month(transactions: &[Transaction], now: DateTime<Utc>) -> usize {
    transactions
        .iter()
        .filter(|tx| tx.confirmation_type == ConfirmationType::Viewed)
        .filter(|tx| tx.created_at.year() == now.year() && tx.created_at.month() == now.month())
        .count()
}
