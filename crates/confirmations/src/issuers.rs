use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tokens::PublicKey;

const REDEMPTION_VALUE_SUFFIX: &str = "BAT";

/// Remote signer for one token epoch. Several may be valid at once during rollover.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issuer {
    pub public_key: PublicKey,
    /// Per-token redemption value label, e.g. `0.05BAT`
    pub name: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl Issuer {
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at < self.valid_until
    }

    pub fn redemption_value(&self) -> f64 {
        let value = self.name.trim().trim_end_matches(REDEMPTION_VALUE_SUFFIX);
        match value.parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => value,
            _ => {
                warn!("Issuer name {:?} does not carry a redemption value", self.name);
                0.0
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Issuers {
    issuers: Vec<Issuer>,
}

impl Issuers {
    pub fn new(issuers: Vec<Issuer>) -> Self {
        Self { issuers }
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Issuer> {
        self.issuers.iter()
    }

    pub fn find(&self, public_key: &PublicKey) -> Option<&Issuer> {
        self.issuers.iter().find(|issuer| &issuer.public_key == public_key)
    }

    pub fn is_valid_public_key(&self, public_key: &PublicKey, at: DateTime<Utc>) -> bool {
        self.find(public_key)
            .map(|issuer| issuer.is_valid_at(at))
            .unwrap_or(false)
    }

    /// Newest issuer valid at `at`; new confirmations are stamped with its key.
    pub fn current(&self, at: DateTime<Utc>) -> Option<&Issuer> {
        self.issuers
            .iter()
            .filter(|issuer| issuer.is_valid_at(at))
            .max_by_key(|issuer| issuer.valid_from)
    }

    pub fn estimated_redemption_value(&self, public_key: &PublicKey) -> f64 {
        self.find(public_key)
            .map(Issuer::redemption_value)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::SigningKey;
    use chrono::Duration;

    fn issuer(name: &str, from: DateTime<Utc>, days: i64) -> Issuer {
        Issuer {
            public_key: SigningKey::random().public_key(),
            name: name.to_string(),
            valid_from: from,
            valid_until: from + Duration::days(days),
        }
    }

    #[test]
    fn test_redemption_value_parsed_from_name() {
        let now = Utc::now();
        assert_eq!(issuer("0.05BAT", now, 1).redemption_value(), 0.05);
        assert_eq!(issuer("1.23BAT", now, 1).redemption_value(), 1.23);
        assert_eq!(issuer("free", now, 1).redemption_value(), 0.0);
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let expired = issuer("0.1BAT", now - Duration::days(10), 5);
        let active = issuer("0.2BAT", now - Duration::days(1), 5);
        let issuers = Issuers::new(vec![expired.clone(), active.clone()]);

        assert!(!issuers.is_valid_public_key(&expired.public_key, now));
        assert!(issuers.is_valid_public_key(&active.public_key, now));
        assert!(!issuers.is_valid_public_key(&SigningKey::random().public_key(), now));
    }

    #[test]
    fn test_current_prefers_newest_during_rollover() {
        let now = Utc::now();
        let old = issuer("0.1BAT", now - Duration::days(6), 7);
        let new = issuer("0.2BAT", now - Duration::hours(1), 7);
        let issuers = Issuers::new(vec![old.clone(), new.clone()]);

        assert_eq!(issuers.current(now), Some(&new));
        assert!(issuers.is_valid_public_key(&old.public_key, now));
        assert_eq!(issuers.estimated_redemption_value(&old.public_key), 0.1);
        assert_eq!(Issuers::default().current(now), None);
    }
}
