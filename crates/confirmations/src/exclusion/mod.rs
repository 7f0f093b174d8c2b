//! Frequency-cap exclusion rules. Every rule is a pure function of one history snapshot
//! and one injected `now`.
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::ads::{AdEvent, AdEventTally, CreativeAd};

pub mod rules;

pub use rules::{should_exclude, FrequencyCapRule, Granularity};

/// Immutable view of the ad event log taken once per serving decision.
#[derive(Clone, Debug)]
pub struct HistorySnapshot {
    events: Vec<AdEvent>,
    tallies: Vec<AdEventTally>,
    now: DateTime<Utc>,
}

impl HistorySnapshot {
    pub fn new(events: Vec<AdEvent>, now: DateTime<Utc>) -> Self {
        Self {
            events,
            tallies: Vec::new(),
            now,
        }
    }

    /// Adds the counts of events already folded out of the log
    pub fn with_tallies(mut self, tallies: Vec<AdEventTally>) -> Self {
        self.tallies = tallies;
        self
    }

    pub fn events(&self) -> &[AdEvent] {
        &self.events
    }

    pub fn tallies(&self) -> &[AdEventTally] {
        &self.tallies
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

pub trait ExclusionRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Memoization key. Rules at creative-set granularity share a key across every
    /// creative of the set.
    fn uuid(&self, ad: &CreativeAd) -> String;

    fn should_exclude(&self, ad: &CreativeAd, snapshot: &HistorySnapshot) -> bool;

    fn describe(&self, ad: &CreativeAd) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exclusion {
    pub rule: &'static str,
    pub message: String,
}

/// One evaluation pass. Caches every uuid found ineligible so repeated lookups within the
/// pass skip the rules; drop it once the decision is made.
pub struct ExclusionRules<'a> {
    rules: &'a [Box<dyn ExclusionRule>],
    snapshot: HistorySnapshot,
    excluded_uuids: HashSet<String>,
}

impl<'a> ExclusionRules<'a> {
    pub fn new(rules: &'a [Box<dyn ExclusionRule>], snapshot: HistorySnapshot) -> Self {
        Self {
            rules,
            snapshot,
            excluded_uuids: HashSet::new(),
        }
    }

    pub fn should_exclude(&mut self, ad: &CreativeAd) -> Option<Exclusion> {
        for rule in self.rules {
            if self.excluded_uuids.contains(&rule.uuid(ad)) {
                return Some(Exclusion {
                    rule: rule.name(),
                    message: rule.describe(ad),
                });
            }
        }

        for rule in self.rules {
            if rule.should_exclude(ad, &self.snapshot) {
                let message = rule.describe(ad);
                debug!("{}", message);
                self.excluded_uuids.insert(rule.uuid(ad));
                return Some(Exclusion {
                    rule: rule.name(),
                    message,
                });
            }
        }

        None
    }

    /// Removes capped candidates, then the last served ad unless it is the only one left.
    pub fn apply(&mut self, candidates: &[CreativeAd], last_served_ad: Option<&CreativeAd>) -> Vec<CreativeAd> {
        let mut eligible: Vec<CreativeAd> = candidates
            .iter()
            .filter(|ad| self.should_exclude(ad).is_none())
            .cloned()
            .collect();

        if eligible.len() > 1 {
            if let Some(last) = last_served_ad {
                eligible.retain(|ad| ad.creative_instance_id != last.creative_instance_id);
            }
        }

        eligible
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded_uuids.len()
    }
}

/// The default rule set: creative per hour, creative set per day, week, month and total,
/// campaign daily cap.
pub fn default_rules(per_hour_cap: u32) -> Vec<Box<dyn ExclusionRule>> {
    vec![
        Box::new(FrequencyCapRule::per_hour(per_hour_cap)),
        Box::new(FrequencyCapRule::per_day()),
        Box::new(FrequencyCapRule::per_week()),
        Box::new(FrequencyCapRule::per_month()),
        Box::new(FrequencyCapRule::total_max()),
        Box::new(FrequencyCapRule::daily_cap()),
    ]
}
