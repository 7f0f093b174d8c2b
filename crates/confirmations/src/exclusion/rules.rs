use chrono::{DateTime, Duration, Utc};

use super::{ExclusionRule, HistorySnapshot};
use crate::ads::{AdEvent, AdEventTally, ConfirmationType, CreativeAd};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Creative,
    CreativeSet,
    Campaign,
}

impl Granularity {
    fn ad_id<'a>(&self, ad: &'a CreativeAd) -> &'a str {
        match self {
            Granularity::Creative => &ad.creative_instance_id,
            Granularity::CreativeSet => &ad.creative_set_id,
            Granularity::Campaign => &ad.campaign_id,
        }
    }

    fn event_id<'a>(&self, event: &'a AdEvent) -> &'a str {
        match self {
            Granularity::Creative => &event.creative_instance_id,
            Granularity::CreativeSet => &event.creative_set_id,
            Granularity::Campaign => &event.campaign_id,
        }
    }

    fn tally_id<'a>(&self, tally: &'a AdEventTally) -> &'a str {
        match self {
            Granularity::Creative => &tally.creative_instance_id,
            Granularity::CreativeSet => &tally.creative_set_id,
            Granularity::Campaign => &tally.campaign_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Granularity::Creative => "creative instance",
            Granularity::CreativeSet => "creative set",
            Granularity::Campaign => "campaign",
        }
    }
}

/// Rolling-window cap check. Counts history entries for the same id and confirmation type
/// inside `time_constraint` (`None` is lifetime) and excludes once `count >= cap`.
/// `cap == 0` never excludes.
pub fn should_exclude(
    ad: &CreativeAd,
    history: &[AdEvent],
    granularity: Granularity,
    confirmation_type: ConfirmationType,
    now: DateTime<Utc>,
    time_constraint: Option<Duration>,
    cap: u32,
) -> bool {
    cap != 0
        && count_events(ad, history, granularity, confirmation_type, now, time_constraint)
            >= cap as usize
}

fn count_events(
    ad: &CreativeAd,
    history: &[AdEvent],
    granularity: Granularity,
    confirmation_type: ConfirmationType,
    now: DateTime<Utc>,
    time_constraint: Option<Duration>,
) -> usize {
    let id = granularity.ad_id(ad);
    history
        .iter()
        .filter(|event| event.confirmation_type == confirmation_type)
        .filter(|event| granularity.event_id(event) == id)
        .filter(|event| match time_constraint {
            Some(window) => now - event.created_at < window,
            None => true,
        })
        .count()
}

fn count_tallied(
    ad: &CreativeAd,
    tallies: &[AdEventTally],
    granularity: Granularity,
    confirmation_type: ConfirmationType,
) -> usize {
    let id = granularity.ad_id(ad);
    tallies
        .iter()
        .filter(|tally| tally.confirmation_type == confirmation_type)
        .filter(|tally| granularity.tally_id(tally) == id)
        .map(|tally| tally.count)
        .sum()
}

#[derive(Clone, Copy, Debug)]
enum Cap {
    Fixed(u32),
    PerDay,
    PerWeek,
    PerMonth,
    TotalMax,
    DailyCap,
}

impl Cap {
    fn of(&self, ad: &CreativeAd) -> u32 {
        match self {
            Cap::Fixed(cap) => *cap,
            Cap::PerDay => ad.per_day,
            Cap::PerWeek => ad.per_week,
            Cap::PerMonth => ad.per_month,
            Cap::TotalMax => ad.total_max,
            Cap::DailyCap => ad.daily_cap,
        }
    }
}

/// A concrete instance of the generic cap check at one granularity and window.
#[derive(Clone, Debug)]
pub struct FrequencyCapRule {
    name: &'static str,
    granularity: Granularity,
    window: Option<Duration>,
    cap: Cap,
}

impl FrequencyCapRule {
    pub fn per_hour(cap: u32) -> Self {
        Self {
            name: "per_hour",
            granularity: Granularity::Creative,
            window: Some(Duration::hours(1)),
            cap: Cap::Fixed(cap),
        }
    }

    pub fn per_day() -> Self {
        Self {
            name: "per_day",
            granularity: Granularity::CreativeSet,
            window: Some(Duration::days(1)),
            cap: Cap::PerDay,
        }
    }

    pub fn per_week() -> Self {
        Self {
            name: "per_week",
            granularity: Granularity::CreativeSet,
            window: Some(Duration::days(7)),
            cap: Cap::PerWeek,
        }
    }

    pub fn per_month() -> Self {
        Self {
            name: "per_month",
            granularity: Granularity::CreativeSet,
            window: Some(Duration::days(28)),
            cap: Cap::PerMonth,
        }
    }

    pub fn total_max() -> Self {
        Self {
            name: "total_max",
            granularity: Granularity::CreativeSet,
            window: None,
            cap: Cap::TotalMax,
        }
    }

    pub fn daily_cap() -> Self {
        Self {
            name: "daily_cap",
            granularity: Granularity::Campaign,
            window: Some(Duration::days(1)),
            cap: Cap::DailyCap,
        }
    }
}

impl ExclusionRule for FrequencyCapRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn uuid(&self, ad: &CreativeAd) -> String {
        format!("{}:{}", self.granularity.label(), self.granularity.ad_id(ad))
    }

    fn should_exclude(&self, ad: &CreativeAd, snapshot: &HistorySnapshot) -> bool {
        let cap = self.cap.of(ad);
        if cap == 0 {
            return false;
        }

        let mut count = count_events(
            ad,
            snapshot.events(),
            self.granularity,
            ConfirmationType::Served,
            snapshot.now(),
            self.window,
        );
        // folded events are older than every window
        if self.window.is_none() {
            count += count_tallied(ad, snapshot.tallies(), self.granularity, ConfirmationType::Served);
        }
        count >= cap as usize
    }

    fn describe(&self, ad: &CreativeAd) -> String {
        format!(
            "{} {} has exceeded the {} frequency cap of {}",
            self.granularity.label(),
            self.granularity.ad_id(ad),
            self.name,
            self.cap.of(ad)
        )
    }
}
