use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfirmationType {
    #[serde(rename = "served")]
    Served,
    #[serde(rename = "view")]
    Viewed,
    #[serde(rename = "click")]
    Clicked,
    #[serde(rename = "dismiss")]
    Dismissed,
    #[serde(rename = "landed")]
    Landed,
    #[serde(rename = "flag")]
    Flagged,
    #[serde(rename = "upvote")]
    Upvoted,
    #[serde(rename = "downvote")]
    Downvoted,
    #[serde(rename = "conversion")]
    Conversion,
}

impl ConfirmationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationType::Served => "served",
            ConfirmationType::Viewed => "view",
            ConfirmationType::Clicked => "click",
            ConfirmationType::Dismissed => "dismiss",
            ConfirmationType::Landed => "landed",
            ConfirmationType::Flagged => "flag",
            ConfirmationType::Upvoted => "upvote",
            ConfirmationType::Downvoted => "downvote",
            ConfirmationType::Conversion => "conversion",
        }
    }

    /// Serving is frequency capped. Everything else follows an already approved serve or
    /// is an explicit user action.
    pub fn is_subject_to_caps(&self) -> bool {
        matches!(self, ConfirmationType::Served)
    }
}

impl fmt::Display for ConfirmationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfirmationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "served" => Ok(ConfirmationType::Served),
            "view" => Ok(ConfirmationType::Viewed),
            "click" => Ok(ConfirmationType::Clicked),
            "dismiss" => Ok(ConfirmationType::Dismissed),
            "landed" => Ok(ConfirmationType::Landed),
            "flag" => Ok(ConfirmationType::Flagged),
            "upvote" => Ok(ConfirmationType::Upvoted),
            "downvote" => Ok(ConfirmationType::Downvoted),
            "conversion" => Ok(ConfirmationType::Conversion),
            other => Err(format!("unknown confirmation type: {}", other)),
        }
    }
}

/// One entry of the append-only ad event log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdEvent {
    pub creative_instance_id: String,
    pub creative_set_id: String,
    pub campaign_id: String,
    pub confirmation_type: ConfirmationType,
    pub created_at: DateTime<Utc>,
}

impl AdEvent {
    pub fn new(ad: &CreativeAd, confirmation_type: ConfirmationType, created_at: DateTime<Utc>) -> Self {
        Self {
            creative_instance_id: ad.creative_instance_id.clone(),
            creative_set_id: ad.creative_set_id.clone(),
            campaign_id: ad.campaign_id.clone(),
            confirmation_type,
            created_at,
        }
    }
}

/// Events of one creative and type that were folded out of the log, kept so lifetime caps
/// still see them
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdEventTally {
    pub creative_instance_id: String,
    pub creative_set_id: String,
    pub campaign_id: String,
    pub confirmation_type: ConfirmationType,
    pub count: usize,
}

impl AdEventTally {
    pub fn matches(&self, event: &AdEvent) -> bool {
        self.creative_instance_id == event.creative_instance_id
            && self.creative_set_id == event.creative_set_id
            && self.campaign_id == event.campaign_id
            && self.confirmation_type == event.confirmation_type
    }
}

impl From<&AdEvent> for AdEventTally {
    fn from(event: &AdEvent) -> Self {
        Self {
            creative_instance_id: event.creative_instance_id.clone(),
            creative_set_id: event.creative_set_id.clone(),
            campaign_id: event.campaign_id.clone(),
            confirmation_type: event.confirmation_type,
            count: 1,
        }
    }
}

/// Eligibility metadata for a creative, loaded from the catalog. A cap of 0 means uncapped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreativeAd {
    pub creative_instance_id: String,
    pub creative_set_id: String,
    pub campaign_id: String,
    pub per_day: u32,
    pub per_week: u32,
    pub per_month: u32,
    pub total_max: u32,
    pub daily_cap: u32,
}

impl CreativeAd {
    pub fn new(creative_instance_id: &str, creative_set_id: &str, campaign_id: &str) -> Self {
        Self {
            creative_instance_id: creative_instance_id.to_string(),
            creative_set_id: creative_set_id.to_string(),
            campaign_id: campaign_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_per_day(mut self, cap: u32) -> Self {
        self.per_day = cap;
        self
    }

    pub fn with_per_week(mut self, cap: u32) -> Self {
        self.per_week = cap;
        self
    }

    pub fn with_per_month(mut self, cap: u32) -> Self {
        self.per_month = cap;
        self
    }

    pub fn with_total_max(mut self, cap: u32) -> Self {
        self.total_max = cap;
        self
    }

    pub fn with_daily_cap(mut self, cap: u32) -> Self {
        self.daily_cap = cap;
        self
    }
}
