//! Metered features, plan limits and the window arithmetic behind them.

use super::message::MessageType;
use super::user::Plan;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    MessageSent,
    VoiceMessageSent,
    ProfileBoostUsed,
    IcebreakerSent,
    ProfileViewed,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::MessageSent,
        Feature::VoiceMessageSent,
        Feature::ProfileBoostUsed,
        Feature::IcebreakerSent,
        Feature::ProfileViewed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageSent => "message_sent",
            Self::VoiceMessageSent => "voice_message_sent",
            Self::ProfileBoostUsed => "profile_boost_used",
            Self::IcebreakerSent => "icebreaker_sent",
            Self::ProfileViewed => "profile_viewed",
        }
    }

    /// Which feature a message of the given type consumes.
    pub fn for_message(message_type: MessageType) -> Self {
        match message_type {
            MessageType::Voice => Self::VoiceMessageSent,
            MessageType::Icebreaker => Self::IcebreakerSent,
            MessageType::Text | MessageType::Image | MessageType::File => Self::MessageSent,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("Unknown feature: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    RollingHours(u32),
    CalendarDay,
    CalendarMonth,
}

impl QuotaWindow {
    /// Lower bound of the counting window for event-counted windows.
    /// `CalendarMonth` is counter-based and has no event window.
    pub fn window_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::RollingHours(h) => Some(now - Duration::hours(i64::from(*h))),
            Self::CalendarDay => Some(start_of_day(now)),
            Self::CalendarMonth => None,
        }
    }

    /// When a denial lifts, given the oldest event still inside the window.
    pub fn reset_at(&self, now: DateTime<Utc>, oldest_in_window: Option<DateTime<Utc>>) -> DateTime<Utc> {
        match self {
            Self::RollingHours(h) => {
                oldest_in_window.unwrap_or(now) + Duration::hours(i64::from(*h))
            }
            Self::CalendarDay => start_of_day(now) + Duration::days(1),
            Self::CalendarMonth => start_of_next_month(now),
        }
    }
}

/// Limit for one (plan, feature) pair. `limit: None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLimit {
    #[serde(default)]
    pub limit: Option<u32>,
    pub window: QuotaWindow,
}

impl FeatureLimit {
    pub const fn limited(limit: u32, window: QuotaWindow) -> Self {
        Self {
            limit: Some(limit),
            window,
        }
    }

    pub const fn unlimited(window: QuotaWindow) -> Self {
        Self {
            limit: None,
            window,
        }
    }
}

/// Static `Plan -> Feature -> FeatureLimit` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanLimits(HashMap<Plan, HashMap<Feature, FeatureLimit>>);

impl Default for PlanLimits {
    fn default() -> Self {
        use QuotaWindow::*;

        let free = HashMap::from([
            (Feature::MessageSent, FeatureLimit::limited(50, CalendarDay)),
            (Feature::VoiceMessageSent, FeatureLimit::limited(5, RollingHours(24))),
            (Feature::ProfileBoostUsed, FeatureLimit::limited(1, CalendarMonth)),
            (Feature::IcebreakerSent, FeatureLimit::limited(3, RollingHours(24))),
        ]);
        let premium = HashMap::from([
            (Feature::MessageSent, FeatureLimit::unlimited(CalendarDay)),
            (Feature::VoiceMessageSent, FeatureLimit::limited(50, RollingHours(24))),
            (Feature::ProfileBoostUsed, FeatureLimit::limited(5, CalendarMonth)),
            (Feature::IcebreakerSent, FeatureLimit::limited(20, RollingHours(24))),
        ]);
        let premium_plus = HashMap::from([
            (Feature::MessageSent, FeatureLimit::unlimited(CalendarDay)),
            (Feature::VoiceMessageSent, FeatureLimit::unlimited(RollingHours(24))),
            (Feature::ProfileBoostUsed, FeatureLimit::limited(15, CalendarMonth)),
            (Feature::IcebreakerSent, FeatureLimit::unlimited(RollingHours(24))),
        ]);

        Self(HashMap::from([
            (Plan::Free, free),
            (Plan::Premium, premium),
            (Plan::PremiumPlus, premium_plus),
        ]))
    }
}

impl PlanLimits {
    /// Limit for a pair; features a plan does not list are unlimited.
    pub fn get(&self, plan: Plan, feature: Feature) -> FeatureLimit {
        self.0
            .get(&plan)
            .and_then(|features| features.get(&feature))
            .copied()
            .unwrap_or(FeatureLimit::unlimited(QuotaWindow::CalendarMonth))
    }

    pub fn set(&mut self, plan: Plan, feature: Feature, limit: FeatureLimit) {
        self.0.entry(plan).or_default().insert(feature, limit);
    }

    /// Layer entries from a JSON document over the defaults.
    pub fn from_json_overrides(json: &str) -> Result<Self, serde_json::Error> {
        let overrides: PlanLimits = serde_json::from_str(json)?;
        let mut limits = Self::default();
        for (plan, features) in overrides.0 {
            for (feature, limit) in features {
                limits.set(plan, feature, limit);
            }
        }
        Ok(limits)
    }
}

/// What the ledger does when the usage store cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailClosed,
    FailOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QuotaDecision {
    Allowed {
        /// `None` for unlimited features
        remaining: Option<u32>,
    },
    Denied {
        reason: String,
        reset_at: DateTime<Utc>,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// `yyyymm` key of the UTC month containing `now`
pub fn month_key(now: DateTime<Utc>) -> String {
    format!("{:04}{:02}", now.year(), now.month())
}

pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::default()))
}

pub fn start_of_next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::default())))
        .unwrap_or_else(|| start_of_day(now) + Duration::days(31))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_calendar_day_resets_at_next_midnight() {
        let now = at("2026-03-14T17:45:00Z");
        assert_eq!(QuotaWindow::CalendarDay.window_start(now), Some(at("2026-03-14T00:00:00Z")));
        assert_eq!(QuotaWindow::CalendarDay.reset_at(now, None), at("2026-03-15T00:00:00Z"));
    }

    #[test]
    fn test_rolling_window_resets_when_oldest_event_ages_out() {
        let now = at("2026-03-14T17:45:00Z");
        let oldest = at("2026-03-14T02:00:00Z");
        let window = QuotaWindow::RollingHours(24);

        assert_eq!(window.window_start(now), Some(at("2026-03-13T17:45:00Z")));
        assert_eq!(window.reset_at(now, Some(oldest)), at("2026-03-15T02:00:00Z"));
    }

    #[test]
    fn test_month_rollover() {
        assert_eq!(month_key(at("2026-12-31T23:59:59Z")), "202612");
        assert_eq!(start_of_next_month(at("2026-12-31T23:59:59Z")), at("2027-01-01T00:00:00Z"));
        assert_eq!(start_of_next_month(at("2026-02-10T08:00:00Z")), at("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn test_voice_and_icebreaker_use_their_own_features() {
        assert_eq!(Feature::for_message(MessageType::Voice), Feature::VoiceMessageSent);
        assert_eq!(Feature::for_message(MessageType::Icebreaker), Feature::IcebreakerSent);
        assert_eq!(Feature::for_message(MessageType::Image), Feature::MessageSent);
    }

    #[test]
    fn test_default_free_plan() {
        let limits = PlanLimits::default();
        let messages = limits.get(Plan::Free, Feature::MessageSent);
        assert_eq!(messages, FeatureLimit::limited(50, QuotaWindow::CalendarDay));
        assert_eq!(limits.get(Plan::Premium, Feature::MessageSent).limit, None);
        assert_eq!(limits.get(Plan::Free, Feature::ProfileViewed).limit, None);
    }

    #[test]
    fn test_json_overrides_layer_over_defaults() {
        let json = r#"{
            "free": { "message_sent": { "limit": 10, "window": { "rolling_hours": 12 } } }
        }"#;
        let limits = PlanLimits::from_json_overrides(json).unwrap();

        assert_eq!(
            limits.get(Plan::Free, Feature::MessageSent),
            FeatureLimit::limited(10, QuotaWindow::RollingHours(12))
        );
        assert_eq!(limits.get(Plan::Free, Feature::ProfileBoostUsed).limit, Some(1));
    }

    #[test]
    fn test_feature_parse() {
        assert_eq!("profile_boost_used".parse::<Feature>(), Ok(Feature::ProfileBoostUsed));
        assert!("superlike".parse::<Feature>().is_err());
    }
}
