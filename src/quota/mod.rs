pub mod billing;
pub mod tracker;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub use billing::{is_valid_account, BillingService, HttpBillingService, StaticBillingService, UsageTotals};
pub use tracker::UsageQuotaTracker;

/// Recurring period over which usage accumulates, aligned to UTC calendar
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Hourly,
    Daily,
    #[default]
    Monthly,
}

impl BillingCycle {
    /// Start (inclusive) and end (exclusive) of the cycle containing `now_ms`.
    pub fn bounds(&self, now_ms: u64) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = DateTime::<Utc>::from_timestamp_millis(now_ms as i64).unwrap_or_default();

        match self {
            BillingCycle::Hourly => {
                let start = Utc
                    .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
                    .single()
                    .unwrap_or(now);
                (start, start + Duration::hours(1))
            }
            BillingCycle::Daily => {
                let start = Utc
                    .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                    .single()
                    .unwrap_or(now);
                (start, start + Duration::days(1))
            }
            BillingCycle::Monthly => {
                let start = Utc
                    .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                    .single()
                    .unwrap_or(now);
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                let end = Utc
                    .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(start + Duration::days(31));
                (start, end)
            }
        }
    }

    /// Identifier of the cycle containing `now_ms`, e.g. `2024-03` for a
    /// monthly cycle.
    pub fn cycle_id(&self, now_ms: u64) -> String {
        let (start, _) = self.bounds(now_ms);
        let format = match self {
            BillingCycle::Hourly => "%Y-%m-%dT%H",
            BillingCycle::Daily => "%Y-%m-%d",
            BillingCycle::Monthly => "%Y-%m",
        };
        start.format(format).to_string()
    }

    pub fn resets_at_ms(&self, now_ms: u64) -> u64 {
        let (_, end) = self.bounds(now_ms);
        end.timestamp_millis().max(0) as u64
    }
}

/// Per-account limits for one billing cycle. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountQuota {
    #[serde(default)]
    pub token_limit: Option<u64>,

    #[serde(default)]
    pub cost_limit: Option<f64>,
}

/// Usage of one completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub cycle_id: String,
    pub recorded_at_ms: u64,
}

impl UsageRecord {
    pub fn tokens(&self) -> u64 {
        self.tokens_in.saturating_add(self.tokens_out)
    }
}

/// Aggregated usage of one account in the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaState {
    pub account: String,
    pub cycle_id: String,
    pub tokens_used: u64,
    pub cost_used: f64,
    pub limits: AccountQuota,
    pub resets_at_ms: u64,

    /// Local usage not yet reported to the billing service
    #[serde(skip)]
    pub unreported_tokens: u64,
    #[serde(skip)]
    pub unreported_cost: f64,

    /// Last local check or record for this account
    #[serde(skip)]
    pub last_seen_ms: u64,
}

impl QuotaState {
    pub fn new(account: &str, cycle: BillingCycle, limits: AccountQuota, now_ms: u64) -> Self {
        Self {
            account: account.to_string(),
            cycle_id: cycle.cycle_id(now_ms),
            tokens_used: 0,
            cost_used: 0.0,
            limits,
            resets_at_ms: cycle.resets_at_ms(now_ms),
            unreported_tokens: 0,
            unreported_cost: 0.0,
            last_seen_ms: now_ms,
        }
    }

    pub fn has_unreported(&self) -> bool {
        self.unreported_tokens > 0 || self.unreported_cost > 0.0
    }

    /// Why `estimated_tokens` more would break a limit, if it would.
    pub fn violation(&self, estimated_tokens: u64) -> Option<&'static str> {
        if let Some(limit) = self.limits.token_limit {
            if self.tokens_used.saturating_add(estimated_tokens) > limit {
                return Some("tokens");
            }
        }
        if let Some(limit) = self.limits.cost_limit {
            if self.cost_used >= limit {
                return Some("cost");
            }
        }
        None
    }
}

/// Cross-instance usage notification, MessagePack on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub instance_id: String,
    pub account: String,
    pub cycle_id: String,
    pub tokens: u64,
    pub cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-12-31T23:30:00Z
    const NEW_YEARS_EVE: u64 = 1_735_687_800_000;

    #[test]
    fn test_cycle_ids() {
        assert_eq!(BillingCycle::Hourly.cycle_id(NEW_YEARS_EVE), "2024-12-31T23");
        assert_eq!(BillingCycle::Daily.cycle_id(NEW_YEARS_EVE), "2024-12-31");
        assert_eq!(BillingCycle::Monthly.cycle_id(NEW_YEARS_EVE), "2024-12");
    }

    #[test]
    fn test_monthly_cycle_rolls_over_year() {
        let resets = BillingCycle::Monthly.resets_at_ms(NEW_YEARS_EVE);
        assert_eq!(resets, NEW_YEARS_EVE + 30 * 60 * 1_000);
        assert_eq!(BillingCycle::Monthly.cycle_id(resets), "2025-01");
    }

    #[test]
    fn test_violation() {
        let mut state = QuotaState::new(
            "acme",
            BillingCycle::Daily,
            AccountQuota {
                token_limit: Some(1_000),
                cost_limit: Some(5.0),
            },
            0,
        );
        state.tokens_used = 900;

        assert_eq!(state.violation(100), None);
        assert_eq!(state.violation(101), Some("tokens"));

        state.cost_used = 5.0;
        assert_eq!(state.violation(0), Some("cost"));
    }

    #[test]
    fn test_usage_update_msgpack() {
        let update = UsageUpdate {
            instance_id: "a".to_string(),
            account: "acme".to_string(),
            cycle_id: "2024-12".to_string(),
            tokens: 42,
            cost: 0.5,
        };
        let bytes = rmp_serde::to_vec(&update).unwrap();
        assert_eq!(rmp_serde::from_slice::<UsageUpdate>(&bytes).unwrap(), update);
    }
}
