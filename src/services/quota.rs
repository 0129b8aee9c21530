use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};

use super::{QuotaChecker, UsageDecision};
use crate::config::QuotaConfig;
use crate::error::EngineResult;
use crate::storage::{SqliteStorage, Storage};

/// Storage-backed attempt quota with a daily and a monthly window.
///
/// Windows are calendar-aligned UTC: the daily window resets at
/// midnight, the monthly window on the first of the month.
#[derive(Clone)]
pub struct AttemptQuota {
    storage: SqliteStorage,
    limits: QuotaConfig,
}

impl AttemptQuota {
    /// Create a new quota checker.
    pub fn new(storage: SqliteStorage, limits: QuotaConfig) -> Self {
        Self { storage, limits }
    }
}

#[async_trait]
impl QuotaChecker for AttemptQuota {
    async fn check_usage(&self, user_id: &str) -> EngineResult<UsageDecision> {
        let now = Utc::now();
        let day_start = start_of_day(now);
        let month_start = start_of_month(now);

        let daily_used = self
            .storage
            .count_attempts_since(user_id, day_start)
            .await?;
        let monthly_used = self
            .storage
            .count_attempts_since(user_id, month_start)
            .await?;

        Ok(decide(daily_used, monthly_used, &self.limits, now))
    }
}

/// Quota decision from window usage counts. The tighter window drives
/// both the remaining count and the reset time.
fn decide(
    daily_used: i64,
    monthly_used: i64,
    limits: &QuotaConfig,
    now: DateTime<Utc>,
) -> UsageDecision {
    let daily_remaining = limits.daily_attempts.saturating_sub(daily_used.max(0) as u32);
    let monthly_remaining = limits
        .monthly_attempts
        .saturating_sub(monthly_used.max(0) as u32);

    let day_start = start_of_day(now);
    let daily_reset = day_start + Duration::days(1);
    let monthly_reset = start_of_month(now)
        .checked_add_months(Months::new(1))
        .unwrap_or(daily_reset);

    let (remaining, resets_at) = if monthly_remaining < daily_remaining {
        (monthly_remaining, monthly_reset)
    } else {
        (daily_remaining, daily_reset)
    };

    UsageDecision {
        allowed: remaining > 0,
        remaining,
        resets_at,
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now)
}

fn start_of_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let day_start = start_of_day(now);
    day_start.with_day(1).unwrap_or(day_start)
}
