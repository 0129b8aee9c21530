use chrono::{Duration, Utc};
use tracing::info;

use crate::config::ReviewConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{ReviewSchedule, ReviewStatus, SqliteStorage, Storage};

/// Simplify-challenge score at or above which a review schedule is created.
pub const REVIEW_TRIGGER_SCORE: i64 = 80;

/// Spaced-repetition scheduling over completed loops.
#[derive(Clone)]
pub struct ReviewScheduler {
    storage: SqliteStorage,
    config: ReviewConfig,
}

impl ReviewScheduler {
    /// Create a new scheduler.
    pub fn new(storage: SqliteStorage, config: ReviewConfig) -> Self {
        Self { storage, config }
    }

    /// Create a schedule for the (user, loop) pair unless one already
    /// exists. Returns true when a schedule was created.
    pub async fn ensure_scheduled(&self, user_id: &str, loop_id: &str) -> EngineResult<bool> {
        if self
            .storage
            .schedule_for_loop(user_id, loop_id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let schedule = ReviewSchedule::new(user_id, loop_id, self.config.initial_interval_days);
        self.storage.create_schedule(&schedule).await?;
        info!(
            user_id = %user_id,
            loop_id = %loop_id,
            interval_days = schedule.interval_days,
            "Created review schedule"
        );
        Ok(true)
    }

    /// Advance a schedule after a completed review. A passing score
    /// doubles the interval up to the cap; a failing one resets it to a
    /// day. Paused schedules are not advanced.
    pub async fn complete_review(
        &self,
        schedule_id: &str,
        score: i64,
    ) -> EngineResult<ReviewSchedule> {
        let mut schedule = self
            .storage
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Schedule", schedule_id))?;

        if schedule.status == ReviewStatus::Paused {
            return Err(EngineError::invalid_state("schedule is paused"));
        }

        let now = Utc::now();
        schedule.times_reviewed += 1;
        schedule.last_reviewed_at = Some(now);
        schedule.last_score = Some(score);
        schedule.interval_days = next_interval(schedule.interval_days, score, &self.config);
        schedule.next_review_at = now + Duration::days(schedule.interval_days);
        schedule.status = ReviewStatus::Scheduled;

        self.storage.update_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule_id,
            score,
            interval_days = schedule.interval_days,
            "Advanced review schedule"
        );
        Ok(schedule)
    }

    /// Schedules due for the user right now, paused ones excluded.
    pub async fn find_due(&self, user_id: &str) -> EngineResult<Vec<ReviewSchedule>> {
        Ok(self.storage.due_schedules(user_id, Utc::now()).await?)
    }

    /// Pause a schedule; it disappears from due queries until resumed.
    pub async fn pause(&self, schedule_id: &str) -> EngineResult<ReviewSchedule> {
        self.set_status(schedule_id, ReviewStatus::Paused).await
    }

    /// Resume a paused schedule.
    pub async fn resume(&self, schedule_id: &str) -> EngineResult<ReviewSchedule> {
        let schedule = self
            .storage
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Schedule", schedule_id))?;
        if schedule.status != ReviewStatus::Paused {
            return Err(EngineError::invalid_state("schedule is not paused"));
        }
        self.set_status(schedule_id, ReviewStatus::Scheduled).await
    }

    async fn set_status(
        &self,
        schedule_id: &str,
        status: ReviewStatus,
    ) -> EngineResult<ReviewSchedule> {
        let mut schedule = self
            .storage
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Schedule", schedule_id))?;
        schedule.status = status;
        self.storage.update_schedule(&schedule).await?;
        Ok(schedule)
    }
}

/// Next interval in days after a review at the given score.
pub fn next_interval(current_days: i64, score: i64, config: &ReviewConfig) -> i64 {
    if score >= config.pass_score {
        (current_days * 2).clamp(1, config.max_interval_days)
    } else {
        1
    }
}
