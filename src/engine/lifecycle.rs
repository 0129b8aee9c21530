use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::concepts::ConceptLinker;
use super::mastery::MasteryFolder;
use super::owned_loop;
use super::review::{ReviewScheduler, REVIEW_TRIGGER_SCORE};
use crate::config::RequestConfig;
use crate::error::{EngineError, EngineResult};
use crate::services::{
    EvaluationRequest, EvaluationService, ExtractionOutcome, ExtractionService, QuotaChecker,
};
use crate::storage::{
    AttemptKind, LearningLoop, LoopAttempt, LoopPhase, LoopStatus, PrecisionMode, ReviewSchedule,
    ReviewStatus, SocraticSession, SqliteStorage, Storage,
};

/// Parameters for creating a loop.
#[derive(Debug, Clone)]
pub struct CreateLoopParams {
    /// Owning user.
    pub user_id: String,
    /// Source material to study.
    pub source_text: String,
    /// Optional subject grouping.
    pub subject: Option<String>,
    /// Extraction granularity / evaluation strictness.
    pub precision_mode: PrecisionMode,
    /// Whether this is the first chunk of a source (enables the
    /// prior-knowledge step).
    pub first_chunk: bool,
}

impl CreateLoopParams {
    /// New params with balanced precision, not a first chunk.
    pub fn new(user_id: impl Into<String>, source_text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            source_text: source_text.into(),
            subject: None,
            precision_mode: PrecisionMode::Balanced,
            first_chunk: false,
        }
    }

    /// Set the subject grouping.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the precision mode.
    pub fn with_precision(mut self, mode: PrecisionMode) -> Self {
        self.precision_mode = mode;
        self
    }

    /// Mark this as the first chunk of its source.
    pub fn as_first_chunk(mut self) -> Self {
        self.first_chunk = true;
        self
    }
}

/// Parameters for submitting an attempt.
#[derive(Debug, Clone)]
pub struct SubmitAttemptParams {
    /// Acting user; must own the loop.
    pub user_id: String,
    /// Target loop.
    pub loop_id: String,
    /// Attempt type.
    pub kind: AttemptKind,
    /// The user's explanation transcript.
    pub transcript: String,
    /// Speaking duration in seconds, if known.
    pub duration_seconds: Option<i64>,
    /// Optional speech-quality metrics.
    pub speech_metrics: Option<serde_json::Value>,
}

impl SubmitAttemptParams {
    /// New params for the given attempt.
    pub fn new(
        user_id: impl Into<String>,
        loop_id: impl Into<String>,
        kind: AttemptKind,
        transcript: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            loop_id: loop_id.into(),
            kind,
            transcript: transcript.into(),
            duration_seconds: None,
            speech_metrics: None,
        }
    }

    /// Set the speaking duration.
    pub fn with_duration(mut self, seconds: i64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// Set speech-quality metrics.
    pub fn with_speech_metrics(mut self, metrics: serde_json::Value) -> Self {
        self.speech_metrics = Some(metrics);
        self
    }
}

/// What came out of one submitted attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    /// The recorded, graded attempt.
    pub attempt: LoopAttempt,
    /// The loop's phase after the attempt.
    pub phase: LoopPhase,
    /// Whether this attempt created a review schedule.
    pub review_scheduled: bool,
}

/// A loop with its attempt history, active dialogue, and schedule.
#[derive(Debug, Clone)]
pub struct LoopDetail {
    /// The loop itself.
    pub learning_loop: LearningLoop,
    /// Attempts in submission order.
    pub attempts: Vec<LoopAttempt>,
    /// The active Socratic session, if any.
    pub active_session: Option<SocraticSession>,
    /// The review schedule, if one exists.
    pub schedule: Option<ReviewSchedule>,
}

/// Drives loops through their phase state machine: creation, the
/// prior-knowledge step, attempt submission, and completion.
pub struct LoopLifecycle {
    storage: SqliteStorage,
    extraction: Arc<dyn ExtractionService>,
    evaluation: Arc<dyn EvaluationService>,
    quota: Arc<dyn QuotaChecker>,
    linker: ConceptLinker,
    folder: MasteryFolder,
    reviews: ReviewScheduler,
    request: RequestConfig,
}

impl LoopLifecycle {
    /// Create a new lifecycle driver.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: SqliteStorage,
        extraction: Arc<dyn ExtractionService>,
        evaluation: Arc<dyn EvaluationService>,
        quota: Arc<dyn QuotaChecker>,
        linker: ConceptLinker,
        folder: MasteryFolder,
        reviews: ReviewScheduler,
        request: RequestConfig,
    ) -> Self {
        Self {
            storage,
            extraction,
            evaluation,
            quota,
            linker,
            folder,
            reviews,
            request,
        }
    }

    /// Create a loop and extract its concept map.
    ///
    /// Extraction failure never fails creation: the loop proceeds with
    /// an empty concept list flagged as degraded, and a later attempt
    /// retries extraction lazily.
    pub async fn create_loop(&self, params: CreateLoopParams) -> EngineResult<LearningLoop> {
        if params.source_text.trim().is_empty() {
            return Err(EngineError::invalid_state("source text cannot be empty"));
        }

        let mut learning_loop = LearningLoop::new(
            &params.user_id,
            &params.source_text,
            params.precision_mode,
            params.first_chunk,
        );
        if let Some(subject) = &params.subject {
            learning_loop = learning_loop.with_subject(subject);
        }
        self.storage.create_loop(&learning_loop).await?;

        match self
            .extract_with_retry(&learning_loop.source_text, learning_loop.precision_mode)
            .await
        {
            ExtractionOutcome::Extracted(map) => {
                if !map.is_empty() {
                    self.linker
                        .ensure_loop_concepts(&learning_loop.id, &map)
                        .await?;
                }
                learning_loop.key_concepts = map.concepts;
                learning_loop.concept_links = map.relationships;
                learning_loop.extraction_degraded = false;
            }
            ExtractionOutcome::Degraded => {
                warn!(loop_id = %learning_loop.id, "Loop created degraded; extraction unavailable");
                learning_loop.extraction_degraded = true;
            }
        }
        learning_loop.updated_at = Utc::now();
        self.storage.update_loop(&learning_loop).await?;

        info!(
            loop_id = %learning_loop.id,
            user_id = %learning_loop.user_id,
            phase = %learning_loop.phase,
            concepts = learning_loop.key_concepts.len(),
            "Created learning loop"
        );
        Ok(learning_loop)
    }

    /// Fetch a loop with its attempts, active session, and schedule.
    pub async fn get_loop(&self, user_id: &str, loop_id: &str) -> EngineResult<LoopDetail> {
        let learning_loop = owned_loop(&self.storage, user_id, loop_id).await?;
        let attempts = self.storage.attempts_for_loop(loop_id).await?;
        let active_session = self.storage.active_session_for_loop(loop_id).await?;
        let schedule = self.storage.schedule_for_loop(user_id, loop_id).await?;
        Ok(LoopDetail {
            learning_loop,
            attempts,
            active_session,
            schedule,
        })
    }

    /// Submit and grade one explanation attempt.
    ///
    /// Checks quota, repairs a degraded concept list if the extraction
    /// service has recovered, grades the transcript, and records the
    /// attempt together with the loop's phase advance in one transaction.
    /// A simplify challenge scoring at or above the trigger creates the
    /// loop's review schedule; a quick review advances it. Schedule
    /// writes run after that transaction commits, so a failure there
    /// leaves the attempt recorded and the schedule untouched;
    /// `ensure_scheduled` makes the retry safe.
    pub async fn submit_attempt(&self, params: SubmitAttemptParams) -> EngineResult<AttemptOutcome> {
        if params.transcript.trim().is_empty() {
            return Err(EngineError::invalid_state("transcript cannot be empty"));
        }

        let mut learning_loop = owned_loop(&self.storage, &params.user_id, &params.loop_id).await?;

        let usage = self.quota.check_usage(&params.user_id).await?;
        if !usage.allowed {
            return Err(EngineError::QuotaExceeded {
                remaining: usage.remaining,
                resets_at: usage.resets_at,
            });
        }

        if learning_loop.key_concepts.is_empty() && learning_loop.extraction_degraded {
            self.repair_degraded(&mut learning_loop).await?;
        }
        if params.kind == AttemptKind::SimplifyChallenge && learning_loop.key_concepts.is_empty() {
            return Err(EngineError::invalid_state(
                "cannot run a simplify challenge before any concepts are known",
            ));
        }

        let concept_names: Vec<String> = learning_loop
            .key_concepts
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let evaluation = self
            .evaluation
            .evaluate_attempt(
                EvaluationRequest::new(
                    &learning_loop.source_text,
                    &params.transcript,
                    concept_names,
                )
                .with_kind(params.kind)
                .with_precision(learning_loop.precision_mode),
            )
            .await
            .map_err(|e| EngineError::Evaluation {
                message: e.to_string(),
            })?;

        let attempt_number = self
            .storage
            .latest_attempt(&learning_loop.id)
            .await?
            .map(|a| a.attempt_number)
            .unwrap_or(0)
            + 1;
        let mut attempt = LoopAttempt::new(
            &learning_loop.id,
            attempt_number,
            params.kind,
            &params.transcript,
        );
        attempt.duration_seconds = params.duration_seconds;
        attempt.speech_metrics = params.speech_metrics;
        attempt.score = evaluation.score;
        attempt.coverage = evaluation.coverage;
        attempt.accuracy = evaluation.accuracy;
        attempt.covered_points = evaluation.covered_points;
        attempt.missed_points = evaluation.missed_points;
        attempt.feedback = evaluation.feedback;

        if let Some(next_phase) = result_phase(&learning_loop, params.kind) {
            learning_loop.phase = next_phase;
        }
        learning_loop.updated_at = Utc::now();
        self.storage
            .record_attempt(&attempt, &learning_loop)
            .await?;

        let mut review_scheduled = false;
        match params.kind {
            AttemptKind::SimplifyChallenge if attempt.score >= REVIEW_TRIGGER_SCORE => {
                review_scheduled = self
                    .reviews
                    .ensure_scheduled(&learning_loop.user_id, &learning_loop.id)
                    .await?;
            }
            AttemptKind::QuickReview => {
                if let Some(schedule) = self
                    .storage
                    .schedule_for_loop(&learning_loop.user_id, &learning_loop.id)
                    .await?
                {
                    if schedule.status != ReviewStatus::Paused {
                        self.reviews
                            .complete_review(&schedule.id, attempt.score)
                            .await?;
                    }
                }
            }
            _ => {}
        }

        info!(
            loop_id = %learning_loop.id,
            attempt = attempt.attempt_number,
            kind = %attempt.kind,
            score = attempt.score,
            phase = %learning_loop.phase,
            review_scheduled,
            "Recorded attempt"
        );
        Ok(AttemptOutcome {
            attempt,
            phase: learning_loop.phase,
            review_scheduled,
        })
    }

    /// Advance a loop to a later phase. Backward moves are rejected;
    /// advancing to the complete phase folds mastery exactly once.
    pub async fn advance_phase(
        &self,
        user_id: &str,
        loop_id: &str,
        phase: LoopPhase,
    ) -> EngineResult<LearningLoop> {
        let mut learning_loop = owned_loop(&self.storage, user_id, loop_id).await?;

        if phase == learning_loop.phase {
            return Ok(learning_loop);
        }
        if !learning_loop.phase.can_advance_to(phase) {
            return Err(EngineError::invalid_state(format!(
                "cannot move backward from {} to {}",
                learning_loop.phase, phase
            )));
        }

        if phase == LoopPhase::Complete && learning_loop.status != LoopStatus::Mastered {
            self.folder.fold_completion(&learning_loop).await?;
            learning_loop.status = LoopStatus::Mastered;
        } else {
            self.storage.update_loop(&{
                let mut update = learning_loop.clone();
                update.phase = phase;
                update.updated_at = Utc::now();
                update
            })
            .await?;
        }
        learning_loop.phase = phase;
        learning_loop.updated_at = Utc::now();

        info!(loop_id = %loop_id, phase = %phase, "Advanced loop phase");
        Ok(learning_loop)
    }

    /// Submit the prior-knowledge transcript and move on to reading.
    pub async fn submit_prior_knowledge(
        &self,
        user_id: &str,
        loop_id: &str,
        transcript: &str,
    ) -> EngineResult<LearningLoop> {
        if transcript.trim().is_empty() {
            return Err(EngineError::invalid_state("transcript cannot be empty"));
        }

        let mut learning_loop = owned_loop(&self.storage, user_id, loop_id).await?;
        if learning_loop.phase != LoopPhase::PriorKnowledge {
            return Err(EngineError::invalid_state(
                "loop is past the prior-knowledge phase",
            ));
        }

        let assessment = self
            .evaluation
            .assess_prior_knowledge(&learning_loop.source_text, transcript)
            .await
            .map_err(|e| EngineError::Evaluation {
                message: e.to_string(),
            })?;

        learning_loop.prior_knowledge_transcript = Some(transcript.to_string());
        learning_loop.prior_knowledge_analysis = Some(assessment.analysis);
        learning_loop.prior_knowledge_score = Some(assessment.score);
        learning_loop.phase = LoopPhase::Reading;
        learning_loop.updated_at = Utc::now();
        self.storage.update_loop(&learning_loop).await?;
        Ok(learning_loop)
    }

    /// Skip the prior-knowledge step and move on to reading.
    pub async fn skip_prior_knowledge(
        &self,
        user_id: &str,
        loop_id: &str,
    ) -> EngineResult<LearningLoop> {
        let mut learning_loop = owned_loop(&self.storage, user_id, loop_id).await?;
        if learning_loop.phase != LoopPhase::PriorKnowledge {
            return Err(EngineError::invalid_state(
                "loop is past the prior-knowledge phase",
            ));
        }

        learning_loop.phase = LoopPhase::Reading;
        learning_loop.updated_at = Utc::now();
        self.storage.update_loop(&learning_loop).await?;
        Ok(learning_loop)
    }

    /// Retry extraction for a degraded loop and persist the repair.
    async fn repair_degraded(&self, learning_loop: &mut LearningLoop) -> EngineResult<()> {
        match self
            .extract_with_retry(&learning_loop.source_text, learning_loop.precision_mode)
            .await
        {
            ExtractionOutcome::Extracted(map) => {
                if !map.is_empty() {
                    self.linker
                        .ensure_loop_concepts(&learning_loop.id, &map)
                        .await?;
                }
                learning_loop.key_concepts = map.concepts;
                learning_loop.concept_links = map.relationships;
                learning_loop.extraction_degraded = false;
                learning_loop.updated_at = Utc::now();
                self.storage.update_loop(learning_loop).await?;
                info!(loop_id = %learning_loop.id, "Repaired degraded loop");
            }
            ExtractionOutcome::Degraded => {
                warn!(loop_id = %learning_loop.id, "Extraction still unavailable");
            }
        }
        Ok(())
    }

    /// Run extraction with linear-backoff retries, degrading instead of
    /// failing when the service stays down.
    async fn extract_with_retry(&self, source_text: &str, mode: PrecisionMode) -> ExtractionOutcome {
        let attempts = self.request.max_retries.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(
                    self.request.retry_delay_ms * u64::from(attempt),
                ))
                .await;
            }
            match self.extraction.extract_concepts(source_text, mode).await {
                Ok(map) => return ExtractionOutcome::Extracted(map),
                Err(e) => {
                    warn!(error = %e, attempt, "Concept extraction failed");
                }
            }
        }
        ExtractionOutcome::Degraded
    }
}

/// The results phase an attempt of this kind lands the loop in, given
/// its current phase. A full explanation only reacts in the two attempt
/// phases; quick reviews do not move the state machine at all.
fn result_phase(learning_loop: &LearningLoop, kind: AttemptKind) -> Option<LoopPhase> {
    match kind {
        AttemptKind::FullExplanation => match learning_loop.phase {
            LoopPhase::FirstAttempt => Some(LoopPhase::FirstResults),
            LoopPhase::SecondAttempt => Some(LoopPhase::SecondResults),
            _ => None,
        },
        AttemptKind::SimplifyChallenge => {
            if learning_loop.phase.can_advance_to(LoopPhase::SimplifyResults) {
                Some(LoopPhase::SimplifyResults)
            } else {
                None
            }
        }
        AttemptKind::QuickReview => None,
    }
}
