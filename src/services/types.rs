use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{AttemptKind, ConceptMap, PrecisionMode};

/// Result of a concept-extraction pass over one source text.
///
/// Extraction never raises to the caller: when the service stays down
/// through every retry the loop proceeds degraded and a later operation
/// retries lazily.
#[derive(Debug, Clone)]
pub enum ExtractionOutcome {
    /// Extraction succeeded. The map may legitimately be empty for
    /// contentless source text.
    Extracted(ConceptMap),
    /// The service was unreachable; nothing is known about the source.
    Degraded,
}

impl ExtractionOutcome {
    /// True when the service could not be reached.
    pub fn is_degraded(&self) -> bool {
        matches!(self, ExtractionOutcome::Degraded)
    }
}

/// Everything the evaluation service needs to grade one attempt.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    /// The source material the user was explaining.
    pub source_text: String,
    /// Names of the concepts the explanation should cover.
    pub concept_names: Vec<String>,
    /// The user's explanation transcript.
    pub transcript: String,
    /// What kind of attempt this is; simplify challenges are graded on
    /// novice-level clarity rather than completeness.
    pub attempt_kind: AttemptKind,
    /// Evaluation strictness.
    pub precision_mode: PrecisionMode,
}

impl EvaluationRequest {
    /// Build a request for a full-explanation attempt with balanced strictness.
    pub fn new(
        source_text: impl Into<String>,
        transcript: impl Into<String>,
        concept_names: Vec<String>,
    ) -> Self {
        Self {
            source_text: source_text.into(),
            concept_names,
            transcript: transcript.into(),
            attempt_kind: AttemptKind::FullExplanation,
            precision_mode: PrecisionMode::Balanced,
        }
    }

    /// Set the attempt kind.
    pub fn with_kind(mut self, kind: AttemptKind) -> Self {
        self.attempt_kind = kind;
        self
    }

    /// Set the evaluation strictness.
    pub fn with_precision(mut self, mode: PrecisionMode) -> Self {
        self.precision_mode = mode;
        self
    }
}

/// Structured grade of one explanation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// Overall score (0-100).
    pub score: i64,
    /// Fraction of target concepts covered (0-1).
    #[serde(default)]
    pub coverage: f64,
    /// Fraction of claims that were accurate (0-1).
    #[serde(default)]
    pub accuracy: f64,
    /// Points the grader judged covered.
    #[serde(default)]
    pub covered_points: Vec<String>,
    /// Points the grader judged missed.
    #[serde(default)]
    pub missed_points: Vec<String>,
    /// Narrative feedback for the user.
    #[serde(default)]
    pub feedback: String,
}

/// Analysis of the optional pre-reading assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorKnowledgeAssessment {
    /// What the user appears to already know.
    pub analysis: String,
    /// Rough familiarity score (0-100).
    pub score: i64,
}

/// One tutor turn in a Socratic dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocraticTurn {
    /// The tutor's next question or prompt.
    pub message: String,
    /// Target concept the user's last answer addressed, if any.
    #[serde(default)]
    pub addressed_concept: Option<String>,
}

/// Outcome of a quota check.
#[derive(Debug, Clone)]
pub struct UsageDecision {
    /// Whether the attempt may proceed.
    pub allowed: bool,
    /// Attempts remaining in the tighter of the two windows.
    pub remaining: u32,
    /// When the exhausted (or tighter) window resets.
    pub resets_at: DateTime<Utc>,
}
