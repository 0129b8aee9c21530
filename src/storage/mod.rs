//! Storage layer for the learning loop engine.
//!
//! This module defines the durable domain model (concepts, loops, attempts,
//! per-user mastery records, Socratic sessions, review schedules) and the
//! [`Storage`] trait implemented by the SQLite backend.

mod sqlite;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

/// Normalize a free-text concept name into its dedup key.
///
/// Exact-match after lower-casing and trimming. Near-duplicates such as
/// "Photosynthesis" vs "the photosynthesis process" stay distinct concepts;
/// that is a known limitation of the identity scheme, not a bug.
pub fn normalize_concept_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// A deduplicated named unit of knowledge shared across loops and users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    /// Unique concept identifier.
    pub id: String,
    /// Display name as first extracted.
    pub name: String,
    /// Lower-cased, trimmed dedup key; unique across the store.
    pub normalized_name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional category for grouping in the graph view.
    pub category: Option<String>,
    /// When the concept was first created.
    pub created_at: DateTime<Utc>,
}

impl Concept {
    /// Create a new concept from a display name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Uuid::new_v4().to_string(),
            normalized_name: normalize_concept_name(&name),
            name,
            description: None,
            category: None,
            created_at: Utc::now(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// Relationship type between two concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    /// From-concept causes the to-concept.
    Causes,
    /// From-concept enables the to-concept.
    Enables,
    /// From-concept exemplifies the to-concept.
    Exemplifies,
    /// From-concept contrasts with the to-concept.
    Contrasts,
    /// From-concept is a prerequisite of the to-concept.
    Prerequisite,
}

impl std::fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelationshipKind::Causes => write!(f, "causes"),
            RelationshipKind::Enables => write!(f, "enables"),
            RelationshipKind::Exemplifies => write!(f, "exemplifies"),
            RelationshipKind::Contrasts => write!(f, "contrasts"),
            RelationshipKind::Prerequisite => write!(f, "prerequisite"),
        }
    }
}

impl std::str::FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "causes" => Ok(RelationshipKind::Causes),
            "enables" => Ok(RelationshipKind::Enables),
            "exemplifies" => Ok(RelationshipKind::Exemplifies),
            "contrasts" => Ok(RelationshipKind::Contrasts),
            "prerequisite" => Ok(RelationshipKind::Prerequisite),
            _ => Err(format!("Unknown relationship kind: {}", s)),
        }
    }
}

/// Directed, typed edge between two concepts with an accumulating strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptRelationship {
    /// Unique edge identifier.
    pub id: String,
    /// Source concept ID.
    pub from_concept_id: String,
    /// Target concept ID.
    pub to_concept_id: String,
    /// Relationship type; at most one edge per (from, to, type) triple.
    pub kind: RelationshipKind,
    /// Accumulated strength; starts at 1.0, never decreases.
    pub strength: f64,
    /// When the edge was first observed.
    pub created_at: DateTime<Utc>,
    /// When the strength last changed.
    pub updated_at: DateTime<Utc>,
}

impl ConceptRelationship {
    /// Create a new edge with the initial strength of 1.0.
    pub fn new(
        from_concept_id: impl Into<String>,
        to_concept_id: impl Into<String>,
        kind: RelationshipKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            from_concept_id: from_concept_id.into(),
            to_concept_id: to_concept_id.into(),
            kind,
            strength: 1.0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Importance of a concept within one loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// Central idea of the source material.
    Core,
    /// Supporting idea.
    #[default]
    Supporting,
    /// Incidental detail.
    Detail,
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Importance::Core => write!(f, "core"),
            Importance::Supporting => write!(f, "supporting"),
            Importance::Detail => write!(f, "detail"),
        }
    }
}

impl std::str::FromStr for Importance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "core" => Ok(Importance::Core),
            "supporting" => Ok(Importance::Supporting),
            "detail" => Ok(Importance::Detail),
            _ => Err(format!("Unknown importance: {}", s)),
        }
    }
}

/// Extraction granularity and evaluation strictness for a loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    /// Only the essential ideas.
    Essential,
    /// Balanced coverage.
    #[default]
    Balanced,
    /// Fine-grained coverage, strict evaluation.
    Precise,
}

impl std::fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrecisionMode::Essential => write!(f, "essential"),
            PrecisionMode::Balanced => write!(f, "balanced"),
            PrecisionMode::Precise => write!(f, "precise"),
        }
    }
}

impl std::str::FromStr for PrecisionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "essential" => Ok(PrecisionMode::Essential),
            "balanced" => Ok(PrecisionMode::Balanced),
            "precise" => Ok(PrecisionMode::Precise),
            _ => Err(format!("Unknown precision mode: {}", s)),
        }
    }
}

/// Lifecycle status of a learning loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    /// Loop is being worked through.
    #[default]
    InProgress,
    /// Loop reached the complete phase; mastery has been folded.
    Mastered,
    /// Loop was archived by the user.
    Archived,
}

impl std::fmt::Display for LoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopStatus::InProgress => write!(f, "in_progress"),
            LoopStatus::Mastered => write!(f, "mastered"),
            LoopStatus::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for LoopStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_progress" => Ok(LoopStatus::InProgress),
            "mastered" => Ok(LoopStatus::Mastered),
            "archived" => Ok(LoopStatus::Archived),
            _ => Err(format!("Unknown loop status: {}", s)),
        }
    }
}

/// Phase of the per-loop state machine, in forward order.
///
/// Phases only move forward; the only repetition allowed is retrying an
/// attempt within the same phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// Optional pre-reading assessment (first chunk of a source only).
    PriorKnowledge,
    /// User is reading the source material.
    Reading,
    /// First full explanation attempt.
    FirstAttempt,
    /// Results of the first attempt.
    FirstResults,
    /// Socratic remediation of missed concepts.
    Learning,
    /// Second full explanation attempt.
    SecondAttempt,
    /// Results of the second attempt.
    SecondResults,
    /// Simplify challenge (teach it to a novice).
    Simplify,
    /// Results of the simplify challenge.
    SimplifyResults,
    /// Loop finished; mastery folded into the knowledge graph.
    Complete,
}

impl LoopPhase {
    /// Position in the forward order, starting at 0.
    pub fn ordinal(&self) -> u8 {
        match self {
            LoopPhase::PriorKnowledge => 0,
            LoopPhase::Reading => 1,
            LoopPhase::FirstAttempt => 2,
            LoopPhase::FirstResults => 3,
            LoopPhase::Learning => 4,
            LoopPhase::SecondAttempt => 5,
            LoopPhase::SecondResults => 6,
            LoopPhase::Simplify => 7,
            LoopPhase::SimplifyResults => 8,
            LoopPhase::Complete => 9,
        }
    }

    /// Whether moving from `self` to `other` is a forward transition.
    pub fn can_advance_to(&self, other: LoopPhase) -> bool {
        other.ordinal() > self.ordinal()
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopPhase::PriorKnowledge => write!(f, "prior_knowledge"),
            LoopPhase::Reading => write!(f, "reading"),
            LoopPhase::FirstAttempt => write!(f, "first_attempt"),
            LoopPhase::FirstResults => write!(f, "first_results"),
            LoopPhase::Learning => write!(f, "learning"),
            LoopPhase::SecondAttempt => write!(f, "second_attempt"),
            LoopPhase::SecondResults => write!(f, "second_results"),
            LoopPhase::Simplify => write!(f, "simplify"),
            LoopPhase::SimplifyResults => write!(f, "simplify_results"),
            LoopPhase::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for LoopPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prior_knowledge" => Ok(LoopPhase::PriorKnowledge),
            "reading" => Ok(LoopPhase::Reading),
            "first_attempt" => Ok(LoopPhase::FirstAttempt),
            "first_results" => Ok(LoopPhase::FirstResults),
            "learning" => Ok(LoopPhase::Learning),
            "second_attempt" => Ok(LoopPhase::SecondAttempt),
            "second_results" => Ok(LoopPhase::SecondResults),
            "simplify" => Ok(LoopPhase::Simplify),
            "simplify_results" => Ok(LoopPhase::SimplifyResults),
            "complete" => Ok(LoopPhase::Complete),
            _ => Err(format!("Unknown loop phase: {}", s)),
        }
    }
}

/// Type of explanation attempt recorded within a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    /// Full explanation of the source material.
    FullExplanation,
    /// Explain it simply, as to a novice.
    SimplifyChallenge,
    /// Short spaced-repetition re-test.
    QuickReview,
}

impl std::fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptKind::FullExplanation => write!(f, "full_explanation"),
            AttemptKind::SimplifyChallenge => write!(f, "simplify_challenge"),
            AttemptKind::QuickReview => write!(f, "quick_review"),
        }
    }
}

impl std::str::FromStr for AttemptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full_explanation" => Ok(AttemptKind::FullExplanation),
            "simplify_challenge" => Ok(AttemptKind::SimplifyChallenge),
            "quick_review" => Ok(AttemptKind::QuickReview),
            _ => Err(format!("Unknown attempt kind: {}", s)),
        }
    }
}

/// A concept as extracted from source material, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyConcept {
    /// Concept name as extracted.
    pub name: String,
    /// Extracted explanation of the concept.
    pub explanation: String,
    /// Importance within this source.
    #[serde(default)]
    pub importance: Importance,
}

/// A relationship between two extracted concepts, addressed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptLink {
    /// Source concept name.
    pub from: String,
    /// Target concept name.
    pub to: String,
    /// Relationship type.
    pub kind: RelationshipKind,
}

/// The structured output of concept extraction for one source text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConceptMap {
    /// Extracted concepts.
    pub concepts: Vec<KeyConcept>,
    /// Extracted relationships between them.
    pub relationships: Vec<ConceptLink>,
}

impl ConceptMap {
    /// True when extraction produced no concepts.
    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }
}

/// One study session over one piece of source material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningLoop {
    /// Unique loop identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Optional subject grouping.
    pub subject: Option<String>,
    /// The source material being studied.
    pub source_text: String,
    /// Extraction granularity / evaluation strictness.
    pub precision_mode: PrecisionMode,
    /// Lifecycle status; becomes `mastered` exactly once.
    pub status: LoopStatus,
    /// Current phase of the state machine.
    pub phase: LoopPhase,
    /// Extracted key concepts (may be empty while degraded).
    pub key_concepts: Vec<KeyConcept>,
    /// Extracted relationships between key concepts.
    pub concept_links: Vec<ConceptLink>,
    /// Whether the concept list is empty because extraction failed,
    /// rather than because the source has no concepts.
    pub extraction_degraded: bool,
    /// Transcript of the prior-knowledge step, if submitted.
    pub prior_knowledge_transcript: Option<String>,
    /// Analysis of the prior-knowledge transcript.
    pub prior_knowledge_analysis: Option<String>,
    /// Score of the prior-knowledge transcript (0-100).
    pub prior_knowledge_score: Option<i64>,
    /// When the loop was created.
    pub created_at: DateTime<Utc>,
    /// When the loop was last updated.
    pub updated_at: DateTime<Utc>,
}

impl LearningLoop {
    /// Create a new loop.
    ///
    /// Loops over the very first chunk of a source start at the
    /// prior-knowledge phase; all others start at the first attempt.
    pub fn new(
        user_id: impl Into<String>,
        source_text: impl Into<String>,
        precision_mode: PrecisionMode,
        first_chunk: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            subject: None,
            source_text: source_text.into(),
            precision_mode,
            status: LoopStatus::InProgress,
            phase: if first_chunk {
                LoopPhase::PriorKnowledge
            } else {
                LoopPhase::FirstAttempt
            },
            key_concepts: Vec::new(),
            concept_links: Vec::new(),
            extraction_degraded: false,
            prior_knowledge_transcript: None,
            prior_knowledge_analysis: None,
            prior_knowledge_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the subject grouping.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// The link between one loop and one deduplicated concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConcept {
    /// Unique link identifier.
    pub id: String,
    /// Parent loop ID.
    pub loop_id: String,
    /// Linked concept ID.
    pub concept_id: String,
    /// Importance of the concept within this loop.
    pub importance: Importance,
    /// Extracted explanation text.
    pub explanation: Option<String>,
    /// Whether the concept was demonstrated during this loop.
    pub demonstrated: bool,
    /// Phase in which demonstration occurred, once.
    pub demonstrated_phase: Option<LoopPhase>,
    /// When demonstration was recorded.
    pub demonstrated_at: Option<DateTime<Utc>>,
}

impl LoopConcept {
    /// Create a new loop-concept link.
    pub fn new(
        loop_id: impl Into<String>,
        concept_id: impl Into<String>,
        importance: Importance,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            loop_id: loop_id.into(),
            concept_id: concept_id.into(),
            importance,
            explanation: None,
            demonstrated: false,
            demonstrated_phase: None,
            demonstrated_at: None,
        }
    }

    /// Set the explanation text.
    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

/// One recorded explanation attempt within a loop. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopAttempt {
    /// Unique attempt identifier.
    pub id: String,
    /// Parent loop ID.
    pub loop_id: String,
    /// Sequential number within the loop, starting at 1.
    pub attempt_number: i64,
    /// Attempt type.
    pub kind: AttemptKind,
    /// The user's explanation transcript.
    pub transcript: String,
    /// Speaking duration in seconds, if known.
    pub duration_seconds: Option<i64>,
    /// Overall score (0-100).
    pub score: i64,
    /// Coverage fraction (0-1).
    pub coverage: f64,
    /// Accuracy fraction (0-1).
    pub accuracy: f64,
    /// Points the evaluation judged covered.
    pub covered_points: Vec<String>,
    /// Points the evaluation judged missed.
    pub missed_points: Vec<String>,
    /// Narrative feedback from the evaluation.
    pub feedback: String,
    /// Optional speech-quality metrics.
    pub speech_metrics: Option<serde_json::Value>,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

impl LoopAttempt {
    /// Create a new attempt with empty evaluation fields.
    pub fn new(
        loop_id: impl Into<String>,
        attempt_number: i64,
        kind: AttemptKind,
        transcript: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            loop_id: loop_id.into(),
            attempt_number,
            kind,
            transcript: transcript.into(),
            duration_seconds: None,
            score: 0,
            coverage: 0.0,
            accuracy: 0.0,
            covered_points: Vec::new(),
            missed_points: Vec::new(),
            feedback: String::new(),
            speech_metrics: None,
            created_at: Utc::now(),
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

/// A user's aggregate relationship to a concept across all loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConcept {
    /// Unique record identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Concept ID.
    pub concept_id: String,
    /// Stored mastery score (0-100).
    pub mastery: i64,
    /// How many completed loops featured this concept. Monotonic.
    pub times_encountered: i64,
    /// How many of those encounters were demonstrations. Monotonic,
    /// never exceeds `times_encountered`.
    pub times_demonstrated: i64,
    /// When the concept was last encountered.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// When the concept was last demonstrated.
    pub last_demonstrated_at: Option<DateTime<Utc>>,
}

/// Role of a message within a Socratic session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The learner.
    User,
    /// The Socratic tutor.
    Assistant,
}

/// One message in a Socratic dialogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    /// Who wrote the message.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
    /// When the message was recorded.
    pub at: DateTime<Utc>,
}

/// Status of a Socratic session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Dialogue in progress.
    #[default]
    Active,
    /// Every target concept has been addressed.
    Completed,
    /// User walked away.
    Abandoned,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "abandoned" => Ok(SessionStatus::Abandoned),
            _ => Err(format!("Unknown session status: {}", s)),
        }
    }
}

/// A remediation dialogue targeting the concepts missed in an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocraticSession {
    /// Unique session identifier.
    pub id: String,
    /// Parent loop ID.
    pub loop_id: String,
    /// The attempt whose missed points seeded the target list.
    pub attempt_id: Option<String>,
    /// Concepts the dialogue must address.
    pub target_concepts: Vec<String>,
    /// Concepts addressed so far.
    pub addressed_concepts: Vec<String>,
    /// Ordered message log.
    pub messages: Vec<SessionMessage>,
    /// Session status.
    pub status: SessionStatus,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
}

impl SocraticSession {
    /// Create a new active session over the given target concepts.
    pub fn new(loop_id: impl Into<String>, target_concepts: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            loop_id: loop_id.into(),
            attempt_id: None,
            target_concepts,
            addressed_concepts: Vec::new(),
            messages: Vec::new(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the triggering attempt.
    pub fn with_attempt(mut self, attempt_id: impl Into<String>) -> Self {
        self.attempt_id = Some(attempt_id.into());
        self
    }

    /// Append a message to the dialogue log.
    pub fn push_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(SessionMessage {
            role,
            content: content.into(),
            at: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    /// Record a concept as addressed. Returns false if it was already
    /// present (duplicate-safe).
    pub fn address(&mut self, concept: &str) -> bool {
        let key = normalize_concept_name(concept);
        if self
            .addressed_concepts
            .iter()
            .any(|c| normalize_concept_name(c) == key)
        {
            return false;
        }
        self.addressed_concepts.push(concept.to_string());
        self.updated_at = Utc::now();
        true
    }

    /// Completion rule: every target concept appears in the addressed set.
    /// Set containment, order-independent, duplicate-safe.
    pub fn is_complete(&self) -> bool {
        self.target_concepts.iter().all(|t| {
            let key = normalize_concept_name(t);
            self.addressed_concepts
                .iter()
                .any(|a| normalize_concept_name(a) == key)
        })
    }

    /// Target concepts not yet addressed.
    pub fn remaining_concepts(&self) -> Vec<String> {
        self.target_concepts
            .iter()
            .filter(|t| {
                let key = normalize_concept_name(t);
                !self
                    .addressed_concepts
                    .iter()
                    .any(|a| normalize_concept_name(a) == key)
            })
            .cloned()
            .collect()
    }
}

/// Status of a spaced-repetition schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Waiting for its next-review time.
    #[default]
    Scheduled,
    /// Next-review time has passed.
    Due,
    /// Review cycle finished.
    Completed,
    /// Paused by the user; ignored by due queries.
    Paused,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewStatus::Scheduled => write!(f, "scheduled"),
            ReviewStatus::Due => write!(f, "due"),
            ReviewStatus::Completed => write!(f, "completed"),
            ReviewStatus::Paused => write!(f, "paused"),
        }
    }
}

impl std::str::FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(ReviewStatus::Scheduled),
            "due" => Ok(ReviewStatus::Due),
            "completed" => Ok(ReviewStatus::Completed),
            "paused" => Ok(ReviewStatus::Paused),
            _ => Err(format!("Unknown review status: {}", s)),
        }
    }
}

/// Spaced-repetition entry; one per (user, loop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSchedule {
    /// Unique schedule identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// The loop to re-test.
    pub loop_id: String,
    /// When the next review is due.
    pub next_review_at: DateTime<Utc>,
    /// Current interval in days.
    pub interval_days: i64,
    /// How many reviews have been completed.
    pub times_reviewed: i64,
    /// When the last review happened.
    pub last_reviewed_at: Option<DateTime<Utc>>,
    /// Score of the last review.
    pub last_score: Option<i64>,
    /// Schedule status.
    pub status: ReviewStatus,
}

impl ReviewSchedule {
    /// Create a new schedule due `interval_days` from now.
    pub fn new(
        user_id: impl Into<String>,
        loop_id: impl Into<String>,
        interval_days: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            loop_id: loop_id.into(),
            next_review_at: Utc::now() + Duration::days(interval_days),
            interval_days,
            times_reviewed: 0,
            last_reviewed_at: None,
            last_score: None,
            status: ReviewStatus::Scheduled,
        }
    }
}

/// A concept the user knows, joined with their aggregate stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownConcept {
    /// The concept.
    pub concept: Concept,
    /// The user's aggregate record for it.
    pub stats: UserConcept,
}

/// Absolute-value upsert of one user-concept record, computed by the
/// mastery engine from the prior record plus this loop's evidence.
#[derive(Debug, Clone)]
pub struct UserConceptUpsert {
    /// Owning user.
    pub user_id: String,
    /// Concept ID.
    pub concept_id: String,
    /// New stored mastery (0-100).
    pub mastery: i64,
    /// New encounter count.
    pub times_encountered: i64,
    /// New demonstration count.
    pub times_demonstrated: i64,
    /// Encounter timestamp.
    pub last_seen_at: DateTime<Utc>,
    /// Demonstration timestamp, when demonstrated in this fold.
    pub last_demonstrated_at: Option<DateTime<Utc>>,
}

/// Demonstration to record on a loop-concept link.
#[derive(Debug, Clone)]
pub struct Demonstration {
    /// Parent loop ID.
    pub loop_id: String,
    /// Concept ID.
    pub concept_id: String,
    /// Phase attributed to the demonstration.
    pub phase: LoopPhase,
    /// When demonstration was recorded.
    pub at: DateTime<Utc>,
}

/// Strength increment for one relationship edge.
#[derive(Debug, Clone)]
pub struct RelationshipBump {
    /// Source concept ID.
    pub from_concept_id: String,
    /// Target concept ID.
    pub to_concept_id: String,
    /// Relationship type.
    pub kind: RelationshipKind,
    /// Strength delta (1.0 per completed loop).
    pub delta: f64,
}

/// The complete write set of one loop-completion mastery fold.
///
/// Applied as a single transaction so a crash cannot double-count
/// encounters on a partially committed fold.
#[derive(Debug, Clone)]
pub struct MasteryFold {
    /// The loop row with status/phase already set to mastered/complete.
    pub loop_update: LearningLoop,
    /// Per-concept aggregate updates.
    pub user_concepts: Vec<UserConceptUpsert>,
    /// Demonstrations to mark on loop-concept links.
    pub demonstrations: Vec<Demonstration>,
    /// Relationship strength increments.
    pub relationship_bumps: Vec<RelationshipBump>,
}

/// Storage trait for database operations.
///
/// The persistence layer provides atomic upserts keyed by the unique
/// constraints on (user, concept), (loop, concept), and
/// (from, to, type); these are safe under concurrent execution across
/// loops that share concepts.
#[async_trait]
pub trait Storage: Send + Sync {
    // Concept operations

    /// Create a new concept. A concurrent insert of the same normalized
    /// name wins silently; re-fetch by normalized name for the canonical row.
    async fn create_concept(&self, concept: &Concept) -> StorageResult<()>;
    /// Get a concept by ID.
    async fn get_concept(&self, id: &str) -> StorageResult<Option<Concept>>;
    /// Look up a concept by its normalized name (the dedup key).
    async fn find_concept_by_normalized_name(
        &self,
        normalized_name: &str,
    ) -> StorageResult<Option<Concept>>;

    // Relationship operations

    /// Insert an edge if absent; an existing (from, to, type) edge is
    /// left untouched.
    async fn ensure_relationship(&self, relationship: &ConceptRelationship) -> StorageResult<()>;
    /// Get an edge by its (from, to, type) triple.
    async fn get_relationship(
        &self,
        from_concept_id: &str,
        to_concept_id: &str,
        kind: RelationshipKind,
    ) -> StorageResult<Option<ConceptRelationship>>;
    /// Edges whose both endpoints the user has a record for.
    async fn relationships_known_to_user(
        &self,
        user_id: &str,
    ) -> StorageResult<Vec<ConceptRelationship>>;
    /// Edges touching a concept, in either direction.
    async fn relationships_touching(
        &self,
        concept_id: &str,
    ) -> StorageResult<Vec<ConceptRelationship>>;

    // Loop operations

    /// Create a new learning loop.
    async fn create_loop(&self, learning_loop: &LearningLoop) -> StorageResult<()>;
    /// Get a loop by ID.
    async fn get_loop(&self, id: &str) -> StorageResult<Option<LearningLoop>>;
    /// Update an existing loop.
    async fn update_loop(&self, learning_loop: &LearningLoop) -> StorageResult<()>;
    /// Count all loops owned by a user.
    async fn count_loops(&self, user_id: &str) -> StorageResult<i64>;
    /// Count mastered loops owned by a user.
    async fn count_mastered_loops(&self, user_id: &str) -> StorageResult<i64>;

    // Loop-concept operations

    /// Link a concept to a loop; idempotent on (loop, concept), never
    /// clobbers an existing link's demonstration state.
    async fn upsert_loop_concept(&self, loop_concept: &LoopConcept) -> StorageResult<()>;
    /// All concept links of a loop.
    async fn loop_concepts(&self, loop_id: &str) -> StorageResult<Vec<LoopConcept>>;

    // Attempt operations

    /// Record an attempt and the loop's phase advance as one transaction.
    async fn record_attempt(
        &self,
        attempt: &LoopAttempt,
        updated_loop: &LearningLoop,
    ) -> StorageResult<()>;
    /// Get an attempt by ID.
    async fn get_attempt(&self, id: &str) -> StorageResult<Option<LoopAttempt>>;
    /// All attempts of a loop in submission order.
    async fn attempts_for_loop(&self, loop_id: &str) -> StorageResult<Vec<LoopAttempt>>;
    /// The most recent attempt of a loop.
    async fn latest_attempt(&self, loop_id: &str) -> StorageResult<Option<LoopAttempt>>;
    /// Count a user's attempts since a point in time (quota window).
    async fn count_attempts_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<i64>;

    // User-concept operations

    /// Get a user's record for a concept.
    async fn user_concept(
        &self,
        user_id: &str,
        concept_id: &str,
    ) -> StorageResult<Option<UserConcept>>;
    /// All of a user's concept records.
    async fn user_concepts(&self, user_id: &str) -> StorageResult<Vec<UserConcept>>;
    /// A user's concept records joined with the concepts themselves.
    async fn known_concepts(&self, user_id: &str) -> StorageResult<Vec<KnownConcept>>;

    /// Apply a completion fold atomically: loop update, user-concept
    /// upserts, demonstration marks, and relationship bumps.
    async fn apply_mastery_fold(&self, fold: &MasteryFold) -> StorageResult<()>;

    // Socratic session operations

    /// Create a new Socratic session.
    async fn create_session(&self, session: &SocraticSession) -> StorageResult<()>;
    /// Get a session by ID.
    async fn get_session(&self, id: &str) -> StorageResult<Option<SocraticSession>>;
    /// The active session of a loop, if any.
    async fn active_session_for_loop(
        &self,
        loop_id: &str,
    ) -> StorageResult<Option<SocraticSession>>;
    /// The most recently created session of a loop, in any status.
    async fn latest_session_for_loop(
        &self,
        loop_id: &str,
    ) -> StorageResult<Option<SocraticSession>>;
    /// Update an existing session.
    async fn update_session(&self, session: &SocraticSession) -> StorageResult<()>;

    // Review schedule operations

    /// Create a new review schedule.
    async fn create_schedule(&self, schedule: &ReviewSchedule) -> StorageResult<()>;
    /// Get a schedule by ID.
    async fn get_schedule(&self, id: &str) -> StorageResult<Option<ReviewSchedule>>;
    /// The schedule for a (user, loop) pair, if any.
    async fn schedule_for_loop(
        &self,
        user_id: &str,
        loop_id: &str,
    ) -> StorageResult<Option<ReviewSchedule>>;
    /// Update an existing schedule.
    async fn update_schedule(&self, schedule: &ReviewSchedule) -> StorageResult<()>;
    /// Schedules whose next-review time has passed, excluding paused ones.
    async fn due_schedules(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> StorageResult<Vec<ReviewSchedule>>;
}
