//! LLM-backed services and the attempt quota.
//!
//! The engine talks to these through traits so tests can substitute
//! deterministic stand-ins; [`LlmClient`] implements the three
//! LLM-backed ones against an OpenAI-compatible chat completions API.

mod client;
mod prompts;
mod quota;
mod types;

pub use client::LlmClient;
pub use quota::AttemptQuota;
pub use types::{
    Evaluation, EvaluationRequest, ExtractionOutcome, PriorKnowledgeAssessment, SocraticTurn,
    UsageDecision,
};

use async_trait::async_trait;

use crate::error::{EngineResult, ServiceResult};
use crate::storage::{ConceptMap, PrecisionMode, SessionMessage};

/// Extracts a concept map from source material.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Extract concepts and relationships at the given granularity.
    async fn extract_concepts(
        &self,
        source_text: &str,
        mode: PrecisionMode,
    ) -> ServiceResult<ConceptMap>;
}

/// Grades explanation attempts and the prior-knowledge step.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvaluationService: Send + Sync {
    /// Grade one attempt against its target concepts.
    async fn evaluate_attempt(&self, request: EvaluationRequest) -> ServiceResult<Evaluation>;

    /// Assess what the user already knows before reading.
    async fn assess_prior_knowledge(
        &self,
        source_text: &str,
        transcript: &str,
    ) -> ServiceResult<PriorKnowledgeAssessment>;
}

/// Drives the Socratic remediation dialogue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SocraticService: Send + Sync {
    /// Produce the opening question over the missed concepts.
    async fn opening_question(
        &self,
        source_text: &str,
        missed_concepts: &[String],
    ) -> ServiceResult<String>;

    /// Produce the next tutor turn given the dialogue so far.
    async fn respond(
        &self,
        source_text: &str,
        remaining_concepts: &[String],
        history: &[SessionMessage],
        user_message: &str,
    ) -> ServiceResult<SocraticTurn>;
}

/// Decides whether a user may submit another attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaChecker: Send + Sync {
    /// Check the user's usage against the daily and monthly windows.
    async fn check_usage(&self, user_id: &str) -> EngineResult<UsageDecision>;
}
