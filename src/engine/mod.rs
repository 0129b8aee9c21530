//! The learning loop engine.
//!
//! Components map onto the engine's operations:
//! - [`LoopLifecycle`]: create/get loops, the prior-knowledge step,
//!   attempt submission, phase advancement and completion.
//! - [`SocraticTracker`]: start/continue/abandon remediation dialogues.
//! - [`ReviewScheduler`]: spaced-repetition schedules (due list,
//!   pause/resume, post-review advancement).
//! - [`KnowledgeGraph`]: graph view, concept detail, insights.
//!
//! [`LearningEngine`] wires them together over one storage handle and
//! one set of service clients.

pub mod concepts;
pub mod graph;
pub mod lifecycle;
pub mod mastery;
pub mod review;
pub mod socratic;

pub use concepts::ConceptLinker;
pub use graph::{ConceptDetail, GraphEdge, GraphNode, GraphStats, Insights, KnowledgeGraph, KnowledgeGraphView};
pub use lifecycle::{
    AttemptOutcome, CreateLoopParams, LoopDetail, LoopLifecycle, SubmitAttemptParams,
};
pub use mastery::MasteryFolder;
pub use review::{ReviewScheduler, REVIEW_TRIGGER_SCORE};
pub use socratic::{SocraticReply, SocraticTracker};

use std::sync::Arc;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::services::{EvaluationService, ExtractionService, QuotaChecker, SocraticService};
use crate::storage::{LearningLoop, SqliteStorage, Storage};

/// All engine components over shared storage and services.
pub struct LearningEngine {
    /// Loop state machine and attempts.
    pub lifecycle: LoopLifecycle,
    /// Socratic remediation sessions.
    pub socratic: SocraticTracker,
    /// Spaced-repetition schedules.
    pub reviews: ReviewScheduler,
    /// Read side of the concept store.
    pub graph: KnowledgeGraph,
}

impl LearningEngine {
    /// Wire up the engine.
    pub fn new(
        storage: SqliteStorage,
        extraction: Arc<dyn ExtractionService>,
        evaluation: Arc<dyn EvaluationService>,
        socratic: Arc<dyn SocraticService>,
        quota: Arc<dyn QuotaChecker>,
        config: &Config,
    ) -> Self {
        let linker = ConceptLinker::new(storage.clone());
        let folder = MasteryFolder::new(storage.clone(), linker.clone());
        let reviews = ReviewScheduler::new(storage.clone(), config.review.clone());

        let lifecycle = LoopLifecycle::new(
            storage.clone(),
            extraction,
            evaluation,
            quota,
            linker,
            folder,
            reviews.clone(),
            config.request.clone(),
        );
        let socratic = SocraticTracker::new(storage.clone(), socratic);
        let graph = KnowledgeGraph::new(storage);

        Self {
            lifecycle,
            socratic,
            reviews,
            graph,
        }
    }
}

/// Fetch a loop and verify ownership.
pub(crate) async fn owned_loop(
    storage: &SqliteStorage,
    user_id: &str,
    loop_id: &str,
) -> EngineResult<LearningLoop> {
    let learning_loop = storage
        .get_loop(loop_id)
        .await?
        .ok_or_else(|| EngineError::not_found("Loop", loop_id))?;
    if learning_loop.user_id != user_id {
        return Err(EngineError::AccessDenied {
            loop_id: loop_id.to_string(),
        });
    }
    Ok(learning_loop)
}
