use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::owned_loop;
use crate::error::{EngineError, EngineResult};
use crate::services::SocraticService;
use crate::storage::{
    normalize_concept_name, LoopPhase, MessageRole, SessionStatus, SocraticSession, SqliteStorage,
    Storage,
};

/// One exchange of the dialogue as returned to the caller.
#[derive(Debug, Clone)]
pub struct SocraticReply {
    /// The updated session.
    pub session: SocraticSession,
    /// The tutor's message for this turn.
    pub message: String,
    /// Target concept newly addressed by this turn, if any.
    pub addressed_concept: Option<String>,
    /// Whether this turn completed the session.
    pub completed: bool,
}

/// Runs Socratic remediation sessions over the concepts an attempt missed.
pub struct SocraticTracker {
    storage: SqliteStorage,
    socratic: Arc<dyn SocraticService>,
}

impl SocraticTracker {
    /// Create a new tracker.
    pub fn new(storage: SqliteStorage, socratic: Arc<dyn SocraticService>) -> Self {
        Self { storage, socratic }
    }

    /// Start a session over the missed points of an attempt (the latest
    /// one when `attempt_id` is absent) and move the loop into the
    /// learning phase. Returns the existing session when one is already
    /// active for the loop.
    pub async fn start_session(
        &self,
        user_id: &str,
        loop_id: &str,
        attempt_id: Option<&str>,
    ) -> EngineResult<SocraticSession> {
        let mut learning_loop = owned_loop(&self.storage, user_id, loop_id).await?;

        if let Some(existing) = self.storage.active_session_for_loop(loop_id).await? {
            return Ok(existing);
        }

        let attempt = match attempt_id {
            Some(id) => self
                .storage
                .get_attempt(id)
                .await?
                .ok_or_else(|| EngineError::not_found("Attempt", id))?,
            None => self
                .storage
                .latest_attempt(loop_id)
                .await?
                .ok_or_else(|| EngineError::invalid_state("loop has no attempt to remediate"))?,
        };
        if attempt.loop_id != loop_id {
            return Err(EngineError::invalid_state(
                "attempt belongs to a different loop",
            ));
        }
        if attempt.missed_points.is_empty() {
            return Err(EngineError::invalid_state(
                "nothing to remediate: the attempt missed no concepts",
            ));
        }

        let question = self
            .socratic
            .opening_question(&learning_loop.source_text, &attempt.missed_points)
            .await?;

        let mut session = SocraticSession::new(loop_id, attempt.missed_points.clone())
            .with_attempt(&attempt.id);
        session.push_message(MessageRole::Assistant, question);
        self.storage.create_session(&session).await?;

        if learning_loop.phase.can_advance_to(LoopPhase::Learning) {
            learning_loop.phase = LoopPhase::Learning;
            learning_loop.updated_at = Utc::now();
            self.storage.update_loop(&learning_loop).await?;
        }

        info!(
            loop_id = %loop_id,
            session_id = %session.id,
            targets = session.target_concepts.len(),
            "Started Socratic session"
        );
        Ok(session)
    }

    /// Feed the user's answer into the dialogue and return the tutor's
    /// next turn. Completing the target set completes the session and
    /// moves the loop to the second attempt.
    pub async fn continue_session(
        &self,
        user_id: &str,
        session_id: &str,
        user_message: &str,
    ) -> EngineResult<SocraticReply> {
        if user_message.trim().is_empty() {
            return Err(EngineError::invalid_state("message cannot be empty"));
        }

        let mut session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Session", session_id))?;
        let mut learning_loop = owned_loop(&self.storage, user_id, &session.loop_id).await?;

        if session.status != SessionStatus::Active {
            return Err(EngineError::invalid_state("session is not active"));
        }

        let remaining = session.remaining_concepts();
        let turn = self
            .socratic
            .respond(
                &learning_loop.source_text,
                &remaining,
                &session.messages,
                user_message,
            )
            .await?;

        session.push_message(MessageRole::User, user_message);
        session.push_message(MessageRole::Assistant, &turn.message);

        // Only concepts on the target list count toward completion.
        let mut addressed_concept = None;
        if let Some(concept) = &turn.addressed_concept {
            let key = normalize_concept_name(concept);
            let on_target = session
                .target_concepts
                .iter()
                .any(|t| normalize_concept_name(t) == key);
            if on_target && session.address(concept) {
                addressed_concept = Some(concept.clone());
            }
        }

        let completed = session.is_complete();
        if completed {
            session.status = SessionStatus::Completed;
        }
        self.storage.update_session(&session).await?;

        if completed && learning_loop.phase.can_advance_to(LoopPhase::SecondAttempt) {
            learning_loop.phase = LoopPhase::SecondAttempt;
            learning_loop.updated_at = Utc::now();
            self.storage.update_loop(&learning_loop).await?;
        }

        info!(
            session_id = %session_id,
            addressed = addressed_concept.as_deref().unwrap_or("-"),
            completed,
            "Socratic turn"
        );
        Ok(SocraticReply {
            message: turn.message,
            addressed_concept,
            completed,
            session,
        })
    }

    /// Mark a session abandoned. The loop keeps its phase; the user can
    /// move on without finishing the dialogue.
    pub async fn abandon_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> EngineResult<SocraticSession> {
        let mut session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Session", session_id))?;
        owned_loop(&self.storage, user_id, &session.loop_id).await?;

        if session.status != SessionStatus::Active {
            return Err(EngineError::invalid_state("session is not active"));
        }

        session.status = SessionStatus::Abandoned;
        session.updated_at = Utc::now();
        self.storage.update_session(&session).await?;
        Ok(session)
    }
}
