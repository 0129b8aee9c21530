use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use super::{
    AttemptKind, Concept, ConceptLink, ConceptRelationship, KeyConcept, KnownConcept,
    LearningLoop, LoopAttempt, LoopConcept, LoopPhase, MasteryFold, RelationshipKind,
    ReviewSchedule, SessionMessage, SocraticSession, Storage, UserConcept,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory storage instance for testing
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration {
                message: format!("Failed to run migrations: {}", e),
            })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_dt(s: Option<&String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| {
        DateTime::parse_from_rfc3339(v)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn json_list<T: serde::de::DeserializeOwned>(s: &str) -> Vec<T> {
    serde_json::from_str(s).unwrap_or_default()
}

fn json_string<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_concept(&self, concept: &Concept) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO concepts (id, name, normalized_name, description, category, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (normalized_name) DO NOTHING
            "#,
        )
        .bind(&concept.id)
        .bind(&concept.name)
        .bind(&concept.normalized_name)
        .bind(&concept.description)
        .bind(&concept.category)
        .bind(concept.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_concept(&self, id: &str) -> StorageResult<Option<Concept>> {
        let row: Option<ConceptRow> = sqlx::query_as(
            r#"
            SELECT id, name, normalized_name, description, category, created_at
            FROM concepts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn find_concept_by_normalized_name(
        &self,
        normalized_name: &str,
    ) -> StorageResult<Option<Concept>> {
        let row: Option<ConceptRow> = sqlx::query_as(
            r#"
            SELECT id, name, normalized_name, description, category, created_at
            FROM concepts
            WHERE normalized_name = ?
            "#,
        )
        .bind(normalized_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn ensure_relationship(&self, relationship: &ConceptRelationship) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO concept_relationships
                (id, from_concept_id, to_concept_id, rel_type, strength, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (from_concept_id, to_concept_id, rel_type) DO NOTHING
            "#,
        )
        .bind(&relationship.id)
        .bind(&relationship.from_concept_id)
        .bind(&relationship.to_concept_id)
        .bind(relationship.kind.to_string())
        .bind(relationship.strength)
        .bind(relationship.created_at.to_rfc3339())
        .bind(relationship.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_relationship(
        &self,
        from_concept_id: &str,
        to_concept_id: &str,
        kind: RelationshipKind,
    ) -> StorageResult<Option<ConceptRelationship>> {
        let row: Option<RelationshipRow> = sqlx::query_as(
            r#"
            SELECT id, from_concept_id, to_concept_id, rel_type, strength, created_at, updated_at
            FROM concept_relationships
            WHERE from_concept_id = ? AND to_concept_id = ? AND rel_type = ?
            "#,
        )
        .bind(from_concept_id)
        .bind(to_concept_id)
        .bind(kind.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn relationships_known_to_user(
        &self,
        user_id: &str,
    ) -> StorageResult<Vec<ConceptRelationship>> {
        let rows: Vec<RelationshipRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.from_concept_id, r.to_concept_id, r.rel_type, r.strength,
                   r.created_at, r.updated_at
            FROM concept_relationships r
            JOIN user_concepts uf ON uf.concept_id = r.from_concept_id AND uf.user_id = ?
            JOIN user_concepts ut ON ut.concept_id = r.to_concept_id AND ut.user_id = ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn relationships_touching(
        &self,
        concept_id: &str,
    ) -> StorageResult<Vec<ConceptRelationship>> {
        let rows: Vec<RelationshipRow> = sqlx::query_as(
            r#"
            SELECT id, from_concept_id, to_concept_id, rel_type, strength, created_at, updated_at
            FROM concept_relationships
            WHERE from_concept_id = ? OR to_concept_id = ?
            "#,
        )
        .bind(concept_id)
        .bind(concept_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn create_loop(&self, learning_loop: &LearningLoop) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO learning_loops
                (id, user_id, subject, source_text, precision_mode, status, phase,
                 key_concepts, concept_links, extraction_degraded,
                 prior_knowledge_transcript, prior_knowledge_analysis, prior_knowledge_score,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&learning_loop.id)
        .bind(&learning_loop.user_id)
        .bind(&learning_loop.subject)
        .bind(&learning_loop.source_text)
        .bind(learning_loop.precision_mode.to_string())
        .bind(learning_loop.status.to_string())
        .bind(learning_loop.phase.to_string())
        .bind(json_string(&learning_loop.key_concepts))
        .bind(json_string(&learning_loop.concept_links))
        .bind(learning_loop.extraction_degraded)
        .bind(&learning_loop.prior_knowledge_transcript)
        .bind(&learning_loop.prior_knowledge_analysis)
        .bind(learning_loop.prior_knowledge_score)
        .bind(learning_loop.created_at.to_rfc3339())
        .bind(learning_loop.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_loop(&self, id: &str) -> StorageResult<Option<LearningLoop>> {
        let row: Option<LoopRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, subject, source_text, precision_mode, status, phase,
                   key_concepts, concept_links, extraction_degraded,
                   prior_knowledge_transcript, prior_knowledge_analysis, prior_knowledge_score,
                   created_at, updated_at
            FROM learning_loops
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update_loop(&self, learning_loop: &LearningLoop) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE learning_loops
            SET status = ?, phase = ?, key_concepts = ?, concept_links = ?,
                extraction_degraded = ?, prior_knowledge_transcript = ?,
                prior_knowledge_analysis = ?, prior_knowledge_score = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(learning_loop.status.to_string())
        .bind(learning_loop.phase.to_string())
        .bind(json_string(&learning_loop.key_concepts))
        .bind(json_string(&learning_loop.concept_links))
        .bind(learning_loop.extraction_degraded)
        .bind(&learning_loop.prior_knowledge_transcript)
        .bind(&learning_loop.prior_knowledge_analysis)
        .bind(learning_loop.prior_knowledge_score)
        .bind(learning_loop.updated_at.to_rfc3339())
        .bind(&learning_loop.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Loop",
                id: learning_loop.id.clone(),
            });
        }

        Ok(())
    }

    async fn count_loops(&self, user_id: &str) -> StorageResult<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM learning_loops WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0)
    }

    async fn count_mastered_loops(&self, user_id: &str) -> StorageResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM learning_loops WHERE user_id = ? AND status = 'mastered'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    async fn upsert_loop_concept(&self, loop_concept: &LoopConcept) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO loop_concepts
                (id, loop_id, concept_id, importance, explanation,
                 demonstrated, demonstrated_phase, demonstrated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (loop_id, concept_id) DO NOTHING
            "#,
        )
        .bind(&loop_concept.id)
        .bind(&loop_concept.loop_id)
        .bind(&loop_concept.concept_id)
        .bind(loop_concept.importance.to_string())
        .bind(&loop_concept.explanation)
        .bind(loop_concept.demonstrated)
        .bind(loop_concept.demonstrated_phase.map(|p| p.to_string()))
        .bind(loop_concept.demonstrated_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn loop_concepts(&self, loop_id: &str) -> StorageResult<Vec<LoopConcept>> {
        let rows: Vec<LoopConceptRow> = sqlx::query_as(
            r#"
            SELECT id, loop_id, concept_id, importance, explanation,
                   demonstrated, demonstrated_phase, demonstrated_at
            FROM loop_concepts
            WHERE loop_id = ?
            "#,
        )
        .bind(loop_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn record_attempt(
        &self,
        attempt: &LoopAttempt,
        updated_loop: &LearningLoop,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO loop_attempts
                (id, loop_id, attempt_number, attempt_type, transcript, duration_seconds,
                 score, coverage, accuracy, covered_points, missed_points, feedback,
                 speech_metrics, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.loop_id)
        .bind(attempt.attempt_number)
        .bind(attempt.kind.to_string())
        .bind(&attempt.transcript)
        .bind(attempt.duration_seconds)
        .bind(attempt.score)
        .bind(attempt.coverage)
        .bind(attempt.accuracy)
        .bind(json_string(&attempt.covered_points))
        .bind(json_string(&attempt.missed_points))
        .bind(&attempt.feedback)
        .bind(attempt.speech_metrics.as_ref().map(json_string))
        .bind(attempt.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE learning_loops
            SET status = ?, phase = ?, key_concepts = ?, concept_links = ?,
                extraction_degraded = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(updated_loop.status.to_string())
        .bind(updated_loop.phase.to_string())
        .bind(json_string(&updated_loop.key_concepts))
        .bind(json_string(&updated_loop.concept_links))
        .bind(updated_loop.extraction_degraded)
        .bind(updated_loop.updated_at.to_rfc3339())
        .bind(&updated_loop.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_attempt(&self, id: &str) -> StorageResult<Option<LoopAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(
            r#"
            SELECT id, loop_id, attempt_number, attempt_type, transcript, duration_seconds,
                   score, coverage, accuracy, covered_points, missed_points, feedback,
                   speech_metrics, created_at
            FROM loop_attempts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn attempts_for_loop(&self, loop_id: &str) -> StorageResult<Vec<LoopAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            r#"
            SELECT id, loop_id, attempt_number, attempt_type, transcript, duration_seconds,
                   score, coverage, accuracy, covered_points, missed_points, feedback,
                   speech_metrics, created_at
            FROM loop_attempts
            WHERE loop_id = ?
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(loop_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn latest_attempt(&self, loop_id: &str) -> StorageResult<Option<LoopAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(
            r#"
            SELECT id, loop_id, attempt_number, attempt_type, transcript, duration_seconds,
                   score, coverage, accuracy, covered_points, missed_points, feedback,
                   speech_metrics, created_at
            FROM loop_attempts
            WHERE loop_id = ?
            ORDER BY attempt_number DESC
            LIMIT 1
            "#,
        )
        .bind(loop_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn count_attempts_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM loop_attempts a
            JOIN learning_loops l ON l.id = a.loop_id
            WHERE l.user_id = ? AND a.created_at >= ?
            "#,
        )
        .bind(user_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }

    async fn user_concept(
        &self,
        user_id: &str,
        concept_id: &str,
    ) -> StorageResult<Option<UserConcept>> {
        let row: Option<UserConceptRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, concept_id, mastery, times_encountered, times_demonstrated,
                   last_seen_at, last_demonstrated_at
            FROM user_concepts
            WHERE user_id = ? AND concept_id = ?
            "#,
        )
        .bind(user_id)
        .bind(concept_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn user_concepts(&self, user_id: &str) -> StorageResult<Vec<UserConcept>> {
        let rows: Vec<UserConceptRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, concept_id, mastery, times_encountered, times_demonstrated,
                   last_seen_at, last_demonstrated_at
            FROM user_concepts
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn known_concepts(&self, user_id: &str) -> StorageResult<Vec<KnownConcept>> {
        let rows: Vec<KnownConceptRow> = sqlx::query_as(
            r#"
            SELECT c.id AS c_id, c.name AS c_name, c.normalized_name AS c_normalized_name,
                   c.description AS c_description, c.category AS c_category,
                   c.created_at AS c_created_at,
                   u.id AS u_id, u.user_id AS u_user_id, u.concept_id AS u_concept_id,
                   u.mastery AS u_mastery, u.times_encountered AS u_times_encountered,
                   u.times_demonstrated AS u_times_demonstrated,
                   u.last_seen_at AS u_last_seen_at,
                   u.last_demonstrated_at AS u_last_demonstrated_at
            FROM user_concepts u
            JOIN concepts c ON c.id = u.concept_id
            WHERE u.user_id = ?
            ORDER BY c.normalized_name ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn apply_mastery_fold(&self, fold: &MasteryFold) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        let learning_loop = &fold.loop_update;
        sqlx::query(
            r#"
            UPDATE learning_loops
            SET status = ?, phase = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(learning_loop.status.to_string())
        .bind(learning_loop.phase.to_string())
        .bind(learning_loop.updated_at.to_rfc3339())
        .bind(&learning_loop.id)
        .execute(&mut *tx)
        .await?;

        for upsert in &fold.user_concepts {
            sqlx::query(
                r#"
                INSERT INTO user_concepts
                    (id, user_id, concept_id, mastery, times_encountered, times_demonstrated,
                     last_seen_at, last_demonstrated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (user_id, concept_id) DO UPDATE SET
                    mastery = excluded.mastery,
                    times_encountered = excluded.times_encountered,
                    times_demonstrated = excluded.times_demonstrated,
                    last_seen_at = excluded.last_seen_at,
                    last_demonstrated_at =
                        COALESCE(excluded.last_demonstrated_at, last_demonstrated_at)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&upsert.user_id)
            .bind(&upsert.concept_id)
            .bind(upsert.mastery)
            .bind(upsert.times_encountered)
            .bind(upsert.times_demonstrated)
            .bind(upsert.last_seen_at.to_rfc3339())
            .bind(upsert.last_demonstrated_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        for demonstration in &fold.demonstrations {
            // An existing demonstration is never overwritten.
            sqlx::query(
                r#"
                UPDATE loop_concepts
                SET demonstrated = 1, demonstrated_phase = ?, demonstrated_at = ?
                WHERE loop_id = ? AND concept_id = ? AND demonstrated = 0
                "#,
            )
            .bind(demonstration.phase.to_string())
            .bind(demonstration.at.to_rfc3339())
            .bind(&demonstration.loop_id)
            .bind(&demonstration.concept_id)
            .execute(&mut *tx)
            .await?;
        }

        let now = fold.loop_update.updated_at;
        for bump in &fold.relationship_bumps {
            sqlx::query(
                r#"
                INSERT INTO concept_relationships
                    (id, from_concept_id, to_concept_id, rel_type, strength,
                     created_at, updated_at)
                VALUES (?, ?, ?, ?, 1.0, ?, ?)
                ON CONFLICT (from_concept_id, to_concept_id, rel_type) DO UPDATE SET
                    strength = strength + ?,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&bump.from_concept_id)
            .bind(&bump.to_concept_id)
            .bind(bump.kind.to_string())
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .bind(bump.delta)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_session(&self, session: &SocraticSession) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO socratic_sessions
                (id, loop_id, attempt_id, target_concepts, addressed_concepts, messages,
                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.loop_id)
        .bind(&session.attempt_id)
        .bind(json_string(&session.target_concepts))
        .bind(json_string(&session.addressed_concepts))
        .bind(json_string(&session.messages))
        .bind(session.status.to_string())
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<SocraticSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, loop_id, attempt_id, target_concepts, addressed_concepts, messages,
                   status, created_at, updated_at
            FROM socratic_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn active_session_for_loop(
        &self,
        loop_id: &str,
    ) -> StorageResult<Option<SocraticSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, loop_id, attempt_id, target_concepts, addressed_concepts, messages,
                   status, created_at, updated_at
            FROM socratic_sessions
            WHERE loop_id = ? AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(loop_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn latest_session_for_loop(
        &self,
        loop_id: &str,
    ) -> StorageResult<Option<SocraticSession>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, loop_id, attempt_id, target_concepts, addressed_concepts, messages,
                   status, created_at, updated_at
            FROM socratic_sessions
            WHERE loop_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(loop_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update_session(&self, session: &SocraticSession) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE socratic_sessions
            SET addressed_concepts = ?, messages = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(json_string(&session.addressed_concepts))
        .bind(json_string(&session.messages))
        .bind(session.status.to_string())
        .bind(session.updated_at.to_rfc3339())
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Session",
                id: session.id.clone(),
            });
        }

        Ok(())
    }

    async fn create_schedule(&self, schedule: &ReviewSchedule) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO review_schedules
                (id, user_id, loop_id, next_review_at, interval_days, times_reviewed,
                 last_reviewed_at, last_score, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.user_id)
        .bind(&schedule.loop_id)
        .bind(schedule.next_review_at.to_rfc3339())
        .bind(schedule.interval_days)
        .bind(schedule.times_reviewed)
        .bind(schedule.last_reviewed_at.map(|t| t.to_rfc3339()))
        .bind(schedule.last_score)
        .bind(schedule.status.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> StorageResult<Option<ReviewSchedule>> {
        let row: Option<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, loop_id, next_review_at, interval_days, times_reviewed,
                   last_reviewed_at, last_score, status
            FROM review_schedules
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn schedule_for_loop(
        &self,
        user_id: &str,
        loop_id: &str,
    ) -> StorageResult<Option<ReviewSchedule>> {
        let row: Option<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, loop_id, next_review_at, interval_days, times_reviewed,
                   last_reviewed_at, last_score, status
            FROM review_schedules
            WHERE user_id = ? AND loop_id = ?
            "#,
        )
        .bind(user_id)
        .bind(loop_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn update_schedule(&self, schedule: &ReviewSchedule) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE review_schedules
            SET next_review_at = ?, interval_days = ?, times_reviewed = ?,
                last_reviewed_at = ?, last_score = ?, status = ?
            WHERE id = ?
            "#,
        )
        .bind(schedule.next_review_at.to_rfc3339())
        .bind(schedule.interval_days)
        .bind(schedule.times_reviewed)
        .bind(schedule.last_reviewed_at.map(|t| t.to_rfc3339()))
        .bind(schedule.last_score)
        .bind(schedule.status.to_string())
        .bind(&schedule.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Schedule",
                id: schedule.id.clone(),
            });
        }

        Ok(())
    }

    async fn due_schedules(
        &self,
        user_id: &str,
        as_of: DateTime<Utc>,
    ) -> StorageResult<Vec<ReviewSchedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, loop_id, next_review_at, interval_days, times_reviewed,
                   last_reviewed_at, last_score, status
            FROM review_schedules
            WHERE user_id = ? AND status IN ('scheduled', 'due') AND next_review_at <= ?
            ORDER BY next_review_at ASC
            "#,
        )
        .bind(user_id)
        .bind(as_of.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// Internal row types for SQLx mapping

#[derive(sqlx::FromRow)]
struct ConceptRow {
    id: String,
    name: String,
    normalized_name: String,
    description: Option<String>,
    category: Option<String>,
    created_at: String,
}

impl From<ConceptRow> for Concept {
    fn from(row: ConceptRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            normalized_name: row.normalized_name,
            description: row.description,
            category: row.category,
            created_at: parse_dt(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RelationshipRow {
    id: String,
    from_concept_id: String,
    to_concept_id: String,
    rel_type: String,
    strength: f64,
    created_at: String,
    updated_at: String,
}

impl From<RelationshipRow> for ConceptRelationship {
    fn from(row: RelationshipRow) -> Self {
        Self {
            id: row.id,
            from_concept_id: row.from_concept_id,
            to_concept_id: row.to_concept_id,
            kind: row.rel_type.parse().unwrap_or(RelationshipKind::Enables),
            strength: row.strength,
            created_at: parse_dt(&row.created_at),
            updated_at: parse_dt(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct LoopRow {
    id: String,
    user_id: String,
    subject: Option<String>,
    source_text: String,
    precision_mode: String,
    status: String,
    phase: String,
    key_concepts: String,
    concept_links: String,
    extraction_degraded: bool,
    prior_knowledge_transcript: Option<String>,
    prior_knowledge_analysis: Option<String>,
    prior_knowledge_score: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl From<LoopRow> for LearningLoop {
    fn from(row: LoopRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            subject: row.subject,
            source_text: row.source_text,
            precision_mode: row.precision_mode.parse().unwrap_or_default(),
            status: row.status.parse().unwrap_or_default(),
            phase: row.phase.parse().unwrap_or(LoopPhase::FirstAttempt),
            key_concepts: json_list::<KeyConcept>(&row.key_concepts),
            concept_links: json_list::<ConceptLink>(&row.concept_links),
            extraction_degraded: row.extraction_degraded,
            prior_knowledge_transcript: row.prior_knowledge_transcript,
            prior_knowledge_analysis: row.prior_knowledge_analysis,
            prior_knowledge_score: row.prior_knowledge_score,
            created_at: parse_dt(&row.created_at),
            updated_at: parse_dt(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct LoopConceptRow {
    id: String,
    loop_id: String,
    concept_id: String,
    importance: String,
    explanation: Option<String>,
    demonstrated: bool,
    demonstrated_phase: Option<String>,
    demonstrated_at: Option<String>,
}

impl From<LoopConceptRow> for LoopConcept {
    fn from(row: LoopConceptRow) -> Self {
        Self {
            id: row.id,
            loop_id: row.loop_id,
            concept_id: row.concept_id,
            importance: row.importance.parse().unwrap_or_default(),
            explanation: row.explanation,
            demonstrated: row.demonstrated,
            demonstrated_phase: row.demonstrated_phase.and_then(|p| p.parse().ok()),
            demonstrated_at: parse_opt_dt(row.demonstrated_at.as_ref()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    loop_id: String,
    attempt_number: i64,
    attempt_type: String,
    transcript: String,
    duration_seconds: Option<i64>,
    score: i64,
    coverage: f64,
    accuracy: f64,
    covered_points: String,
    missed_points: String,
    feedback: String,
    speech_metrics: Option<String>,
    created_at: String,
}

impl From<AttemptRow> for LoopAttempt {
    fn from(row: AttemptRow) -> Self {
        Self {
            id: row.id,
            loop_id: row.loop_id,
            attempt_number: row.attempt_number,
            kind: row
                .attempt_type
                .parse()
                .unwrap_or(AttemptKind::FullExplanation),
            transcript: row.transcript,
            duration_seconds: row.duration_seconds,
            score: row.score,
            coverage: row.coverage,
            accuracy: row.accuracy,
            covered_points: json_list(&row.covered_points),
            missed_points: json_list(&row.missed_points),
            feedback: row.feedback,
            speech_metrics: row.speech_metrics.and_then(|s| serde_json::from_str(&s).ok()),
            created_at: parse_dt(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserConceptRow {
    id: String,
    user_id: String,
    concept_id: String,
    mastery: i64,
    times_encountered: i64,
    times_demonstrated: i64,
    last_seen_at: Option<String>,
    last_demonstrated_at: Option<String>,
}

impl From<UserConceptRow> for UserConcept {
    fn from(row: UserConceptRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            concept_id: row.concept_id,
            mastery: row.mastery,
            times_encountered: row.times_encountered,
            times_demonstrated: row.times_demonstrated,
            last_seen_at: parse_opt_dt(row.last_seen_at.as_ref()),
            last_demonstrated_at: parse_opt_dt(row.last_demonstrated_at.as_ref()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct KnownConceptRow {
    c_id: String,
    c_name: String,
    c_normalized_name: String,
    c_description: Option<String>,
    c_category: Option<String>,
    c_created_at: String,
    u_id: String,
    u_user_id: String,
    u_concept_id: String,
    u_mastery: i64,
    u_times_encountered: i64,
    u_times_demonstrated: i64,
    u_last_seen_at: Option<String>,
    u_last_demonstrated_at: Option<String>,
}

impl From<KnownConceptRow> for KnownConcept {
    fn from(row: KnownConceptRow) -> Self {
        Self {
            concept: Concept {
                id: row.c_id,
                name: row.c_name,
                normalized_name: row.c_normalized_name,
                description: row.c_description,
                category: row.c_category,
                created_at: parse_dt(&row.c_created_at),
            },
            stats: UserConcept {
                id: row.u_id,
                user_id: row.u_user_id,
                concept_id: row.u_concept_id,
                mastery: row.u_mastery,
                times_encountered: row.u_times_encountered,
                times_demonstrated: row.u_times_demonstrated,
                last_seen_at: parse_opt_dt(row.u_last_seen_at.as_ref()),
                last_demonstrated_at: parse_opt_dt(row.u_last_demonstrated_at.as_ref()),
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    loop_id: String,
    attempt_id: Option<String>,
    target_concepts: String,
    addressed_concepts: String,
    messages: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl From<SessionRow> for SocraticSession {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            loop_id: row.loop_id,
            attempt_id: row.attempt_id,
            target_concepts: json_list(&row.target_concepts),
            addressed_concepts: json_list(&row.addressed_concepts),
            messages: json_list::<SessionMessage>(&row.messages),
            status: row.status.parse().unwrap_or_default(),
            created_at: parse_dt(&row.created_at),
            updated_at: parse_dt(&row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    user_id: String,
    loop_id: String,
    next_review_at: String,
    interval_days: i64,
    times_reviewed: i64,
    last_reviewed_at: Option<String>,
    last_score: Option<i64>,
    status: String,
}

impl From<ScheduleRow> for ReviewSchedule {
    fn from(row: ScheduleRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            loop_id: row.loop_id,
            next_review_at: parse_dt(&row.next_review_at),
            interval_days: row.interval_days,
            times_reviewed: row.times_reviewed,
            last_reviewed_at: parse_opt_dt(row.last_reviewed_at.as_ref()),
            last_score: row.last_score,
            status: row.status.parse().unwrap_or_default(),
        }
    }
}
