//! Shared test fixtures: deterministic stand-ins for the LLM-backed
//! services and an engine wired over in-memory storage.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use teachback_engine::config::{
    Config, DatabaseConfig, LlmConfig, LogFormat, LoggingConfig, QuotaConfig, RequestConfig,
    ReviewConfig,
};
use teachback_engine::engine::LearningEngine;
use teachback_engine::error::{EngineResult, ServiceError, ServiceResult};
use teachback_engine::services::{
    Evaluation, EvaluationRequest, EvaluationService, ExtractionService, PriorKnowledgeAssessment,
    QuotaChecker, SocraticService, SocraticTurn, UsageDecision,
};
use teachback_engine::storage::{
    ConceptLink, ConceptMap, Importance, KeyConcept, PrecisionMode, RelationshipKind,
    SessionMessage, SqliteStorage,
};

/// Config with no retry delays so degraded paths stay fast.
pub fn test_config() -> Config {
    Config {
        llm: LlmConfig {
            api_key: "test-key".to_string(),
            base_url: "http://localhost".to_string(),
            extraction_model: "test".to_string(),
            evaluation_model: "test".to_string(),
            socratic_model: "test".to_string(),
        },
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        },
        request: RequestConfig {
            timeout_ms: 1000,
            max_retries: 2,
            retry_delay_ms: 0,
        },
        quota: QuotaConfig::default(),
        review: ReviewConfig::default(),
    }
}

/// A two-concept map with one relationship, used across tests.
pub fn sample_map() -> ConceptMap {
    ConceptMap {
        concepts: vec![
            KeyConcept {
                name: "Osmosis".to_string(),
                explanation: "Water moves across a membrane".to_string(),
                importance: Importance::Core,
            },
            KeyConcept {
                name: "Turgor Pressure".to_string(),
                explanation: "Internal pressure keeps cells rigid".to_string(),
                importance: Importance::Supporting,
            },
        ],
        relationships: vec![ConceptLink {
            from: "Osmosis".to_string(),
            to: "Turgor Pressure".to_string(),
            kind: RelationshipKind::Causes,
        }],
    }
}

/// Extraction stub: serves a fixed map, or errors while `down` is set.
pub struct StubExtraction {
    map: ConceptMap,
    down: AtomicBool,
}

impl StubExtraction {
    pub fn new(map: ConceptMap) -> Self {
        Self {
            map,
            down: AtomicBool::new(false),
        }
    }

    pub fn down(map: ConceptMap) -> Self {
        let stub = Self::new(map);
        stub.down.store(true, Ordering::SeqCst);
        stub
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExtractionService for StubExtraction {
    async fn extract_concepts(
        &self,
        _source_text: &str,
        _mode: PrecisionMode,
    ) -> ServiceResult<ConceptMap> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable {
                message: "stub is down".to_string(),
                retries: 0,
            });
        }
        Ok(self.map.clone())
    }
}

/// Evaluation stub: pops scripted evaluations in order, falling back to
/// a fixed default once the script runs out.
pub struct ScriptedEvaluation {
    script: Mutex<VecDeque<Evaluation>>,
}

impl ScriptedEvaluation {
    pub fn new(script: Vec<Evaluation>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    pub fn scoring(scores: Vec<i64>) -> Self {
        Self::new(scores.into_iter().map(evaluation_with_score).collect())
    }
}

pub fn evaluation_with_score(score: i64) -> Evaluation {
    Evaluation {
        score,
        coverage: 1.0,
        accuracy: 1.0,
        covered_points: vec!["Osmosis".to_string(), "Turgor Pressure".to_string()],
        missed_points: Vec::new(),
        feedback: "Nice work".to_string(),
    }
}

#[async_trait]
impl EvaluationService for ScriptedEvaluation {
    async fn evaluate_attempt(&self, _request: EvaluationRequest) -> ServiceResult<Evaluation> {
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| evaluation_with_score(75)))
    }

    async fn assess_prior_knowledge(
        &self,
        _source_text: &str,
        _transcript: &str,
    ) -> ServiceResult<PriorKnowledgeAssessment> {
        Ok(PriorKnowledgeAssessment {
            analysis: "Knows the basics".to_string(),
            score: 40,
        })
    }
}

/// Socratic stub: pops scripted turns; defaults to an unaddressed question.
pub struct ScriptedSocratic {
    turns: Mutex<VecDeque<SocraticTurn>>,
}

impl ScriptedSocratic {
    pub fn new(turns: Vec<SocraticTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }

    pub fn addressing(concepts: Vec<Option<&str>>) -> Self {
        Self::new(
            concepts
                .into_iter()
                .map(|concept| SocraticTurn {
                    message: "And what follows from that?".to_string(),
                    addressed_concept: concept.map(str::to_string),
                })
                .collect(),
        )
    }
}

#[async_trait]
impl SocraticService for ScriptedSocratic {
    async fn opening_question(
        &self,
        _source_text: &str,
        _missed_concepts: &[String],
    ) -> ServiceResult<String> {
        Ok("What do you think happens to the water?".to_string())
    }

    async fn respond(
        &self,
        _source_text: &str,
        _remaining_concepts: &[String],
        _history: &[SessionMessage],
        _user_message: &str,
    ) -> ServiceResult<SocraticTurn> {
        let next = self.turns.lock().unwrap().pop_front();
        Ok(next.unwrap_or(SocraticTurn {
            message: "Tell me more.".to_string(),
            addressed_concept: None,
        }))
    }
}

/// Quota stub with a fixed decision.
pub struct FixedQuota {
    allowed: bool,
}

impl FixedQuota {
    pub fn allow() -> Self {
        Self { allowed: true }
    }

    pub fn deny() -> Self {
        Self { allowed: false }
    }
}

#[async_trait]
impl QuotaChecker for FixedQuota {
    async fn check_usage(&self, _user_id: &str) -> EngineResult<UsageDecision> {
        Ok(UsageDecision {
            allowed: self.allowed,
            remaining: if self.allowed { 10 } else { 0 },
            resets_at: Utc::now() + Duration::hours(1),
        })
    }
}

/// Engine over in-memory storage with the given stubs.
pub async fn build_engine(
    extraction: Arc<StubExtraction>,
    evaluation: Arc<ScriptedEvaluation>,
    socratic: Arc<ScriptedSocratic>,
    quota: Arc<FixedQuota>,
) -> (LearningEngine, SqliteStorage) {
    let storage = SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage");
    let engine = LearningEngine::new(
        storage.clone(),
        extraction,
        evaluation,
        socratic,
        quota,
        &test_config(),
    );
    (engine, storage)
}

/// Engine with healthy defaults: sample map, default evaluations, quota open.
pub async fn default_engine() -> (LearningEngine, SqliteStorage) {
    build_engine(
        Arc::new(StubExtraction::new(sample_map())),
        Arc::new(ScriptedEvaluation::new(Vec::new())),
        Arc::new(ScriptedSocratic::new(Vec::new())),
        Arc::new(FixedQuota::allow()),
    )
    .await
}
