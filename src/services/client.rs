use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::prompts::{
    EVALUATION_SYSTEM, EXTRACTION_SYSTEM, PRIOR_KNOWLEDGE_SYSTEM, QUICK_REVIEW_ADDENDUM,
    SIMPLIFY_ADDENDUM, SOCRATIC_OPENING_SYSTEM, SOCRATIC_TURN_SYSTEM,
};
use super::types::{Evaluation, EvaluationRequest, PriorKnowledgeAssessment, SocraticTurn};
use super::{EvaluationService, ExtractionService, SocraticService};
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::storage::{
    AttemptKind, ConceptLink, ConceptMap, KeyConcept, MessageRole, PrecisionMode, SessionMessage,
};

/// Client for an OpenAI-compatible chat completions API, backing the
/// extraction, evaluation, and Socratic services.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    llm_config: LlmConfig,
    request_config: RequestConfig,
}

impl LlmClient {
    /// Create a new client.
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ServiceError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            llm_config: config.clone(),
            request_config,
        })
    }

    /// Call the chat completions endpoint with retries and exponential
    /// backoff, returning the first choice's content.
    async fn chat(&self, model: &str, messages: &[ChatMessage]) -> ServiceResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages,
            temperature: 0.2,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    model = %model,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying LLM request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match self.execute_request(&url, &request).await {
                Ok(content) => {
                    let latency = start.elapsed();
                    info!(
                        model = %model,
                        latency_ms = latency.as_millis(),
                        "LLM call succeeded"
                    );
                    return Ok(content);
                }
                Err(e) => {
                    let latency = start.elapsed();
                    error!(
                        model = %model,
                        error = %e,
                        latency_ms = latency.as_millis(),
                        retry = retries,
                        "LLM call failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(ServiceError::Unavailable {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries,
        })
    }

    async fn execute_request(
        &self,
        url: &str,
        request: &ChatRequest<'_>,
    ) -> ServiceResult<String> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Calling LLM"
        );

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    ServiceError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let chat_response: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| ServiceError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse {
                message: "Response contained no choices".to_string(),
            })
    }
}

#[async_trait]
impl ExtractionService for LlmClient {
    async fn extract_concepts(
        &self,
        source_text: &str,
        mode: PrecisionMode,
    ) -> ServiceResult<ConceptMap> {
        let granularity = match mode {
            PrecisionMode::Essential => "Extract only the 3-5 essential concepts.",
            PrecisionMode::Balanced => "Extract the 5-10 concepts that matter most.",
            PrecisionMode::Precise => "Extract every distinct teachable concept.",
        };
        let messages = [
            ChatMessage::system(format!("{}\n\n{}", EXTRACTION_SYSTEM, granularity)),
            ChatMessage::user(source_text),
        ];

        let content = self
            .chat(&self.llm_config.extraction_model, &messages)
            .await?;
        let payload: ExtractionPayload = parse_json_payload(&content)?;
        Ok(payload.into_concept_map())
    }
}

#[async_trait]
impl EvaluationService for LlmClient {
    async fn evaluate_attempt(&self, request: EvaluationRequest) -> ServiceResult<Evaluation> {
        let mut system = EVALUATION_SYSTEM.to_string();
        match request.attempt_kind {
            AttemptKind::SimplifyChallenge => {
                system.push_str("\n\n");
                system.push_str(SIMPLIFY_ADDENDUM);
            }
            AttemptKind::QuickReview => {
                system.push_str("\n\n");
                system.push_str(QUICK_REVIEW_ADDENDUM);
            }
            AttemptKind::FullExplanation => {}
        }
        if request.precision_mode == PrecisionMode::Precise {
            system.push_str("\n\nGrade strictly; partial explanations do not count as covered.");
        }

        let user = format!(
            "Source material:\n{}\n\nTarget concepts:\n{}\n\nTranscript:\n{}",
            request.source_text,
            request.concept_names.join("\n"),
            request.transcript,
        );
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];

        let content = self
            .chat(&self.llm_config.evaluation_model, &messages)
            .await?;
        let mut evaluation: Evaluation = parse_json_payload(&content)?;
        evaluation.score = evaluation.score.clamp(0, 100);
        evaluation.coverage = evaluation.coverage.clamp(0.0, 1.0);
        evaluation.accuracy = evaluation.accuracy.clamp(0.0, 1.0);
        Ok(evaluation)
    }

    async fn assess_prior_knowledge(
        &self,
        source_text: &str,
        transcript: &str,
    ) -> ServiceResult<PriorKnowledgeAssessment> {
        let user = format!(
            "Source material (the user has NOT read this yet):\n{}\n\nWhat the user said they already know:\n{}",
            source_text, transcript,
        );
        let messages = [
            ChatMessage::system(PRIOR_KNOWLEDGE_SYSTEM),
            ChatMessage::user(user),
        ];

        let content = self
            .chat(&self.llm_config.evaluation_model, &messages)
            .await?;
        let mut assessment: PriorKnowledgeAssessment = parse_json_payload(&content)?;
        assessment.score = assessment.score.clamp(0, 100);
        Ok(assessment)
    }
}

#[async_trait]
impl SocraticService for LlmClient {
    async fn opening_question(
        &self,
        source_text: &str,
        missed_concepts: &[String],
    ) -> ServiceResult<String> {
        let user = format!(
            "Source material:\n{}\n\nMissed concepts:\n{}",
            source_text,
            missed_concepts.join("\n"),
        );
        let messages = [
            ChatMessage::system(SOCRATIC_OPENING_SYSTEM),
            ChatMessage::user(user),
        ];

        let content = self
            .chat(&self.llm_config.socratic_model, &messages)
            .await?;
        let payload: OpeningPayload = parse_json_payload(&content)?;
        Ok(payload.question)
    }

    async fn respond(
        &self,
        source_text: &str,
        remaining_concepts: &[String],
        history: &[SessionMessage],
        user_message: &str,
    ) -> ServiceResult<SocraticTurn> {
        let system = format!(
            "{}\n\nSource material:\n{}\n\nRemaining targets:\n{}",
            SOCRATIC_TURN_SYSTEM,
            source_text,
            remaining_concepts.join("\n"),
        );

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(system));
        for message in history {
            messages.push(ChatMessage {
                role: match message.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Assistant => "assistant".to_string(),
                },
                content: message.content.clone(),
            });
        }
        messages.push(ChatMessage::user(user_message));

        let content = self
            .chat(&self.llm_config.socratic_model, &messages)
            .await?;
        parse_json_payload(&content)
    }
}

/// Parse a JSON payload out of a model response, tolerating markdown
/// code fences around the object.
fn parse_json_payload<T: DeserializeOwned>(content: &str) -> ServiceResult<T> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|e| ServiceError::InvalidResponse {
        message: format!("Failed to parse payload: {}", e),
    })
}

// Wire types for the chat completions API

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpeningPayload {
    question: String,
}

// Wire types for the extraction payload. Importance and relationship
// type come back as free text; unrecognized values degrade softly
// instead of failing the whole payload.

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    concepts: Vec<ExtractedConcept>,
    #[serde(default)]
    relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Deserialize)]
struct ExtractedConcept {
    concept: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    importance: String,
}

#[derive(Debug, Deserialize)]
struct ExtractedRelationship {
    from: String,
    to: String,
    #[serde(rename = "type")]
    kind: String,
}

impl ExtractionPayload {
    fn into_concept_map(self) -> ConceptMap {
        let concepts = self
            .concepts
            .into_iter()
            .filter(|c| !c.concept.trim().is_empty())
            .map(|c| KeyConcept {
                name: c.concept,
                explanation: c.explanation,
                importance: c.importance.parse().unwrap_or_default(),
            })
            .collect();

        let relationships = self
            .relationships
            .into_iter()
            .filter_map(|r| {
                let kind = r.kind.parse().ok()?;
                Some(ConceptLink {
                    from: r.from,
                    to: r.to,
                    kind,
                })
            })
            .collect();

        ConceptMap {
            concepts,
            relationships,
        }
    }
}
