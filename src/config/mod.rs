use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// LLM service settings.
    pub llm: LlmConfig,
    /// Database settings.
    pub database: DatabaseConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// HTTP request settings.
    pub request: RequestConfig,
    /// Attempt quota limits.
    pub quota: QuotaConfig,
    /// Spaced-repetition parameters.
    pub review: ReviewConfig,
}

/// LLM service configuration (extraction, evaluation, Socratic dialogue)
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API key for the chat completions endpoint.
    pub api_key: String,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Model used for concept extraction.
    pub extraction_model: String,
    /// Model used for attempt evaluation.
    pub evaluation_model: String,
    /// Model used for the Socratic dialogue.
    pub socratic_model: String,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Maximum pool connections.
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter level when RUST_LOG is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    /// Human-readable output.
    Pretty,
    /// Structured JSON output.
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries before giving up.
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub retry_delay_ms: u64,
}

/// Per-user attempt quota limits
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Attempts allowed per UTC calendar day.
    pub daily_attempts: u32,
    /// Attempts allowed per UTC calendar month.
    pub monthly_attempts: u32,
}

/// Spaced-repetition scheduling parameters
#[derive(Debug, Clone)]
pub struct ReviewConfig {
    /// Interval assigned when a schedule is first created.
    pub initial_interval_days: i64,
    /// Ceiling for the geometric backoff.
    pub max_interval_days: i64,
    /// Review score at or above which the interval grows.
    pub pass_score: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let llm = LlmConfig {
            api_key: env::var("LLM_API_KEY").map_err(|_| AppError::Config {
                message: "LLM_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            extraction_model: env::var("LLM_EXTRACTION_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            evaluation_model: env::var("LLM_EVALUATION_MODEL")
                .unwrap_or_else(|_| "gpt-4o".to_string()),
            socratic_model: env::var("LLM_SOCRATIC_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/teachback.db".to_string()),
            ),
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: env::var("REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30000),
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            retry_delay_ms: env::var("RETRY_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
        };

        let quota = QuotaConfig {
            daily_attempts: env::var("QUOTA_DAILY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),
            monthly_attempts: env::var("QUOTA_MONTHLY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
        };

        let review = ReviewConfig {
            initial_interval_days: env::var("REVIEW_INITIAL_INTERVAL_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            max_interval_days: env::var("REVIEW_MAX_INTERVAL_DAYS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            pass_score: env::var("REVIEW_PASS_SCORE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(80),
        };

        Ok(Config {
            llm,
            database,
            logging,
            request,
            quota,
            review,
        })
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_attempts: 20,
            monthly_attempts: 300,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            initial_interval_days: 3,
            max_interval_days: 60,
            pass_score: 80,
        }
    }
}
