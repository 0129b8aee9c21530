//! # Teachback Engine
//!
//! The core engine of a teach-it-back learning product: users study a
//! piece of source material, explain it back in their own words, get
//! graded, remediate missed concepts through a Socratic dialogue, and
//! finish with a simplify challenge. Completed loops fold evidence into
//! a per-user mastery record and a concept relationship graph, and
//! strong finishes enter a spaced-repetition review schedule.
//!
//! ## Architecture
//!
//! ```text
//! Caller → LearningEngine (Rust) → LLM services (HTTP)
//!                  ↓
//!            SQLite (state)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use teachback_engine::{Config, LearningEngine};
//! use teachback_engine::engine::CreateLoopParams;
//! use teachback_engine::services::{AttemptQuota, LlmClient};
//! use teachback_engine::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let client = Arc::new(LlmClient::new(&config.llm, config.request.clone())?);
//!     let quota = Arc::new(AttemptQuota::new(storage.clone(), config.quota.clone()));
//!     let engine = LearningEngine::new(
//!         storage,
//!         client.clone(),
//!         client.clone(),
//!         client,
//!         quota,
//!         &config,
//!     );
//!     let learning_loop = engine
//!         .lifecycle
//!         .create_loop(CreateLoopParams::new("user-1", "Osmosis is..."))
//!         .await?;
//!     println!("{}", learning_loop.id);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Configuration management.
pub mod config;
/// The learning loop engine: lifecycle, mastery, graph, Socratic
/// sessions, review scheduling.
pub mod engine;
/// Error types and result aliases.
pub mod error;
/// LLM-backed services and the attempt quota.
pub mod services;
/// SQLite storage layer and the durable domain model.
pub mod storage;

pub use config::Config;
pub use engine::LearningEngine;
pub use error::{AppError, AppResult};
