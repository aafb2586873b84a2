//! intent-qgen - Multi-intent question generator
//!
//! Generates deliberately ambiguous questions that blend several intents,
//! for stress-testing an intent-classification chatbot. Topics are drawn
//! from a weighted taxonomy, semantic duplicates of a reference corpus are
//! rejected, and the weights drift toward under-covered topics over time.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use intent_qgen::{GeneratorConfig, Pipeline, RunPlan, run_generation};
//! use std::sync::atomic::AtomicBool;
//!
//! let config = GeneratorConfig::from_env()?;
//! let mut pipeline = Pipeline::build(config)?;
//! let plan = RunPlan::for_total(500, 50);
//! let outcome = run_generation(&mut pipeline, &plan, &AtomicBool::new(false))?;
//! println!("{}", outcome.metrics);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  QuestionGenerator                    │
//! │  sample mix → retrieve references → generate (retry) │
//! │  → validate + dedupe → record usage                  │
//! └───────┬───────────────┬─────────────────┬────────────┘
//!         ▼               ▼                 ▼
//!    WeightModel   SimilarityEngine   GenerationCapability
//!    (evolution)   (two pools)        (ProviderChain)
//! ```

pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod prompt;
pub mod providers;
pub mod runner;
pub mod similarity;
pub mod taxonomy;
pub mod types;
pub mod weights;

// Core types
pub use config::{EvolutionParams, GeneratorConfig};
pub use error::{Error, GenerationError, Result};
pub use types::*;

// Weight model and similarity
pub use similarity::{cosine_similarity, Embedder, SimilarityEngine};
pub use taxonomy::IntentTaxonomy;
pub use weights::{EvolutionLog, EvolutionStrategy, WeightModel};

// Orchestration
pub use generator::{Completion, GenerationCapability, GenerationRequest, QuestionGenerator};
pub use providers::{ChatProvider, ProviderChain};

// Persistence and runs
pub use db::{init_db, QuestionSink, QuestionStore};
pub use embeddings::{OnnxEmbedder, EMBEDDING_DIM};
pub use metrics::{EvaluationMetrics, EvolutionSchedule, MetricsReport};
pub use runner::{
    run_generation, run_schedule_loop, run_scheduled_job, Pipeline, RunOutcome, RunPlan, ScheduledJob,
};
