//! Generation orchestrator
//!
//! One batch runs start to finish through
//! `SAMPLING -> RETRIEVING_CONTEXT -> GENERATING -> VALIDATING -> DONE`.
//! Transient capability failures are retried with backoff and degrade to an
//! empty batch; only configuration and embedding errors escape.

use crate::config::GeneratorConfig;
use crate::error::GenerationError;
use crate::similarity::SimilarityEngine;
use crate::types::{BatchRequest, Difficulty, GeneratedQuestion, GeneratorStats, Intent, IntentMix};
use crate::weights::{round_to, EvolutionStrategy, WeightModel};
use crate::{Error, Result};
use serde_json::Value;
use std::time::Duration;

/// Minimum trimmed length of an acceptable question
const MIN_QUESTION_CHARS: usize = 10;

/// Key signals per intent folded into the reference search string
const SIGNALS_PER_INTENT: usize = 3;

/// One intent of the mix, with its full catalog entry
#[derive(Debug, Clone)]
pub struct MixEntry {
    pub intent: Intent,
    pub weight: f64,
}

/// Everything the generation capability receives for one call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_context: String,
    pub intents: Vec<MixEntry>,
    /// Reference questions to steer away from, most similar first
    pub reference_questions: Vec<(String, f32)>,
    pub difficulty: Difficulty,
    /// Questions accepted so far in this run
    pub running_count: usize,
    pub batch_size: usize,
}

/// Raw text returned by the capability plus provenance
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Opaque text-completion capability.
///
/// Provider rotation lives behind this trait; the orchestrator never
/// knows how many providers exist.
pub trait GenerationCapability: Send {
    fn generate(&mut self, request: &GenerationRequest) -> std::result::Result<Completion, GenerationError>;
}

/// Retry bound and pauses for capability calls
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_unit: Duration,
    pub runtime_pause: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_unit: Duration::from_millis(config.backoff_unit_ms),
            runtime_pause: Duration::from_millis(config.runtime_pause_ms),
        }
    }

    /// Pause before the attempt after a failed `attempt` (0-based):
    /// two units, then four, doubling from there
    fn pause_after(&self, attempt: u32, error: &GenerationError) -> Duration {
        match error {
            GenerationError::Runtime(_) => self.runtime_pause,
            _ => self.backoff_unit * 2u32.saturating_pow(attempt + 1),
        }
    }
}

#[derive(Debug)]
enum ParseFailure {
    Json(serde_json::Error),
    NotArray,
}

pub struct QuestionGenerator {
    weights: WeightModel,
    similarity: SimilarityEngine,
    capability: Box<dyn GenerationCapability>,
    system_context: String,
    retry: RetryPolicy,
    reference_top_k: usize,
    stats: GeneratorStats,
}

impl QuestionGenerator {
    pub fn new(
        weights: WeightModel,
        similarity: SimilarityEngine,
        capability: Box<dyn GenerationCapability>,
        system_context: String,
        config: &GeneratorConfig,
    ) -> Self {
        Self {
            weights,
            similarity,
            capability,
            system_context,
            retry: RetryPolicy::from_config(config),
            reference_top_k: config.reference_top_k,
            stats: GeneratorStats::default(),
        }
    }

    /// Run one batch. An empty result is a valid outcome.
    pub fn generate_batch(&mut self, request: &BatchRequest) -> Result<Vec<GeneratedQuestion>> {
        // SAMPLING
        let mix = self.choose_mix(request)?;
        tracing::info!(
            "Generating batch: size={}, difficulty={}, intents={:?}",
            request.batch_size,
            request.difficulty,
            mix.ids()
        );

        // RETRIEVING_CONTEXT
        let intents = self.mix_details(&mix);
        let search = search_string(&intents);
        let reference_questions = if search.is_empty() {
            Vec::new()
        } else {
            self.similarity.find_similar(&search, self.reference_top_k, None)?
        };

        // GENERATING
        let gen_request = GenerationRequest {
            system_context: self.system_context.clone(),
            intents,
            reference_questions,
            difficulty: request.difficulty,
            running_count: self.stats.total_generated,
            batch_size: request.batch_size,
        };
        let Some((items, completion)) = self.call_with_retry(&gen_request) else {
            tracing::error!(
                "Batch abandoned after {} attempts; returning no questions",
                self.retry.max_retries
            );
            return Ok(Vec::new());
        };

        // VALIDATING
        let raw_count = items.len();
        let mut accepted = Vec::new();
        let mut failure = None;
        for item in &items {
            let Some(candidate) = RawQuestion::from_value(item) else {
                self.stats.total_rejected_invalid += 1;
                continue;
            };

            let check = match self.similarity.check(&candidate.question, None) {
                Ok(check) => check,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if check.is_duplicate {
                self.stats.total_rejected_duplicates += 1;
                tracing::debug!(
                    "Rejected duplicate (sim={:.3}): {}",
                    check.max_similarity,
                    candidate.question
                );
                continue;
            }

            if let Err(e) = self.similarity.add_generated(&candidate.question, Some(check.embedding)) {
                failure = Some(e);
                break;
            }
            accepted.push(GeneratedQuestion {
                expected_intents: candidate.expected_intents.unwrap_or_else(|| mix.ids()),
                question: candidate.question,
                intents: mix.clone(),
                difficulty: request.difficulty,
                confusion_points: candidate.confusion_points,
                similarity_score: check.max_similarity,
                provider: completion.provider.clone(),
                model: completion.model.clone(),
            });
        }

        // DONE
        for _ in &accepted {
            self.weights.record_usage(&mix);
        }
        self.stats.total_generated += accepted.len();
        self.stats.last_provider = completion.provider;
        self.stats.last_model = completion.model;
        self.refresh_acceptance_rate();

        tracing::info!(
            "Batch complete: {}/{} accepted (total={}, duplicates={}, invalid={}, provider={:?}, model={:?})",
            accepted.len(),
            raw_count,
            self.stats.total_generated,
            self.stats.total_rejected_duplicates,
            self.stats.total_rejected_invalid,
            self.stats.last_provider,
            self.stats.last_model
        );

        // Questions already in the pool stay counted and are handed back
        match failure {
            Some(e) if accepted.is_empty() => Err(e),
            Some(e) => {
                tracing::error!(
                    "Validation stopped early, keeping {} accepted questions: {}",
                    accepted.len(),
                    e
                );
                Ok(accepted)
            }
            None => Ok(accepted),
        }
    }

    fn choose_mix(&mut self, request: &BatchRequest) -> Result<IntentMix> {
        match &request.target_intents {
            Some(ids) => {
                if ids.is_empty() {
                    return Err(Error::Config("target intent list is empty".to_string()));
                }
                if let Some(id) = ids.iter().find(|id| !self.weights.taxonomy().is_active(**id)) {
                    return Err(Error::UnknownIntent(*id));
                }
                Ok(IntentMix::even(ids))
            }
            None => self.weights.sample_mix(request.mix_size),
        }
    }

    fn mix_details(&self, mix: &IntentMix) -> Vec<MixEntry> {
        let taxonomy = self.weights.taxonomy();
        mix.entries
            .iter()
            .filter_map(|(id, weight)| {
                taxonomy.get(*id).map(|intent| MixEntry {
                    intent: intent.clone(),
                    weight: *weight,
                })
            })
            .collect()
    }

    fn call_with_retry(&mut self, request: &GenerationRequest) -> Option<(Vec<Value>, Completion)> {
        let max = self.retry.max_retries;

        for attempt in 0..max {
            match self.capability.generate(request) {
                Ok(completion) => match parse_items(&completion.text) {
                    Ok(items) => return Some((items, completion)),
                    Err(ParseFailure::Json(e)) => {
                        tracing::warn!("Attempt {}/{}: response is not valid JSON: {}", attempt + 1, max, e);
                    }
                    Err(ParseFailure::NotArray) => {
                        tracing::warn!("Attempt {}/{}: response is not a JSON array", attempt + 1, max);
                    }
                },
                Err(e) => {
                    tracing::error!("Attempt {}/{}: generation failed: {}", attempt + 1, max, e);
                    if attempt + 1 < max {
                        std::thread::sleep(self.retry.pause_after(attempt, &e));
                    }
                }
            }
        }
        None
    }

    fn refresh_acceptance_rate(&mut self) {
        let generated = self.stats.total_generated;
        let seen = (generated + self.stats.total_rejected_duplicates).max(1);
        self.stats.acceptance_rate = round_to(generated as f64 / seen as f64, 4);
    }

    pub fn stats(&self) -> &GeneratorStats {
        &self.stats
    }

    pub fn evolve(&mut self, strategy: EvolutionStrategy) -> Result<()> {
        self.weights.evolve(strategy)
    }

    pub fn weights(&self) -> &WeightModel {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut WeightModel {
        &mut self.weights
    }

    pub fn similarity(&self) -> &SimilarityEngine {
        &self.similarity
    }

    pub fn similarity_mut(&mut self) -> &mut SimilarityEngine {
        &mut self.similarity
    }
}

/// A validated raw item, before duplicate checking
#[derive(Debug)]
struct RawQuestion {
    question: String,
    expected_intents: Option<Vec<u32>>,
    confusion_points: Vec<String>,
}

impl RawQuestion {
    fn from_value(item: &Value) -> Option<Self> {
        let obj = item.as_object()?;
        let question = obj.get("question")?.as_str()?.trim();
        if question.chars().count() < MIN_QUESTION_CHARS {
            return None;
        }

        let expected_intents = obj.get("expected_intents").and_then(Value::as_array).map(|ids| {
            ids.iter()
                .filter_map(Value::as_u64)
                .filter_map(|id| u32::try_from(id).ok())
                .collect()
        });
        let confusion_points = obj
            .get("confusion_points")
            .and_then(Value::as_array)
            .map(|points| points.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();

        Some(Self {
            question: question.to_string(),
            expected_intents,
            confusion_points,
        })
    }
}

/// Intent names and their first few key signals
fn search_string(intents: &[MixEntry]) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for entry in intents {
        parts.push(&entry.intent.name);
        parts.extend(
            entry
                .intent
                .key_signals
                .iter()
                .take(SIGNALS_PER_INTENT)
                .map(String::as_str),
        );
    }
    parts.join(" ")
}

/// Drop an optional markdown code fence around the payload
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // skip the language tag line
    let body = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

fn parse_items(text: &str) -> std::result::Result<Vec<Value>, ParseFailure> {
    match serde_json::from_str::<Value>(strip_code_fence(text)) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(_) => Err(ParseFailure::NotArray),
        Err(e) => Err(ParseFailure::Json(e)),
    }
}
