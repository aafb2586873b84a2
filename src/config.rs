//! Configuration for the generation pipeline
//!
//! Every knob has a default matching production settings; a JSON file can
//! override any subset of them. API keys are only ever read from the
//! environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tunables for the three weight-evolution strategies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionParams {
    /// Adaptive: boost when usage ratio falls below this fraction of the weight
    pub under_ratio: f64,
    /// Adaptive: decay when usage ratio exceeds this multiple of the weight
    pub over_ratio: f64,
    pub boost: f64,
    pub decay: f64,
    /// Random walk: Gaussian noise standard deviation
    pub noise_std: f64,
    /// Random walk: weights are floored here before renormalising
    pub noise_floor: f64,
    /// Coverage: multiplier for never-used intents
    pub unused_boost: f64,
    /// Coverage: multiplier for intents used fewer than `rare_below` times
    pub rare_boost: f64,
    pub rare_below: usize,
}

impl Default for EvolutionParams {
    fn default() -> Self {
        Self {
            under_ratio: 0.8,
            over_ratio: 1.2,
            boost: 1.1,
            decay: 0.95,
            noise_std: 0.02,
            noise_floor: 0.01,
            unused_boost: 2.0,
            rare_boost: 1.3,
            rare_below: 3,
        }
    }
}

/// Model identifiers per provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderModels {
    pub groq: String,
    pub gemini: String,
    pub huggingface: String,
    pub openrouter: String,
    pub anthropic: String,
}

impl Default for ProviderModels {
    fn default() -> Self {
        Self {
            groq: "llama-3.3-70b-versatile".to_string(),
            gemini: "gemini-2.5-flash".to_string(),
            huggingface: "Qwen/Qwen3-32B".to_string(),
            openrouter: "arcee-ai/trinity-large-preview:free".to_string(),
            anthropic: "claude-3-haiku-20240307".to_string(),
        }
    }
}

impl ProviderModels {
    pub fn for_provider(&self, name: &str) -> Option<&str> {
        match name {
            "groq" => Some(&self.groq),
            "gemini" => Some(&self.gemini),
            "huggingface" => Some(&self.huggingface),
            "openrouter" => Some(&self.openrouter),
            "anthropic" => Some(&self.anthropic),
            _ => None,
        }
    }
}

/// Central configuration for the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    // Paths
    pub data_dir: PathBuf,
    pub taxonomy_path: PathBuf,
    /// Description of the chatbot under test, handed to the generator as system context
    pub system_context_path: PathBuf,
    pub output_dir: PathBuf,
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    pub use_db: bool,

    // Generation
    pub batch_size: usize,
    pub total_questions: usize,
    /// Inclusive range of intents per question when not fixed by the caller
    pub intent_mix_sizes: (usize, usize),
    pub excluded_intents: Vec<u32>,

    // Similarity
    pub duplicate_threshold: f32,
    pub reference_threshold: f32,
    pub reference_top_k: usize,

    // Weight evolution
    /// Evolve every N accepted questions' worth of batches; 0 disables
    pub evolution_frequency: usize,
    pub evolution_strategy: String,
    pub min_weight: f64,
    pub max_weight: f64,
    pub evolution: EvolutionParams,

    // LLM calls
    pub max_tokens: u32,
    pub temperature: f64,
    pub max_retries: u32,
    /// Exponential backoff unit: sleep is unit * 2^attempt
    pub backoff_unit_ms: u64,
    /// Fixed pause after a capability-level runtime failure
    pub runtime_pause_ms: u64,
    pub rate_limit_cooldown_secs: u64,
    pub provider_priority: Vec<String>,
    pub models: ProviderModels,

    // Scheduler
    pub cron_interval_minutes: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            taxonomy_path: data_dir.join("intents").join("intent_taxonomy.json"),
            system_context_path: data_dir.join("prompts").join("agent_system_prompt.txt"),
            output_dir: data_dir.join("outputs"),
            model_dir: data_dir.join("models").join("minilm"),
            db_path: data_dir.join("questions.db"),
            data_dir,
            use_db: true,

            batch_size: 50,
            total_questions: 500,
            intent_mix_sizes: (2, 6),
            excluded_intents: vec![18, 25],

            duplicate_threshold: 0.85,
            reference_threshold: 0.70,
            reference_top_k: 5,

            evolution_frequency: 50,
            evolution_strategy: "adaptive".to_string(),
            min_weight: 0.01,
            max_weight: 0.30,
            evolution: EvolutionParams::default(),

            max_tokens: 2048,
            temperature: 0.5,
            max_retries: 3,
            backoff_unit_ms: 1000,
            runtime_pause_ms: 5000,
            rate_limit_cooldown_secs: 120,
            provider_priority: vec![
                "groq".to_string(),
                "gemini".to_string(),
                "huggingface".to_string(),
                "openrouter".to_string(),
                "anthropic".to_string(),
            ],
            models: ProviderModels::default(),

            cron_interval_minutes: 20,
        }
    }
}

impl GeneratorConfig {
    /// Load from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        let mut config: GeneratorConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config at {:?}", path))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("QGEN_USE_DB") {
            self.use_db = v.trim().eq_ignore_ascii_case("true") || v.trim() == "1";
        }
        if let Ok(v) = std::env::var("QGEN_DB_PATH") {
            if !v.trim().is_empty() {
                self.db_path = PathBuf::from(v.trim());
            }
        }
    }

    /// Reject settings that can never work
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error::Config;

        if self.min_weight <= 0.0 || self.min_weight > self.max_weight || self.max_weight > 1.0 {
            return Err(Config(format!(
                "weight bounds must satisfy 0 < min <= max <= 1 (min={}, max={})",
                self.min_weight, self.max_weight
            )));
        }
        for (name, t) in [
            ("duplicate_threshold", self.duplicate_threshold),
            ("reference_threshold", self.reference_threshold),
        ] {
            if !(-1.0..=1.0).contains(&t) {
                return Err(Config(format!("{} must lie in [-1, 1], got {}", name, t)));
            }
        }
        if self.max_retries == 0 {
            return Err(Config("max_retries must be at least 1".to_string()));
        }
        let (lo, hi) = self.intent_mix_sizes;
        if lo == 0 || lo > hi {
            return Err(Config(format!("invalid intent_mix_sizes range {}..={}", lo, hi)));
        }
        if self.batch_size == 0 {
            return Err(Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// API keys for one provider, comma-separated in the environment
pub fn parse_keys(env_var: &str) -> Vec<String> {
    std::env::var(env_var)
        .map(|raw| split_keys(&raw))
        .unwrap_or_default()
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

/// Get default data directory path
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("intent-qgen")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GeneratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.excluded_intents, vec![18, 25]);
        assert!((config.duplicate_threshold - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"batch_size": 12, "evolution": {{"boost": 1.25}}, "use_db": false}}"#
        )
        .unwrap();

        let config = GeneratorConfig::load(file.path()).unwrap();
        assert_eq!(config.batch_size, 12);
        assert!((config.evolution.boost - 1.25).abs() < 1e-9);
        assert!((config.evolution.decay - 0.95).abs() < 1e-9);
        assert_eq!(config.reference_top_k, 5);
    }

    #[test]
    fn test_retired_scheduler_key_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"cron_interval_minutes": 45, "cron_questions_per_run": 500}}"#
        )
        .unwrap();

        let config = GeneratorConfig::load(file.path()).unwrap();
        assert_eq!(config.cron_interval_minutes, 45);
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let config = GeneratorConfig {
            min_weight: 0.4,
            max_weight: 0.3,
            ..GeneratorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = GeneratorConfig {
            intent_mix_sizes: (4, 2),
            ..GeneratorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_keys() {
        assert_eq!(split_keys(" a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_keys("").is_empty());
    }
}
