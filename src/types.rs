//! Core types for the multi-intent question generator
//!
//! Everything here is plain data: the intent catalog entry, the weighted
//! mix a question is built from, and the record handed to persistence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A topic in the classification taxonomy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "primary_intent")]
    pub primary_category: String,
    #[serde(default)]
    pub key_signals: Vec<String>,
}

/// Weighted set of intents a single question blends.
///
/// A snapshot: weights are copied out of the weight table at draw time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentMix {
    pub entries: Vec<(u32, f64)>,
}

impl IntentMix {
    pub fn new(entries: Vec<(u32, f64)>) -> Self {
        Self { entries }
    }

    /// Even split across the given ids, dropping repeats (first occurrence wins)
    pub fn even(ids: &[u32]) -> Self {
        let mut unique: Vec<u32> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        if unique.is_empty() {
            return Self::default();
        }
        let weight = 1.0 / unique.len() as f64;
        Self {
            entries: unique.into_iter().map(|id| (id, weight)).collect(),
        }
    }

    pub fn ids(&self) -> Vec<u32> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn weight_sum(&self) -> f64 {
        self.entries.iter().map(|(_, w)| w).sum()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.iter().any(|(i, _)| *i == id)
    }
}

/// How hard the generated question should be to classify
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Medium,
    #[default]
    Hard,
    Expert,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::Expert => "expert",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            "expert" => Ok(Difficulty::Expert),
            other => Err(crate::Error::Config(format!("unknown difficulty: {}", other))),
        }
    }
}

/// An accepted question, ready for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub question: String,
    /// The sampled mix; authoritative for weight bookkeeping
    pub intents: IntentMix,
    /// What the generator claims the question covers (descriptive only)
    pub expected_intents: Vec<u32>,
    pub difficulty: Difficulty,
    pub confusion_points: Vec<String>,
    /// Max similarity against both pools at acceptance time
    pub similarity_score: f32,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Parameters for one orchestrated batch
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub batch_size: usize,
    pub difficulty: Difficulty,
    /// Intents per question when sampling
    pub mix_size: usize,
    /// Caller-fixed intents; overrides sampling when present
    pub target_intents: Option<Vec<u32>>,
}

impl Default for BatchRequest {
    fn default() -> Self {
        Self {
            batch_size: 10,
            difficulty: Difficulty::Hard,
            mix_size: 3,
            target_intents: None,
        }
    }
}

/// Running counters kept by the orchestrator across batches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorStats {
    pub total_generated: usize,
    pub total_rejected_duplicates: usize,
    /// Items dropped for being malformed or too short
    pub total_rejected_invalid: usize,
    pub acceptance_rate: f64,
    pub last_provider: Option<String>,
    pub last_model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_mix_dedupes_and_sums_to_one() {
        let mix = IntentMix::even(&[3, 7, 3, 9]);
        assert_eq!(mix.ids(), vec![3, 7, 9]);
        assert!((mix.weight_sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mix_serializes_as_pairs() {
        let mix = IntentMix::new(vec![(1, 0.6), (4, 0.4)]);
        let json = serde_json::to_string(&mix).unwrap();
        assert_eq!(json, "[[1,0.6],[4,0.4]]");
    }

    #[test]
    fn test_difficulty_parse() {
        assert_eq!("Expert".parse::<Difficulty>().unwrap(), Difficulty::Expert);
        assert!("easy".parse::<Difficulty>().is_err());
        assert_eq!(serde_json::to_string(&Difficulty::Medium).unwrap(), "\"medium\"");
    }

    #[test]
    fn test_intent_accepts_primary_intent_alias() {
        let intent: Intent = serde_json::from_str(
            r#"{"id": 4, "name": "Loans", "primary_intent": "finance", "key_signals": ["loan"]}"#,
        )
        .unwrap();
        assert_eq!(intent.primary_category, "finance");
        assert!(intent.description.is_empty());
    }
}
