//! Run metrics and the evolution schedule
//!
//! Quality statistics over the questions accepted in a run, plus the
//! rule deciding after which batches the weight table evolves.

use crate::similarity::cosine_similarity;
use crate::types::GeneratedQuestion;
use crate::weights::round_to;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Quality report for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub total_generated: usize,
    /// 1 - mean pairwise cosine similarity of accepted questions
    pub diversity: f64,
    /// Share of active intents used at least once
    pub intent_coverage: f64,
    pub duplication_rate: f64,
    pub difficulty_distribution: BTreeMap<String, usize>,
    pub avg_intents_per_question: f64,
    pub intent_distribution: BTreeMap<u32, usize>,
}

pub struct EvaluationMetrics {
    total_intents: usize,
}

impl EvaluationMetrics {
    pub fn new(total_intents: usize) -> Self {
        Self { total_intents }
    }

    /// `vectors` are the embeddings of `questions`, in any order
    pub fn calculate(
        &self,
        questions: &[GeneratedQuestion],
        rejected_duplicates: usize,
        vectors: &[&[f32]],
    ) -> MetricsReport {
        if questions.is_empty() {
            return MetricsReport::default();
        }

        let total = questions.len();
        let mut used = HashSet::new();
        let mut intent_distribution = BTreeMap::new();
        let mut difficulty_distribution = BTreeMap::new();
        let mut intent_slots = 0usize;

        for q in questions {
            for (id, _) in &q.intents.entries {
                used.insert(*id);
                *intent_distribution.entry(*id).or_insert(0) += 1;
            }
            intent_slots += q.intents.len();
            *difficulty_distribution
                .entry(q.difficulty.as_str().to_string())
                .or_insert(0) += 1;
        }

        MetricsReport {
            total_generated: total,
            diversity: diversity(vectors),
            intent_coverage: round_to(used.len() as f64 / self.total_intents.max(1) as f64, 4),
            duplication_rate: rejected_duplicates as f64 / (total + rejected_duplicates).max(1) as f64,
            difficulty_distribution,
            avg_intents_per_question: round_to(intent_slots as f64 / total as f64, 2),
            intent_distribution,
        }
    }
}

/// 1 - mean pairwise cosine over the upper triangle, 4 decimals
pub fn diversity(vectors: &[&[f32]]) -> f64 {
    if vectors.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut pairs = 0usize;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            sum += cosine_similarity(vectors[i], vectors[j]) as f64;
            pairs += 1;
        }
    }
    round_to(1.0 - sum / pairs as f64, 4)
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "\n{}", rule)?;
        writeln!(f, "  GENERATION QUALITY REPORT")?;
        writeln!(f, "{}", rule)?;
        writeln!(f, "  Total questions generated:  {}", self.total_generated)?;
        writeln!(f, "  Semantic diversity:         {:.4}", self.diversity)?;
        writeln!(f, "  Intent coverage:            {:.2}%", self.intent_coverage * 100.0)?;
        writeln!(f, "  Duplication rate:           {:.2}%", self.duplication_rate * 100.0)?;
        writeln!(f, "  Avg intents per question:   {:.1}", self.avg_intents_per_question)?;
        writeln!(f, "\n  Difficulty Distribution:")?;
        for (level, count) in &self.difficulty_distribution {
            writeln!(f, "    {:>8}: {}", level, count)?;
        }
        writeln!(f, "\n  Intent Usage (top 10):")?;
        let mut usage: Vec<(&u32, &usize)> = self.intent_distribution.iter().collect();
        usage.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (id, count) in usage.into_iter().take(10) {
            writeln!(f, "    Intent {:>2}: {} times", id, count)?;
        }
        writeln!(f, "{}", rule)
    }
}

/// Decides after which batches the weights evolve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvolutionSchedule {
    every: Option<usize>,
}

impl EvolutionSchedule {
    /// Every `max(1, frequency / batch_size)` batches; a frequency of 0 disables evolution
    pub fn new(evolution_frequency: usize, batch_size: usize) -> Self {
        if evolution_frequency == 0 {
            return Self::disabled();
        }
        Self {
            every: Some((evolution_frequency / batch_size.max(1)).max(1)),
        }
    }

    pub fn disabled() -> Self {
        Self { every: None }
    }

    pub fn interval(&self) -> Option<usize> {
        self.every
    }

    /// Whether to evolve after the batch at 0-based `batch_index`
    pub fn should_evolve(&self, batch_index: usize) -> bool {
        self.every.is_some_and(|every| (batch_index + 1) % every == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Difficulty, IntentMix};

    fn question(ids: &[u32], difficulty: Difficulty) -> GeneratedQuestion {
        GeneratedQuestion {
            question: format!("question about {:?}", ids),
            intents: IntentMix::even(ids),
            expected_intents: ids.to_vec(),
            difficulty,
            confusion_points: Vec::new(),
            similarity_score: 0.0,
            provider: None,
            model: None,
        }
    }

    #[test]
    fn test_empty_run_reports_zeros() {
        let report = EvaluationMetrics::new(26).calculate(&[], 5, &[]);
        assert_eq!(report, MetricsReport::default());
        assert!(report.to_string().contains("Total questions generated:  0"));
    }

    #[test]
    fn test_calculate() {
        let questions = vec![
            question(&[1, 2], Difficulty::Hard),
            question(&[2, 3, 4], Difficulty::Hard),
            question(&[1, 5], Difficulty::Medium),
        ];
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let c = [1.0f32, 0.0];
        let report = EvaluationMetrics::new(26).calculate(&questions, 1, &[&a, &b, &c]);

        assert_eq!(report.total_generated, 3);
        // pairs: (a,b)=0, (a,c)=1, (b,c)=0 -> mean 1/3
        assert!((report.diversity - 0.6667).abs() < 1e-9);
        assert!((report.intent_coverage - 0.1923).abs() < 1e-9);
        assert!((report.duplication_rate - 0.25).abs() < 1e-9);
        assert!((report.avg_intents_per_question - 2.33).abs() < 1e-9);
        assert_eq!(report.difficulty_distribution["hard"], 2);
        assert_eq!(report.intent_distribution[&2], 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["intent_distribution"]["2"], 2);
    }

    #[test]
    fn test_diversity_needs_two_vectors() {
        let a = [1.0f32, 0.0];
        assert_eq!(diversity(&[&a]), 0.0);
        assert_eq!(diversity(&[&a, &a]), 0.0);
    }

    #[test]
    fn test_evolution_schedule() {
        let schedule = EvolutionSchedule::new(50, 10);
        assert_eq!(schedule.interval(), Some(5));
        assert!(!schedule.should_evolve(3));
        assert!(schedule.should_evolve(4));
        assert!(schedule.should_evolve(9));

        // batches larger than the frequency evolve every batch
        assert_eq!(EvolutionSchedule::new(50, 100).interval(), Some(1));
        assert!(!EvolutionSchedule::new(0, 10).should_evolve(0));
        assert!(!EvolutionSchedule::disabled().should_evolve(0));
    }
}
