//! Intent weight model
//!
//! Holds the per-intent sampling weights, draws intent mixes from them and
//! evolves them from usage history. Three evolution strategies trade
//! coverage against smoothness:
//!
//! - **adaptive**: proportional controller pulling realised usage toward the weights
//! - **random_walk**: unbiased Gaussian exploration
//! - **coverage_based**: sharp boost for neglected intents
//!
//! After every evolution step the table sums to 1 and each weight lies in
//! `[min_weight, max_weight]`.

use crate::config::{EvolutionParams, GeneratorConfig};
use crate::taxonomy::IntentTaxonomy;
use crate::types::IntentMix;
use crate::{Error, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Tolerance used when checking bounds and sums
const EPS: f64 = 1e-9;

/// Weight evolution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStrategy {
    Adaptive,
    RandomWalk,
    CoverageBased,
}

impl EvolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionStrategy::Adaptive => "adaptive",
            EvolutionStrategy::RandomWalk => "random_walk",
            EvolutionStrategy::CoverageBased => "coverage_based",
        }
    }
}

impl fmt::Display for EvolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "adaptive" => Ok(EvolutionStrategy::Adaptive),
            "random_walk" => Ok(EvolutionStrategy::RandomWalk),
            "coverage_based" => Ok(EvolutionStrategy::CoverageBased),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

/// Serializable snapshot of the model's evolution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionLog {
    pub generation_count: usize,
    /// Intent id (as string) -> normalized weight, 6 decimals
    pub current_weights: BTreeMap<String, f64>,
    pub weight_history_length: usize,
    pub intent_usage: BTreeMap<String, usize>,
}

/// Weighted intent sampler with usage-driven evolution
pub struct WeightModel {
    taxonomy: IntentTaxonomy,
    weights: BTreeMap<u32, f64>,
    usage_log: Vec<IntentMix>,
    weight_history: Vec<BTreeMap<u32, f64>>,
    params: EvolutionParams,
    min_weight: f64,
    max_weight: f64,
    rng: StdRng,
}

impl WeightModel {
    /// Uniform weights over the taxonomy's active intents
    pub fn new(taxonomy: IntentTaxonomy, config: &GeneratorConfig) -> Result<Self> {
        let n = taxonomy.active_ids().len();
        let uniform = 1.0 / n as f64;
        let weights = taxonomy.active_ids().iter().map(|id| (*id, uniform)).collect();
        Self::build(taxonomy, weights, config)
    }

    /// Start from caller-supplied weights (normalized, not clamped)
    pub fn with_weights(
        taxonomy: IntentTaxonomy,
        initial: &HashMap<u32, f64>,
        config: &GeneratorConfig,
    ) -> Result<Self> {
        for id in initial.keys() {
            if !taxonomy.is_active(*id) {
                return Err(Error::UnknownIntent(*id));
            }
        }
        let mut weights = BTreeMap::new();
        for id in taxonomy.active_ids() {
            let w = initial.get(id).copied().ok_or_else(|| {
                Error::Config(format!("initial weights missing intent {}", id))
            })?;
            if !w.is_finite() || w < 0.0 {
                return Err(Error::Config(format!("invalid weight {} for intent {}", w, id)));
            }
            weights.insert(*id, w);
        }
        if weights.values().sum::<f64>() <= 0.0 {
            return Err(Error::Config("initial weights sum to zero".to_string()));
        }
        normalize(&mut weights);
        Self::build(taxonomy, weights, config)
    }

    fn build(
        taxonomy: IntentTaxonomy,
        weights: BTreeMap<u32, f64>,
        config: &GeneratorConfig,
    ) -> Result<Self> {
        let n = weights.len() as f64;
        if n * config.min_weight > 1.0 + EPS || n * config.max_weight < 1.0 - EPS {
            return Err(Error::Config(format!(
                "weight bounds [{}, {}] cannot hold {} intents summing to 1",
                config.min_weight, config.max_weight, n
            )));
        }

        Ok(Self {
            taxonomy,
            weights,
            usage_log: Vec::new(),
            weight_history: Vec::new(),
            params: config.evolution.clone(),
            min_weight: config.min_weight,
            max_weight: config.max_weight,
            rng: StdRng::from_entropy(),
        })
    }

    /// Fix the RNG seed (reproducible draws and random walks)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn taxonomy(&self) -> &IntentTaxonomy {
        &self.taxonomy
    }

    pub fn weights(&self) -> &BTreeMap<u32, f64> {
        &self.weights
    }

    pub fn weight(&self, id: u32) -> Option<f64> {
        self.weights.get(&id).copied()
    }

    pub fn usage_log(&self) -> &[IntentMix] {
        &self.usage_log
    }

    pub fn generation_count(&self) -> usize {
        self.usage_log.len()
    }

    pub fn weight_history(&self) -> &[BTreeMap<u32, f64>] {
        &self.weight_history
    }

    /// Draw `n` distinct intents.
    ///
    /// Each draw uses the full weighted distribution; repeats are rejected
    /// and redrawn. The returned weights are renormalized within the mix
    /// and rounded to 3 decimals.
    pub fn sample_mix(&mut self, n: usize) -> Result<IntentMix> {
        if n == 0 {
            return Err(Error::Config("intent mix size must be at least 1".to_string()));
        }
        let available = self.weights.len();
        if n > available {
            return Err(Error::MixTooLarge { requested: n, available });
        }
        // Zero-weight intents can never be drawn
        let drawable = self.weights.values().filter(|w| **w > 0.0).count();
        if n > drawable {
            return Err(Error::MixTooLarge { requested: n, available: drawable });
        }

        let ids: Vec<u32> = self.weights.keys().copied().collect();
        let weights: Vec<f64> = self.weights.values().copied().collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::Config(format!("unusable weight table: {}", e)))?;

        let mut chosen: Vec<u32> = Vec::with_capacity(n);
        while chosen.len() < n {
            let id = ids[dist.sample(&mut self.rng)];
            if !chosen.contains(&id) {
                chosen.push(id);
            }
        }

        let raw: Vec<f64> = chosen.iter().map(|id| self.weights[id]).collect();
        let total: f64 = raw.iter().sum();
        let entries = chosen
            .into_iter()
            .zip(raw)
            .map(|(id, w)| (id, round_to(w / total, 3)))
            .collect();

        Ok(IntentMix::new(entries))
    }

    /// Append one accepted item's mix to the usage log
    pub fn record_usage(&mut self, mix: &IntentMix) {
        self.usage_log.push(mix.clone());
    }

    /// Times each intent has appeared in a recorded mix
    pub fn usage_counts(&self) -> HashMap<u32, usize> {
        let mut counts = HashMap::new();
        for mix in &self.usage_log {
            for (id, _) in &mix.entries {
                *counts.entry(*id).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Evolve by strategy name; unknown names are a configuration error
    pub fn evolve_named(&mut self, strategy: &str) -> Result<()> {
        let strategy: EvolutionStrategy = strategy.parse()?;
        self.evolve(strategy)
    }

    /// Recompute the weight table, then project it back onto the bounds
    pub fn evolve(&mut self, strategy: EvolutionStrategy) -> Result<()> {
        self.weight_history.push(self.weights.clone());

        match strategy {
            EvolutionStrategy::Adaptive => self.adaptive(),
            EvolutionStrategy::RandomWalk => self.random_walk()?,
            EvolutionStrategy::CoverageBased => self.coverage_based(),
        }

        self.project();

        tracing::info!(
            "Weights evolved (strategy={}). Top 5: {:?}",
            strategy,
            self.top_k(5)
        );
        Ok(())
    }

    fn adaptive(&mut self) {
        let usage = self.usage_counts();
        let total = usage.values().sum::<usize>().max(1) as f64;
        let p = &self.params;

        for (id, weight) in self.weights.iter_mut() {
            let usage_ratio = usage.get(id).copied().unwrap_or(0) as f64 / total;
            let expected_ratio = *weight;

            if usage_ratio < expected_ratio * p.under_ratio {
                *weight *= p.boost;
            } else if usage_ratio > expected_ratio * p.over_ratio {
                *weight *= p.decay;
            }
        }
    }

    fn random_walk(&mut self) -> Result<()> {
        let noise = Normal::new(0.0, self.params.noise_std)
            .map_err(|e| Error::Config(format!("invalid random-walk noise: {}", e)))?;
        let floor = self.params.noise_floor;

        for weight in self.weights.values_mut() {
            let perturbation: f64 = noise.sample(&mut self.rng);
            *weight = (*weight + perturbation).max(floor);
        }
        Ok(())
    }

    fn coverage_based(&mut self) {
        let usage = self.usage_counts();
        let p = &self.params;

        for (id, weight) in self.weights.iter_mut() {
            match usage.get(id).copied().unwrap_or(0) {
                0 => *weight *= p.unused_boost,
                n if n < p.rare_below => *weight *= p.rare_boost,
                _ => {}
            }
        }
    }

    /// Normalize, clamp, renormalize until stable.
    ///
    /// Solved directly: find the scale `s` with `sum(clamp(s * w)) == 1`.
    /// The map is monotone in `s`, so ordering between intents is kept.
    fn project(&mut self) {
        normalize(&mut self.weights);
        let (lo, hi) = (self.min_weight, self.max_weight);

        let mass = |s: f64, weights: &BTreeMap<u32, f64>| -> f64 {
            weights.values().map(|w| (s * w).clamp(lo, hi)).sum()
        };

        let mut s_lo = 0.0;
        let mut s_hi = 1.0;
        for _ in 0..64 {
            if mass(s_hi, &self.weights) >= 1.0 {
                break;
            }
            s_hi *= 2.0;
        }
        // Zero weights never scale up; with them pinned at `lo` the
        // positive weights can all hit `hi` and still fall short of 1
        let saturated = mass(s_hi, &self.weights) < 1.0 - EPS;
        if !saturated {
            for _ in 0..100 {
                let mid = 0.5 * (s_lo + s_hi);
                if mass(mid, &self.weights) < 1.0 {
                    s_lo = mid;
                } else {
                    s_hi = mid;
                }
            }
        }

        for w in self.weights.values_mut() {
            *w = (s_hi * *w).clamp(lo, hi);
        }

        let total: f64 = self.weights.values().sum();
        let residual = 1.0 - total;

        if saturated {
            // Everything below `hi` sits at `lo`; n * hi >= 1 keeps the share under `hi`
            let below = self.weights.values().filter(|w| **w < hi - EPS).count();
            if below > 0 {
                let share = residual / below as f64;
                for w in self.weights.values_mut() {
                    if *w < hi - EPS {
                        *w = (*w + share).min(hi);
                    }
                }
            }
            return;
        }

        // Bisection leaves a tiny residual; give it to the unclamped weights
        let free: f64 = self
            .weights
            .values()
            .filter(|w| **w > lo + EPS && **w < hi - EPS)
            .sum();
        if residual.abs() > 0.0 && free > 0.0 {
            let factor = (free + residual) / free;
            for w in self.weights.values_mut() {
                if *w > lo + EPS && *w < hi - EPS {
                    *w *= factor;
                }
            }
        }
    }

    /// Highest-weighted intents, weights rounded to 4 decimals
    pub fn top_k(&self, k: usize) -> Vec<(u32, f64)> {
        let mut sorted: Vec<(u32, f64)> = self.weights.iter().map(|(id, w)| (*id, *w)).collect();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted.truncate(k);
        sorted.into_iter().map(|(id, w)| (id, round_to(w, 4))).collect()
    }

    pub fn evolution_log(&self) -> EvolutionLog {
        let current_weights = self
            .weights
            .iter()
            .map(|(id, w)| (id.to_string(), round_to(*w, 6)))
            .collect();
        let intent_usage = self
            .usage_counts()
            .into_iter()
            .map(|(id, n)| (id.to_string(), n))
            .collect();

        EvolutionLog {
            generation_count: self.generation_count(),
            current_weights,
            weight_history_length: self.weight_history.len(),
            intent_usage,
        }
    }
}

fn normalize(weights: &mut BTreeMap<u32, f64>) {
    let total: f64 = weights.values().sum();
    if total > 0.0 {
        for w in weights.values_mut() {
            *w /= total;
        }
    } else if !weights.is_empty() {
        let uniform = 1.0 / weights.len() as f64;
        for w in weights.values_mut() {
            *w = uniform;
        }
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::sample_intents;
    use std::collections::HashSet;

    fn model() -> WeightModel {
        let taxonomy = IntentTaxonomy::new(sample_intents(28), &[18, 25]).unwrap();
        WeightModel::new(taxonomy, &GeneratorConfig::default())
            .unwrap()
            .with_seed(7)
    }

    fn assert_invariants(model: &WeightModel) {
        let config = GeneratorConfig::default();
        let sum: f64 = model.weights().values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "weights sum to {}", sum);
        for (id, w) in model.weights() {
            assert!(
                *w >= config.min_weight - EPS && *w <= config.max_weight + EPS,
                "intent {} weight {} out of bounds",
                id,
                w
            );
        }
    }

    #[test]
    fn test_uniform_initial_weights() {
        let model = model();
        assert_eq!(model.weights().len(), 26);
        for w in model.weights().values() {
            assert!((w - 1.0 / 26.0).abs() < 1e-12);
        }
        assert!((model.weight(1).unwrap() - 0.0385).abs() < 1e-4);
        assert!(model.weight(18).is_none());
    }

    #[test]
    fn test_sample_mix_distinct_and_normalized() {
        let mut model = model();
        for n in 1..=26 {
            let mix = model.sample_mix(n).unwrap();
            let ids: HashSet<u32> = mix.ids().into_iter().collect();
            assert_eq!(ids.len(), n);
            assert!(ids.iter().all(|id| *id != 18 && *id != 25));
            // rounding to 3 decimals may leave up to n * 0.0005 of slack
            assert!((mix.weight_sum() - 1.0).abs() <= 0.0005 * n as f64 + 1e-9);
        }
    }

    #[test]
    fn test_sample_mix_rejects_oversized_requests() {
        let mut model = model();
        assert!(matches!(
            model.sample_mix(27),
            Err(Error::MixTooLarge { requested: 27, available: 26 })
        ));
        assert!(matches!(model.sample_mix(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_sample_mix_skips_zero_weight_intents() {
        let taxonomy = IntentTaxonomy::new(sample_intents(4), &[]).unwrap();
        let initial: HashMap<u32, f64> = [(1, 0.5), (2, 0.5), (3, 0.0), (4, 0.0)].into();
        let config = GeneratorConfig {
            min_weight: 0.0001,
            ..GeneratorConfig::default()
        };
        let config = GeneratorConfig { max_weight: 0.9, ..config };
        let mut model = WeightModel::with_weights(taxonomy, &initial, &config)
            .unwrap()
            .with_seed(1);
        assert!(matches!(
            model.sample_mix(3),
            Err(Error::MixTooLarge { requested: 3, available: 2 })
        ));
        let mix = model.sample_mix(2).unwrap();
        assert!(mix.contains(1) && mix.contains(2));
    }

    #[test]
    fn test_every_strategy_keeps_invariants() {
        let mut model = model();
        for _ in 0..40 {
            let mix = model.sample_mix(3).unwrap();
            model.record_usage(&mix);
        }
        for strategy in [
            EvolutionStrategy::Adaptive,
            EvolutionStrategy::RandomWalk,
            EvolutionStrategy::CoverageBased,
        ] {
            model.evolve(strategy).unwrap();
            assert_invariants(&model);
        }
        assert_eq!(model.weight_history().len(), 3);
    }

    #[test]
    fn test_random_walk_never_escapes_bounds() {
        let mut model = model();
        for _ in 0..500 {
            model.evolve(EvolutionStrategy::RandomWalk).unwrap();
            assert_invariants(&model);
        }
    }

    #[test]
    fn test_adaptive_boosts_unused_and_decays_overused() {
        let mut model = model();
        // 50 usages: 1 and 2 appear 30 times, 3 appears 20 times
        let pairs = [(1, 2), (1, 3), (2, 4), (1, 5), (2, 3)];
        for i in 0..50 {
            let (a, b) = pairs[i % 5];
            model.record_usage(&IntentMix::new(vec![(a, 0.5), (b, 0.5)]));
        }
        let counts = model.usage_counts();
        assert_eq!(counts[&1], 30);
        assert_eq!(counts.get(&9), None);

        assert_eq!(counts[&3], 20);

        let before_unused = model.weight(9).unwrap();
        let before_used = model.weight(1).unwrap();
        let before_third = model.weight(3).unwrap();
        model.evolve(EvolutionStrategy::Adaptive).unwrap();

        assert!(model.weight(9).unwrap() > before_unused);
        assert!(model.weight(1).unwrap() < before_used);
        assert!(model.weight(3).unwrap() < before_third);
        assert_invariants(&model);
    }

    #[test]
    fn test_coverage_prefers_neglected_intents() {
        let mut model = model();
        for _ in 0..3 {
            model.record_usage(&IntentMix::new(vec![(1, 1.0)]));
        }
        model.record_usage(&IntentMix::new(vec![(2, 1.0)]));

        let ratio_before = model.weight(9).unwrap() / model.weight(1).unwrap();
        model.evolve(EvolutionStrategy::CoverageBased).unwrap();
        let ratio_after = model.weight(9).unwrap() / model.weight(1).unwrap();

        assert!(ratio_after > ratio_before);
        // rarely used sits between never used and well used
        assert!(model.weight(2).unwrap() < model.weight(9).unwrap());
        assert!(model.weight(2).unwrap() > model.weight(1).unwrap());
    }

    #[test]
    fn test_projection_handles_extreme_skew() {
        let taxonomy = IntentTaxonomy::new(sample_intents(4), &[]).unwrap();
        let initial: HashMap<u32, f64> = [(1, 0.01), (2, 0.01), (3, 0.01), (4, 0.97)].into();
        let config = GeneratorConfig {
            min_weight: 0.1,
            max_weight: 0.3,
            ..GeneratorConfig::default()
        };
        let mut model = WeightModel::with_weights(taxonomy, &initial, &config).unwrap();
        model.evolve(EvolutionStrategy::Adaptive).unwrap();

        let sum: f64 = model.weights().values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!((model.weight(4).unwrap() - 0.3).abs() < 1e-9);
        for id in 1..=3 {
            assert!((model.weight(id).unwrap() - 0.7 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_projection_lifts_zero_weights() {
        let taxonomy = IntentTaxonomy::new(sample_intents(4), &[]).unwrap();
        let initial: HashMap<u32, f64> = [(1, 1.0), (2, 0.0), (3, 0.0), (4, 0.0)].into();
        let config = GeneratorConfig::default();
        let mut model = WeightModel::with_weights(taxonomy, &initial, &config).unwrap();
        model.evolve(EvolutionStrategy::Adaptive).unwrap();

        let sum: f64 = model.weights().values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "weights sum to {}", sum);
        assert!((model.weight(1).unwrap() - config.max_weight).abs() < 1e-9);
        let rest = (1.0 - config.max_weight) / 3.0;
        for id in 2..=4 {
            let w = model.weight(id).unwrap();
            assert!((w - rest).abs() < 1e-9, "intent {} = {}", id, w);
            assert!(w <= config.max_weight + EPS);
        }
    }

    #[test]
    fn test_infeasible_bounds_rejected() {
        let taxonomy = IntentTaxonomy::new(sample_intents(28), &[18, 25]).unwrap();
        let config = GeneratorConfig {
            min_weight: 0.05,
            ..GeneratorConfig::default()
        };
        assert!(matches!(WeightModel::new(taxonomy, &config), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_strategy() {
        let mut model = model();
        assert!(matches!(
            model.evolve_named("simulated_annealing"),
            Err(Error::UnknownStrategy(_))
        ));
        assert!(model.weight_history().is_empty());
        assert!(model.evolve_named("coverage_based").is_ok());
    }

    #[test]
    fn test_evolution_log_shape() {
        let mut model = model();
        model.record_usage(&IntentMix::new(vec![(3, 0.5), (4, 0.5)]));
        model.evolve(EvolutionStrategy::Adaptive).unwrap();

        let log = model.evolution_log();
        assert_eq!(log.generation_count, 1);
        assert_eq!(log.weight_history_length, 1);
        assert_eq!(log.current_weights.len(), 26);
        assert_eq!(log.intent_usage.get("3"), Some(&1));

        let json = serde_json::to_value(&log).unwrap();
        assert!(json["current_weights"]["1"].is_number());
    }
}
