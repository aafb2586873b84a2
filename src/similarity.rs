//! Embedding-based duplicate detection
//!
//! Two pools of `(text, vector)` pairs: a fixed reference corpus loaded at
//! startup and the questions accepted during this run. Duplicate checks
//! scan both; nearest-neighbour retrieval only looks at the reference pool.

use crate::config::GeneratorConfig;
use crate::{Error, Result};

/// Text-to-vector capability.
///
/// Must be deterministic for identical input and keep one dimension for
/// the lifetime of a run.
pub trait Embedder: Send {
    fn encode(&mut self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Ordered, append-only `(text, vector)` store with a fixed dimension
#[derive(Debug, Clone, Default)]
pub struct EmbeddingPool {
    entries: Vec<(String, Vec<f32>)>,
    dim: Option<usize>,
}

impl EmbeddingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: String, vector: Vec<f32>) -> Result<()> {
        match self.dim {
            Some(expected) if expected != vector.len() => {
                return Err(Error::DimensionMismatch { expected, actual: vector.len() });
            }
            None => self.dim = Some(vector.len()),
            _ => {}
        }
        self.entries.push((text, vector));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dim
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.entries.iter().map(|(t, v)| (t.as_str(), v.as_slice()))
    }

    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.entries.iter().map(|(_, v)| v.as_slice())
    }
}

/// Cosine similarity in `[-1, 1]`; a zero-norm side yields 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Outcome of a duplicate check, carrying the embedding for reuse
#[derive(Debug, Clone)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub max_similarity: f32,
    pub embedding: Vec<f32>,
}

pub struct SimilarityEngine {
    embedder: Option<Box<dyn Embedder>>,
    reference: EmbeddingPool,
    generated: EmbeddingPool,
    duplicate_threshold: f32,
    reference_threshold: f32,
}

impl SimilarityEngine {
    /// Build with the reference corpus; it is never modified afterwards
    pub fn new(
        embedder: Option<Box<dyn Embedder>>,
        reference: Vec<(String, Vec<f32>)>,
        config: &GeneratorConfig,
    ) -> Result<Self> {
        let mut pool = EmbeddingPool::new();
        for (text, vector) in reference {
            pool.push(text, vector)?;
        }

        tracing::info!(
            "Similarity engine ready: {} reference questions (dim {:?}, embedder: {})",
            pool.len(),
            pool.dimension(),
            if embedder.is_some() { "yes" } else { "none" }
        );

        Ok(Self {
            embedder,
            reference: pool,
            generated: EmbeddingPool::new(),
            duplicate_threshold: config.duplicate_threshold,
            reference_threshold: config.reference_threshold,
        })
    }

    pub fn encode(&mut self, text: &str) -> Result<Vec<f32>> {
        self.encode_batch(&[text])?
            .pop()
            .ok_or_else(|| Error::Embedding(anyhow::anyhow!("embedder returned no vector")))
    }

    pub fn encode_batch(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let embedder = self.embedder.as_mut().ok_or(Error::EmbeddingUnavailable)?;
        let vectors = embedder.encode(texts).map_err(Error::Embedding)?;
        if vectors.len() != texts.len() {
            return Err(Error::Embedding(anyhow::anyhow!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    /// Dimension shared by both pools, once either holds a vector
    pub fn dimension(&self) -> Option<usize> {
        self.reference.dimension().or(self.generated.dimension())
    }

    fn ensure_dimension(&self, vector: &[f32]) -> Result<()> {
        match self.dimension() {
            Some(expected) if expected != vector.len() => {
                Err(Error::DimensionMismatch { expected, actual: vector.len() })
            }
            _ => Ok(()),
        }
    }

    /// Encode `text` and compare it against both pools.
    ///
    /// `threshold` defaults to the configured duplicate threshold.
    pub fn check(&mut self, text: &str, threshold: Option<f32>) -> Result<DuplicateCheck> {
        let threshold = threshold.unwrap_or(self.duplicate_threshold);
        let embedding = self.encode(text)?;
        self.ensure_dimension(&embedding)?;

        let max_similarity = self
            .reference
            .vectors()
            .chain(self.generated.vectors())
            .map(|v| cosine_similarity(&embedding, v))
            .fold(0.0f32, f32::max);

        Ok(DuplicateCheck {
            is_duplicate: max_similarity >= threshold,
            max_similarity,
            embedding,
        })
    }

    pub fn is_duplicate(&mut self, text: &str, threshold: Option<f32>) -> Result<(bool, f32)> {
        let check = self.check(text, threshold)?;
        Ok((check.is_duplicate, check.max_similarity))
    }

    /// Reference questions most similar to `query`, best first
    pub fn find_similar(
        &mut self,
        query: &str,
        top_k: usize,
        min_similarity: Option<f32>,
    ) -> Result<Vec<(String, f32)>> {
        let min_similarity = min_similarity.unwrap_or(self.reference_threshold);
        let embedding = self.encode(query)?;
        self.ensure_dimension(&embedding)?;

        let mut scored: Vec<(String, f32)> = self
            .reference
            .iter()
            .map(|(text, v)| (text.to_string(), cosine_similarity(&embedding, v)))
            .filter(|(_, score)| *score >= min_similarity)
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(top_k);
        Ok(scored)
    }

    /// Register an accepted question; encodes it when no vector is given
    pub fn add_generated(&mut self, text: &str, vector: Option<Vec<f32>>) -> Result<()> {
        let vector = match vector {
            Some(v) => v,
            None => self.encode(text)?,
        };
        self.ensure_dimension(&vector)?;
        self.generated.push(text.to_string(), vector)
    }

    pub fn reference_len(&self) -> usize {
        self.reference.len()
    }

    pub fn generated_len(&self) -> usize {
        self.generated.len()
    }

    pub fn total_tracked(&self) -> usize {
        self.reference.len() + self.generated.len()
    }

    pub fn generated_pool(&self) -> &EmbeddingPool {
        &self.generated
    }

    pub fn duplicate_threshold(&self) -> f32 {
        self.duplicate_threshold
    }
}

/// Bag-of-words embedder for tests: one dimension per distinct word
#[cfg(test)]
pub(crate) struct WordEmbedder {
    vocab: std::collections::HashMap<String, usize>,
    dim: usize,
}

#[cfg(test)]
impl WordEmbedder {
    pub(crate) fn new(dim: usize) -> Self {
        Self { vocab: std::collections::HashMap::new(), dim }
    }
}

#[cfg(test)]
impl Embedder for WordEmbedder {
    fn encode(&mut self, texts: &[&str]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let mut v = vec![0.0f32; self.dim];
            for word in text
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
            {
                let next = self.vocab.len();
                let idx = *self.vocab.entry(word.to_string()).or_insert(next);
                v[idx % self.dim] += 1.0;
            }
            out.push(v);
        }
        Ok(out)
    }
}
