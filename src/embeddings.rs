//! Local sentence embeddings
//!
//! ONNX Runtime running all-MiniLM-L6-v2 on CPU. Vectors are mean-pooled
//! over the token sequence and L2-normalized, so cosine similarity is a
//! dot product. The model is fetched from HuggingFace on first use.

use crate::similarity::Embedder;
use anyhow::{anyhow, Context, Result};
use ndarray::Array2;
use ort::{inputs, session::{builder::GraphOptimizationLevel, Session}, value::Tensor};
use std::path::Path;
use tokenizers::Tokenizer;

/// Embedding dimensions for all-MiniLM-L6-v2
pub const EMBEDDING_DIM: usize = 384;

/// Maximum sequence length for the model
const MAX_SEQ_LEN: usize = 256;

const MODEL_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";

/// Sentence encoder backed by an ONNX session
pub struct OnnxEmbedder {
    session: Session,
    tokenizer: Tokenizer,
}

impl OnnxEmbedder {
    /// Load the model from `model_dir`, downloading it if missing
    pub fn new(model_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(model_dir)?;

        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() || !tokenizer_path.exists() {
            Self::download_model(model_dir)?;
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("Failed to load ONNX model")?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        tracing::info!("Embedding model loaded from {:?}", model_dir);
        Ok(Self { session, tokenizer })
    }

    fn download_model(model_dir: &Path) -> Result<()> {
        use hf_hub::api::sync::Api;

        tracing::info!("Downloading embedding model ({})...", MODEL_REPO);
        let api = Api::new()?;
        let repo = api.model(MODEL_REPO.to_string());

        let model_path = repo.get("onnx/model.onnx")?;
        std::fs::copy(&model_path, model_dir.join("model.onnx"))?;

        let tokenizer_path = repo.get("tokenizer.json")?;
        std::fs::copy(&tokenizer_path, model_dir.join("tokenizer.json"))?;

        tracing::info!("Model downloaded to {:?}", model_dir);
        Ok(())
    }

    /// Embed a single text
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let len = encoding.get_ids().len().min(MAX_SEQ_LEN);
        let ids: Vec<i64> = encoding.get_ids()[..len].iter().map(|&id| id as i64).collect();
        let mask: Vec<i64> = encoding.get_attention_mask()[..len]
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_types = vec![0i64; len];

        let input_ids = Array2::from_shape_vec((1, len), ids)?;
        let attention = Array2::from_shape_vec((1, len), mask)?;
        let token_types = Array2::from_shape_vec((1, len), token_types)?;

        let outputs = self.session.run(inputs![
            "input_ids" => Tensor::from_array(input_ids)?,
            "attention_mask" => Tensor::from_array(attention)?,
            "token_type_ids" => Tensor::from_array(token_types)?,
        ])?;

        let output = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .ok_or_else(|| anyhow!("No embedding output found"))?;

        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let shape: Vec<i64> = shape.iter().copied().collect();
        let data: Vec<f32> = data.to_vec();
        drop(outputs);

        Ok(l2_normalize(&mean_pool_flat(&data, len, &shape)))
    }
}

impl Embedder for OnnxEmbedder {
    fn encode(&mut self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Mean over the sequence axis of a `[1, seq_len, dim]` tensor
fn mean_pool_flat(data: &[f32], seq_len: usize, shape: &[i64]) -> Vec<f32> {
    let embed_dim = if shape.len() >= 3 { shape[2] as usize } else { EMBEDDING_DIM };
    let mut result = vec![0.0f32; embed_dim];
    if seq_len == 0 {
        return result;
    }

    for i in 0..seq_len {
        for (j, slot) in result.iter_mut().enumerate() {
            if let Some(v) = data.get(i * embed_dim + j) {
                *slot += v;
            }
        }
    }

    for v in result.iter_mut() {
        *v /= seq_len as f32;
    }
    result
}

pub fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.iter().map(|x| x / norm).collect()
    } else {
        vec.to_vec()
    }
}

/// Little-endian f32 bytes, as stored in SQLite BLOB columns
pub fn to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_normalize() {
        let normalized = l2_normalize(&[3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 0.001);
        assert!((normalized[1] - 0.8).abs() < 0.001);

        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_mean_pool_flat() {
        // two tokens, three dims
        let data = [1.0, 2.0, 3.0, 3.0, 4.0, 5.0];
        let pooled = mean_pool_flat(&data, 2, &[1, 2, 3]);
        assert_eq!(pooled, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_blob_encoding() {
        let v = vec![0.25f32, -1.5, 3.0];
        let blob = to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(from_blob(&blob), v);
    }
}
