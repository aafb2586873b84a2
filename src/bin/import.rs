//! Import reference questions into the question store
//!
//! Usage: cargo run --bin import -- [--config=<path>] <files-or-dirs...>
//!
//! Each JSON file holds an array of entries, either plain strings or
//! `{"question": ..., "embedding": [...]}` objects. Entries without a
//! usable embedding are encoded with the local model.

use anyhow::{Context, Result};
use intent_qgen::{Embedder, GeneratorConfig, OnnxEmbedder, QuestionStore, EMBEDDING_DIM};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const ENCODE_CHUNK: usize = 32;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReferenceEntry {
    Object {
        #[serde(alias = "text")]
        question: String,
        #[serde(default)]
        embedding: Option<Vec<f32>>,
    },
    String(String),
}

impl ReferenceEntry {
    fn into_parts(self) -> (String, Option<Vec<f32>>) {
        match self {
            ReferenceEntry::Object { question, embedding } => (question, embedding),
            ReferenceEntry::String(s) => (s, None),
        }
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let inputs: Vec<&String> = args[1..].iter().filter(|a| !a.starts_with("--")).collect();

    if inputs.is_empty() {
        eprintln!("Usage: {} [--config=<path>] <files-or-dirs...>", args[0]);
        eprintln!("Example: {} data/reference_questions.json", args[0]);
        std::process::exit(1);
    }

    tracing_subscriber::fmt::init();
    let config = match args.iter().find_map(|a| a.strip_prefix("--config=")) {
        Some(path) => GeneratorConfig::load(Path::new(path))?,
        None => GeneratorConfig::from_env()?,
    };

    println!("Opening question store at {:?}", config.db_path);
    let mut store = QuestionStore::open(&config.db_path)?;

    let mut entries: Vec<(String, Option<Vec<f32>>)> = Vec::new();
    for arg in inputs {
        let path = PathBuf::from(arg);
        if !path.exists() {
            eprintln!("Warning: {} does not exist, skipping", arg);
            continue;
        }
        println!("\nProcessing: {:?}", path);

        for file in json_files(&path) {
            let fname = file.file_name().and_then(|n| n.to_str()).unwrap_or("?").to_string();
            match read_entries(&file) {
                Ok(found) => {
                    println!("  ✓ {} ({} questions)", fname, found.len());
                    entries.extend(found);
                }
                Err(e) => eprintln!("  ✗ {}: {:#}", fname, e),
            }
        }
    }

    let resolved = resolve_embeddings(&config, entries)?;
    let before = store.reference_count()?;
    let inserted = store.import_reference(&resolved)?;

    println!("\n========================================");
    println!("Import complete!");
    println!("  Read: {}", resolved.len());
    println!("  New: {}", inserted);
    println!("  Reference questions: {} -> {}", before, store.reference_count()?);
    println!("========================================");

    Ok(())
}

/// `path` itself, or every `.json` file beneath it
fn json_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

fn read_entries(path: &Path) -> Result<Vec<(String, Option<Vec<f32>>)>> {
    let content = fs::read_to_string(path)?;
    let parsed: Vec<ReferenceEntry> =
        serde_json::from_str(&content).context("expected a JSON array of questions")?;

    Ok(parsed
        .into_iter()
        .map(ReferenceEntry::into_parts)
        .map(|(q, e)| (q.trim().to_string(), e))
        .filter(|(q, _)| !q.is_empty())
        .collect())
}

/// Keep supplied embeddings of the right size, encode the rest
fn resolve_embeddings(
    config: &GeneratorConfig,
    entries: Vec<(String, Option<Vec<f32>>)>,
) -> Result<Vec<(String, Vec<f32>)>> {
    let mut resolved = Vec::with_capacity(entries.len());
    let mut missing = Vec::new();

    for (question, embedding) in entries {
        match embedding {
            Some(v) if v.len() == EMBEDDING_DIM => resolved.push((question, v)),
            Some(v) => {
                tracing::warn!(
                    "Re-encoding {:?}: embedding has {} dims, expected {}",
                    question,
                    v.len(),
                    EMBEDDING_DIM
                );
                missing.push(question);
            }
            None => missing.push(question),
        }
    }

    if missing.is_empty() {
        return Ok(resolved);
    }

    println!("\nEncoding {} questions...", missing.len());
    let mut embedder = OnnxEmbedder::new(&config.model_dir).context("Failed to load embedding model")?;
    let mut encoded = 0;
    for chunk in missing.chunks(ENCODE_CHUNK) {
        let texts: Vec<&str> = chunk.iter().map(String::as_str).collect();
        let vectors = embedder.encode(&texts)?;
        resolved.extend(chunk.iter().cloned().zip(vectors));
        encoded += chunk.len();
        println!("  {} / {}", encoded, missing.len());
    }

    Ok(resolved)
}
