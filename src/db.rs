//! SQLite persistence for generated questions and the reference corpus
//!
//! Single file, no server. Question text is hashed so re-inserting the
//! same question is a no-op; reference embeddings are stored as
//! little-endian f32 BLOBs.

use crate::embeddings::{from_blob, to_blob};
use crate::types::{GeneratedQuestion, IntentMix};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Initialize the database with schema
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {:?}", parent))?;
    }
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;

    conn.execute_batch(SCHEMA)?;

    Ok(conn)
}

const SCHEMA: &str = r#"
-- Accepted questions, one row per question
CREATE TABLE IF NOT EXISTS generated_questions (
    id TEXT PRIMARY KEY,
    question TEXT NOT NULL,
    question_hash TEXT NOT NULL UNIQUE,   -- sha256 of the question text
    intents_json TEXT NOT NULL,           -- [[id, weight], ...]
    expected_intents_json TEXT NOT NULL,  -- [id, ...]
    difficulty TEXT NOT NULL,
    confusion_points_json TEXT NOT NULL,
    similarity_score REAL NOT NULL,
    provider TEXT,
    model TEXT,
    generated_at TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    cron_run_id TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_questions_generated ON generated_questions(generated_at);
CREATE INDEX IF NOT EXISTS idx_questions_difficulty ON generated_questions(difficulty);
CREATE INDEX IF NOT EXISTS idx_questions_provider ON generated_questions(provider);
CREATE INDEX IF NOT EXISTS idx_questions_batch ON generated_questions(batch_id);
CREATE INDEX IF NOT EXISTS idx_questions_cron ON generated_questions(cron_run_id);

-- Reference corpus used for duplicate checks and retrieval
CREATE TABLE IF NOT EXISTS reference_questions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    question TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    imported_at TEXT DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Destination for accepted batches.
///
/// Failures are reported to the caller, which logs and carries on.
pub trait QuestionSink: Send {
    fn insert_questions(
        &mut self,
        questions: &[GeneratedQuestion],
        batch_id: &str,
        cron_run_id: Option<&str>,
    ) -> Result<usize>;
}

/// A question row as read back from storage
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoredQuestion {
    pub id: String,
    pub question: String,
    pub intents: IntentMix,
    pub expected_intents: Vec<u32>,
    pub difficulty: String,
    pub confusion_points: Vec<String>,
    pub similarity_score: f64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub generated_at: String,
    pub batch_id: String,
    pub cron_run_id: String,
}

const QUESTION_COLUMNS: &str = "id, question, intents_json, expected_intents_json, difficulty, \
     confusion_points_json, similarity_score, provider, model, generated_at, batch_id, cron_run_id";

fn row_to_question(row: &Row<'_>) -> rusqlite::Result<StoredQuestion> {
    let intents: String = row.get(2)?;
    let expected: String = row.get(3)?;
    let confusion: String = row.get(5)?;
    Ok(StoredQuestion {
        id: row.get(0)?,
        question: row.get(1)?,
        intents: serde_json::from_str(&intents).unwrap_or_default(),
        expected_intents: serde_json::from_str(&expected).unwrap_or_default(),
        difficulty: row.get(4)?,
        confusion_points: serde_json::from_str(&confusion).unwrap_or_default(),
        similarity_score: row.get(6)?,
        provider: row.get(7)?,
        model: row.get(8)?,
        generated_at: row.get(9)?,
        batch_id: row.get(10)?,
        cron_run_id: row.get(11)?,
    })
}

/// Content hash used to ignore repeated question text
pub fn question_hash(question: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(question.trim().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct QuestionStore {
    conn: Connection,
}

impl QuestionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = init_db(path)?;
        tracing::info!("Question store opened at {:?}", path);
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn question_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM generated_questions", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Questions whose expected intents include `intent_id`, newest first
    pub fn questions_by_intent(&self, intent_id: u32, limit: usize) -> Result<Vec<StoredQuestion>> {
        let sql = format!(
            "SELECT {} FROM generated_questions q
             WHERE EXISTS (SELECT 1 FROM json_each(q.expected_intents_json) WHERE value = ?1)
             ORDER BY generated_at DESC, rowid DESC LIMIT ?2",
            QUESTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![intent_id, limit as i64], row_to_question)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn questions_by_difficulty(&self, difficulty: &str, limit: usize) -> Result<Vec<StoredQuestion>> {
        let sql = format!(
            "SELECT {} FROM generated_questions WHERE difficulty = ?1
             ORDER BY generated_at DESC, rowid DESC LIMIT ?2",
            QUESTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![difficulty, limit as i64], row_to_question)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_questions(&self, limit: usize) -> Result<Vec<StoredQuestion>> {
        let sql = format!(
            "SELECT {} FROM generated_questions ORDER BY generated_at DESC, rowid DESC LIMIT ?1",
            QUESTION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_question)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Question count per provider, largest first
    pub fn provider_stats(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT COALESCE(provider, 'unknown') AS p, COUNT(*) AS n
            FROM generated_questions
            GROUP BY p
            ORDER BY n DESC, p
            "#,
        )?;
        let rows = stmt
            .query_map([], |row| {
                let n: i64 = row.get(1)?;
                Ok((row.get::<_, String>(0)?, n as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Store reference questions; texts already present are skipped
    pub fn import_reference(&mut self, entries: &[(String, Vec<f32>)]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO reference_questions (question, embedding) VALUES (?1, ?2)",
            )?;
            for (question, embedding) in entries {
                inserted += stmt.execute(params![question, to_blob(embedding)])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// The whole reference corpus, in import order
    pub fn load_reference_pool(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT question, embedding FROM reference_questions ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                let question: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((question, from_blob(&blob)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn reference_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM reference_questions", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl QuestionSink for QuestionStore {
    fn insert_questions(
        &mut self,
        questions: &[GeneratedQuestion],
        batch_id: &str,
        cron_run_id: Option<&str>,
    ) -> Result<usize> {
        if questions.is_empty() {
            return Ok(0);
        }

        let generated_at = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO generated_questions (
                    id, question, question_hash, intents_json, expected_intents_json,
                    difficulty, confusion_points_json, similarity_score, provider, model,
                    generated_at, batch_id, cron_run_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
            )?;
            for q in questions {
                inserted += stmt.execute(params![
                    uuid::Uuid::new_v4().to_string(),
                    q.question,
                    question_hash(&q.question),
                    serde_json::to_string(&q.intents)?,
                    serde_json::to_string(&q.expected_intents)?,
                    q.difficulty.as_str(),
                    serde_json::to_string(&q.confusion_points)?,
                    q.similarity_score as f64,
                    q.provider,
                    q.model,
                    generated_at,
                    batch_id,
                    cron_run_id.unwrap_or(""),
                ])?;
            }
        }
        tx.commit()?;

        tracing::info!("Inserted {} questions (batch_id={})", inserted, batch_id);
        Ok(inserted)
    }
}
