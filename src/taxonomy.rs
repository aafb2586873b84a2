//! Intent taxonomy: the static catalog of topics
//!
//! Loaded once from JSON and never mutated. Reserved (non-informational)
//! intents stay in the catalog but are excluded from generation.

use crate::types::Intent;
use crate::{Error, Result};
use anyhow::Context;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct IntentTaxonomy {
    intents: Vec<Intent>,
    active_ids: Vec<u32>,
}

impl IntentTaxonomy {
    /// Build from an in-memory catalog. Duplicate ids are a configuration error.
    pub fn new(intents: Vec<Intent>, excluded: &[u32]) -> Result<Self> {
        let mut seen = HashSet::new();
        for intent in &intents {
            if !seen.insert(intent.id) {
                return Err(Error::Config(format!("duplicate intent id {}", intent.id)));
            }
        }

        let active_ids: Vec<u32> = intents
            .iter()
            .map(|i| i.id)
            .filter(|id| !excluded.contains(id))
            .collect();

        if active_ids.is_empty() {
            return Err(Error::Config("taxonomy has no active intents".to_string()));
        }

        Ok(Self { intents, active_ids })
    }

    /// Load intents from a JSON array file
    pub fn load(path: &Path, excluded: &[u32]) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read taxonomy {:?}", path))?;
        let intents: Vec<Intent> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse taxonomy {:?}", path))?;
        tracing::info!("Loaded {} intents from {:?}", intents.len(), path);
        Ok(Self::new(intents, excluded)?)
    }

    /// Ids eligible for generation, in catalog order
    pub fn active_ids(&self) -> &[u32] {
        &self.active_ids
    }

    pub fn is_active(&self, id: u32) -> bool {
        self.active_ids.contains(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Intent> {
        self.intents.iter().find(|i| i.id == id)
    }

    /// Full intent records in the order the ids were given; unknown ids are skipped
    pub fn details(&self, ids: &[u32]) -> Vec<&Intent> {
        ids.iter().filter_map(|id| self.get(*id)).collect()
    }

    pub fn all(&self) -> &[Intent] {
        &self.intents
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn sample_intents(n: u32) -> Vec<Intent> {
    (1..=n)
        .map(|id| Intent {
            id,
            name: format!("Intent {}", id),
            description: format!("Questions about topic {}", id),
            primary_category: "general".to_string(),
            key_signals: vec![
                format!("signal-{}-a", id),
                format!("signal-{}-b", id),
                format!("signal-{}-c", id),
                format!("signal-{}-d", id),
            ],
        })
        .collect()
}
