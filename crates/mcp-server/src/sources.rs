//! Dataset sources backed by JSON files on disk.
//!
//! Each file holds an array of raw records. The file is re-read on every
//! query so an operator can refresh a dataset without restarting.

use std::path::PathBuf;

use async_trait::async_trait;
use biograph::{BiographError, DataSource, RawRecord, SourceKind, StructuredQuery};

use crate::config::SourceConfig;

pub struct DatasetFileSource {
    name: String,
    path: PathBuf,
    kind: SourceKind,
    reliability: f64,
}

impl DatasetFileSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            kind: config.kind,
            reliability: config.reliability,
        }
    }

    fn failure(&self, message: String) -> BiographError {
        BiographError::Source {
            source_name: self.name.clone(),
            message,
        }
    }
}

/// Whether `record` answers `query`: the entity types agree and either a
/// term occurs in the record's text or the record sits under the path hint.
fn matches(record: &RawRecord, query: &StructuredQuery) -> bool {
    if let (Some(wanted), Some(found)) = (&query.entity_type, &record.entity_type) {
        if wanted != found {
            return false;
        }
    }
    let in_hint = match (&query.taxonomy_hint, &record.taxonomy_path) {
        (Some(hint), Some(path)) => path.is_within(hint),
        _ => false,
    };
    if in_hint {
        return true;
    }

    let mut text = record.name.to_lowercase();
    if let Some(path) = &record.taxonomy_path {
        text.push(' ');
        text.push_str(&path.key().replace('/', " "));
    }
    if let Some(description) = record.metadata.get("description") {
        text.push(' ');
        text.push_str(&description.to_lowercase());
    }
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();
    query.terms.iter().any(|term| words.contains(&term.as_str()))
}

#[async_trait]
impl DataSource for DatasetFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn reliability(&self) -> f64 {
        self.reliability
    }

    async fn query(&self, query: &StructuredQuery) -> biograph::Result<Vec<RawRecord>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.failure(format!("cannot read {}: {e}", self.path.display())))?;
        let records: Vec<RawRecord> = serde_json::from_str(&raw)
            .map_err(|e| self.failure(format!("invalid dataset {}: {e}", self.path.display())))?;
        let found: Vec<RawRecord> = records
            .into_iter()
            .filter(|record| matches(record, query))
            .collect();
        tracing::debug!(source = %self.name, records = found.len(), "dataset queried");
        Ok(found)
    }
}
