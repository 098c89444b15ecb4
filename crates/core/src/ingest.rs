//! Ingest Pipeline: free text → structured query → candidate labels.
//!
//! A batch moves through
//! `Received → Parsed → Queried → Proposed → {Accepted | Rejected}`, or ends
//! early in `Failed` (the prompt could not be interpreted) or `Cancelled`.
//! Nothing is written to the [`LabelStore`] until a reviewer accepts
//! candidates, and acceptance persists the selection in one transaction.
//!
//! Interpretation and external lookup are pluggable:
//!
//! - [`QueryInterpreter`] turns the prompt into a [`StructuredQuery`]. The
//!   built-in [`KeywordInterpreter`] is deterministic.
//! - [`DataSource`] answers a query with [`RawRecord`]s. Sources run
//!   concurrently, each under its own timeout; a slow or failing source is
//!   reported on the batch and the others still contribute.

pub mod catalog;
pub mod keyword;

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use catalog::CatalogSource;
pub use keyword::KeywordInterpreter;

use crate::confidence::{self, ConfidenceModel};
use crate::config::IngestConfig;
use crate::label_store::{self, LabelStore};
use crate::model::{
    BatchId, CandidateId, EntityType, Label, LabelId, NewLabel, SourceKind, TaxonomyPath,
};
use crate::{BiographError, Result};

// ---------------------------------------------------------------------------
// Strategy seams
// ---------------------------------------------------------------------------

/// Interpreted form of an ingest prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuery {
    pub entity_type: Option<EntityType>,
    pub taxonomy_hint: Option<TaxonomyPath>,
    /// Lower-cased search terms, stop words removed.
    pub terms: Vec<String>,
}

#[async_trait]
pub trait QueryInterpreter: Send + Sync {
    /// Interpret `prompt`. Fails with [`BiographError::Parse`] when nothing
    /// usable can be extracted.
    async fn interpret(
        &self,
        prompt: &str,
        entity_hint: Option<&EntityType>,
    ) -> Result<StructuredQuery>;
}

/// One record returned by a [`DataSource`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub name: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub taxonomy_path: Option<TaxonomyPath>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// The source's own confidence in the record; 1.0 when absent.
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Provenance stamped on labels built from this source's records.
    fn kind(&self) -> SourceKind {
        SourceKind::ExternalDataset
    }

    /// How far this source's records are trusted, in `[0, 1]`.
    fn reliability(&self) -> f64 {
        1.0
    }

    async fn query(&self, query: &StructuredQuery) -> Result<Vec<RawRecord>>;
}

// ---------------------------------------------------------------------------
// Batch records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Received,
    Parsed,
    Queried,
    Proposed,
    Accepted,
    Rejected,
    Failed,
    Cancelled,
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IngestState::Received => "received",
            IngestState::Parsed => "parsed",
            IngestState::Queried => "queried",
            IngestState::Proposed => "proposed",
            IngestState::Accepted => "accepted",
            IngestState::Rejected => "rejected",
            IngestState::Failed => "failed",
            IngestState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Accepted,
    Rejected,
}

/// What happened when one source was queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Ok { records: usize },
    TimedOut { after_ms: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_name: String,
    pub outcome: SourceOutcome,
}

/// A proposed label awaiting review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestCandidate {
    pub id: CandidateId,
    /// The label that acceptance will create (or match).
    pub label: NewLabel,
    /// Ranking confidence: the label confidence decayed by the source's
    /// provenance.
    pub provisional_confidence: f64,
    pub status: CandidateStatus,
    /// Every source that proposed this label.
    pub sources: Vec<String>,
    /// Set once accepted.
    pub accepted_label: Option<LabelId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub id: BatchId,
    pub prompt: String,
    pub entity_hint: Option<EntityType>,
    pub state: IngestState,
    pub query: Option<StructuredQuery>,
    pub candidates: Vec<IngestCandidate>,
    pub sources: Vec<SourceReport>,
    /// Why the batch failed, when it did.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IngestBatch {
    /// A fresh batch in the `Received` state.
    pub fn received(prompt: impl Into<String>, entity_hint: Option<EntityType>) -> Self {
        Self {
            id: BatchId::new(),
            prompt: prompt.into(),
            entity_hint,
            state: IngestState::Received,
            query: None,
            candidates: Vec::new(),
            sources: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn candidate(&self, id: &CandidateId) -> Option<&IngestCandidate> {
        self.candidates.iter().find(|c| &c.id == id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &IngestCandidate> {
        self.candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Pending)
    }

    fn expect_reviewable(&self) -> Result<()> {
        match self.state {
            IngestState::Proposed | IngestState::Accepted | IngestState::Rejected => Ok(()),
            other => Err(BiographError::InvalidArgument(format!(
                "batch {} is {other}, not awaiting review",
                self.id
            ))),
        }
    }

    /// Persist the `selected` candidates and reject every other pending one.
    ///
    /// All selected labels are written in one transaction, or none are.
    /// Selecting a candidate whose label already exists reuses that label.
    /// Calling again with the same selection returns the same labels and
    /// writes nothing new.
    pub fn accept(&mut self, store: &LabelStore<'_>, selected: &[CandidateId]) -> Result<Vec<Label>> {
        self.expect_reviewable()?;

        let mut indices: Vec<usize> = Vec::with_capacity(selected.len());
        for id in selected {
            let index = self
                .candidates
                .iter()
                .position(|c| &c.id == id)
                .ok_or_else(|| {
                    BiographError::NotFound(format!("candidate {id} in batch {}", self.id))
                })?;
            if self.candidates[index].status == CandidateStatus::Rejected {
                return Err(BiographError::InvalidArgument(format!(
                    "candidate {id} was already rejected"
                )));
            }
            if !indices.contains(&index) {
                indices.push(index);
            }
        }

        let fresh: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| self.candidates[i].accepted_label.is_none())
            .collect();
        let persisted = store.create_or_get_many(
            fresh
                .iter()
                .map(|&i| self.candidates[i].label.clone())
                .collect(),
        )?;
        for (&i, (label, created)) in fresh.iter().zip(&persisted) {
            let candidate = &mut self.candidates[i];
            candidate.status = CandidateStatus::Accepted;
            candidate.accepted_label = Some(label.id.clone());
            if !created {
                tracing::debug!(
                    batch_id = %self.id,
                    label_id = %label.id,
                    "accepted candidate matched an existing label"
                );
            }
        }

        let mut labels = Vec::with_capacity(indices.len());
        for &i in &indices {
            match &self.candidates[i].accepted_label {
                Some(label_id) => labels.push(store.get(label_id)?),
                None => {
                    return Err(BiographError::Internal(format!(
                        "candidate {} accepted without a label",
                        self.candidates[i].id
                    )))
                }
            }
        }

        let rejected = self.reject_pending();
        self.state = if self
            .candidates
            .iter()
            .any(|c| c.status == CandidateStatus::Accepted)
        {
            IngestState::Accepted
        } else {
            IngestState::Rejected
        };
        tracing::info!(
            batch_id = %self.id,
            accepted = labels.len(),
            rejected,
            "ingest batch reviewed"
        );
        Ok(labels)
    }

    /// Reject every pending candidate. The label store is not touched.
    pub fn reject(&mut self) -> Result<usize> {
        self.expect_reviewable()?;
        let rejected = self.reject_pending();
        if self.state == IngestState::Proposed {
            self.state = IngestState::Rejected;
        }
        tracing::info!(batch_id = %self.id, rejected, "ingest batch rejected");
        Ok(rejected)
    }

    fn reject_pending(&mut self) -> usize {
        let mut count = 0;
        for candidate in &mut self.candidates {
            if candidate.status == CandidateStatus::Pending {
                candidate.status = CandidateStatus::Rejected;
                count += 1;
            }
        }
        count
    }

    fn cancelled(&mut self) -> BiographError {
        self.state = IngestState::Cancelled;
        tracing::info!(batch_id = %self.id, "ingest batch cancelled");
        BiographError::Cancelled(self.id.clone())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

struct SourceMeta {
    name: String,
    kind: SourceKind,
    reliability: f64,
}

pub struct IngestPipeline {
    interpreter: Arc<dyn QueryInterpreter>,
    sources: Vec<Arc<dyn DataSource>>,
    model: ConfidenceModel,
    config: IngestConfig,
}

impl IngestPipeline {
    pub fn new(
        interpreter: Arc<dyn QueryInterpreter>,
        model: ConfidenceModel,
        config: IngestConfig,
    ) -> Self {
        Self {
            interpreter,
            sources: Vec::new(),
            model,
            config,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn add_source(&mut self, source: Arc<dyn DataSource>) {
        self.sources.push(source);
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Run a new batch for `prompt` to the `Proposed` state.
    pub async fn propose(
        &self,
        prompt: &str,
        entity_hint: Option<EntityType>,
    ) -> Result<IngestBatch> {
        let mut batch = IngestBatch::received(prompt, entity_hint);
        self.run(&mut batch, &CancellationToken::new()).await?;
        Ok(batch)
    }

    /// Drive a `Received` batch to `Proposed`.
    ///
    /// On error the batch is left in its terminal state (`Failed` or
    /// `Cancelled`) so callers can keep it for inspection. Cancelling the
    /// token aborts outstanding source queries.
    pub async fn run(&self, batch: &mut IngestBatch, cancel: &CancellationToken) -> Result<()> {
        if batch.state != IngestState::Received {
            return Err(BiographError::InvalidArgument(format!(
                "batch {} is {}, expected received",
                batch.id, batch.state
            )));
        }
        let prompt = batch.prompt.clone();
        let hint = batch.entity_hint.clone();

        let interpreted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(batch.cancelled()),
            interpreted = self.interpreter.interpret(&prompt, hint.as_ref()) => interpreted,
        };
        let query = match interpreted {
            Ok(query) => query,
            Err(err) => {
                batch.state = IngestState::Failed;
                batch.error = Some(err.to_string());
                tracing::warn!(batch_id = %batch.id, error = %err, "ingest prompt could not be interpreted");
                return Err(err);
            }
        };
        batch.query = Some(query.clone());
        batch.state = IngestState::Parsed;

        let (gathered, reports) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(batch.cancelled()),
            gathered = self.query_sources(&query) => gathered,
        };
        batch.sources = reports;
        batch.state = IngestState::Queried;

        batch.candidates = self.build_candidates(&query, gathered);
        batch.state = IngestState::Proposed;
        tracing::info!(
            batch_id = %batch.id,
            candidates = batch.candidates.len(),
            sources = batch.sources.len(),
            "ingest batch proposed"
        );
        Ok(())
    }

    async fn query_sources(
        &self,
        query: &StructuredQuery,
    ) -> (Vec<(SourceMeta, Vec<RawRecord>)>, Vec<SourceReport>) {
        let timeout = self.config.source_timeout();
        let mut set = JoinSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let query = query.clone();
            set.spawn(async move {
                let outcome = tokio::time::timeout(timeout, source.query(&query)).await;
                (index, outcome)
            });
        }

        let mut results: Vec<Option<SourceOutcome>> = vec![None; self.sources.len()];
        let mut records: Vec<Vec<RawRecord>> = vec![Vec::new(); self.sources.len()];
        while let Some(joined) = set.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(err) => {
                    tracing::warn!(error = %err, "ingest source task aborted");
                    continue;
                }
            };
            let name = self.sources[index].name();
            let outcome = match outcome {
                Ok(Ok(found)) => {
                    let count = found.len();
                    records[index] = found;
                    SourceOutcome::Ok { records: count }
                }
                Ok(Err(err)) => {
                    tracing::warn!(source_name = name, error = %err, "ingest source failed");
                    SourceOutcome::Failed {
                        error: err.to_string(),
                    }
                }
                Err(_elapsed) => {
                    let err = BiographError::SourceTimeout {
                        source_name: name.to_string(),
                        after_ms: self.config.source_timeout_ms,
                    };
                    tracing::warn!(error = %err, "ingest source timed out");
                    SourceOutcome::TimedOut {
                        after_ms: self.config.source_timeout_ms,
                    }
                }
            };
            results[index] = Some(outcome);
        }

        let reports = self
            .sources
            .iter()
            .zip(results)
            .map(|(source, outcome)| SourceReport {
                source_name: source.name().to_string(),
                outcome: outcome.unwrap_or_else(|| SourceOutcome::Failed {
                    error: "source task did not complete".into(),
                }),
            })
            .collect();
        let gathered = self
            .sources
            .iter()
            .zip(records)
            .map(|(source, found)| {
                (
                    SourceMeta {
                        name: source.name().to_string(),
                        kind: source.kind(),
                        reliability: confidence::clamp(source.reliability()),
                    },
                    found,
                )
            })
            .collect();
        (gathered, reports)
    }

    fn build_candidates(
        &self,
        query: &StructuredQuery,
        gathered: Vec<(SourceMeta, Vec<RawRecord>)>,
    ) -> Vec<IngestCandidate> {
        let mut merged: BTreeMap<String, IngestCandidate> = BTreeMap::new();
        for (meta, found) in gathered {
            for record in found {
                let Some(label) = to_new_label(query, &meta, record) else {
                    continue;
                };
                let provisional = self.model.decay(label.confidence, meta.kind);
                let key = label_store::triple_key(&label.entity_type, &label.taxonomy_path, &label.name);
                match merged.entry(key) {
                    Entry::Vacant(slot) => {
                        slot.insert(IngestCandidate {
                            id: CandidateId::new(),
                            label,
                            provisional_confidence: provisional,
                            status: CandidateStatus::Pending,
                            sources: vec![meta.name.clone()],
                            accepted_label: None,
                        });
                    }
                    Entry::Occupied(mut slot) => {
                        let candidate = slot.get_mut();
                        if !candidate.sources.contains(&meta.name) {
                            candidate.sources.push(meta.name.clone());
                        }
                        if provisional > candidate.provisional_confidence {
                            candidate.provisional_confidence = provisional;
                            candidate.label = label;
                        }
                    }
                }
            }
        }
        let mut candidates: Vec<IngestCandidate> = merged.into_values().collect();
        candidates.sort_by(|a, b| {
            b.provisional_confidence
                .partial_cmp(&a.provisional_confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.label.name.cmp(&b.label.name))
        });
        candidates.truncate(self.config.max_candidates);
        candidates
    }
}

/// Turn a record into a label draft, filling gaps from the query. Records
/// that still lack a name, entity type or path are dropped.
fn to_new_label(query: &StructuredQuery, meta: &SourceMeta, record: RawRecord) -> Option<NewLabel> {
    let name = record.name.trim().to_string();
    let entity_type = record.entity_type.or_else(|| query.entity_type.clone());
    let taxonomy_path = record
        .taxonomy_path
        .filter(|p| !p.is_empty())
        .or_else(|| query.taxonomy_hint.clone());
    let (Some(entity_type), Some(taxonomy_path)) = (entity_type, taxonomy_path) else {
        tracing::debug!(source_name = %meta.name, record = %name, "record lacks entity type or path; dropped");
        return None;
    };
    if name.is_empty() || entity_type.validate().is_err() || taxonomy_path.validate().is_err() {
        return None;
    }
    let mut metadata = record.metadata;
    metadata.insert("ingest_source".into(), meta.name.clone());
    Some(NewLabel {
        name,
        entity_type,
        taxonomy_path,
        metadata,
        provenance: meta.kind,
        confidence: confidence::clamp(meta.reliability * record.confidence.unwrap_or(1.0)),
    })
}
