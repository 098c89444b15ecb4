//! Review-gated label catalog built on Biograph.
//!
//! [`Catalog`] bundles a [`Biograph`] database with an ingest pipeline and
//! keeps proposed batches in memory until a reviewer accepts or rejects
//! them. Every result is a serde-serialisable record, so callers can hand
//! them straight to JSON.
//!
//! # Usage
//!
//! ```rust,no_run
//! use biograph::{EntityType, NewLabel};
//! use biograph_catalog::Catalog;
//!
//! # async fn demo() -> biograph_catalog::Result<()> {
//! let catalog = Catalog::open("./catalog.redb")?;
//! catalog.create_label(NewLabel::new("person", "occupation/medical", "Nurse"))?;
//!
//! let batch = catalog
//!     .submit_ingest_prompt("nurse in the crimean war", Some(EntityType::Person))
//!     .await?;
//! let picked: Vec<_> = batch.candidates.iter().map(|c| c.id.clone()).collect();
//! catalog.accept_candidates(&batch.id, &picked)?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use biograph::ingest::{CatalogSource, KeywordInterpreter};
use biograph::{
    BatchId, Biograph, Biography, BiographyId, CandidateId, DataSource, EngineConfig, EntityType,
    IngestBatch, IngestPipeline, Label, LabelId, NewBiography, NewLabel, RelationshipLink,
    SimilarityResult, SourceKind, TaxonomyPath,
};
use tokio_util::sync::CancellationToken;

pub use biograph::BiographError as Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Reviewed batches kept for lookup before the oldest are dropped.
pub const DEFAULT_SETTLED_BATCH_LIMIT: usize = 256;

/// Label catalog, biography store and ingest review queue.
pub struct Catalog {
    graph: Biograph,
    pipeline: IngestPipeline,
    batches: Mutex<ReviewQueue>,
}

/// Proposed batches awaiting review plus a bounded tail of settled ones.
///
/// Pending batches stay until reviewed or forgotten. Settled batches are
/// evicted oldest first once more than `settled_limit` are held.
struct ReviewQueue {
    batches: HashMap<BatchId, IngestBatch>,
    settled: VecDeque<BatchId>,
    settled_limit: usize,
}

impl ReviewQueue {
    fn get_mut(&mut self, id: &BatchId) -> Result<&mut IngestBatch> {
        self.batches
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("ingest batch {id}")))
    }

    fn settle(&mut self, id: &BatchId) {
        if self.settled.contains(id) {
            return;
        }
        self.settled.push_back(id.clone());
        while self.settled.len() > self.settled_limit {
            if let Some(oldest) = self.settled.pop_front() {
                self.batches.remove(&oldest);
                tracing::debug!(batch_id = %oldest, "settled ingest batch evicted");
            }
        }
    }

    fn forget(&mut self, id: &BatchId) -> bool {
        self.settled.retain(|settled| settled != id);
        self.batches.remove(id).is_some()
    }
}

impl Catalog {
    /// Open or create a catalog at the given path with default settings.
    ///
    /// The ingest pipeline starts with the keyword interpreter and the
    /// built-in catalog source; add external datasets with
    /// [`add_source`](Catalog::add_source).
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::from_graph(Biograph::open(path)?))
    }

    pub fn open_with_config(path: &str, config: EngineConfig) -> Result<Self> {
        Ok(Self::from_graph(Biograph::open_with_config(path, config)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_graph(Biograph::open_in_memory()?))
    }

    pub fn from_graph(graph: Biograph) -> Self {
        let pipeline = IngestPipeline::new(
            Arc::new(KeywordInterpreter),
            graph.confidence(),
            graph.config().ingest.clone(),
        )
        .with_source(Arc::new(CatalogSource::new(graph.clone())));
        Self::with_pipeline(graph, pipeline)
    }

    /// Use a caller-built pipeline, e.g. one with a different interpreter.
    pub fn with_pipeline(graph: Biograph, pipeline: IngestPipeline) -> Self {
        Self {
            graph,
            pipeline,
            batches: Mutex::new(ReviewQueue {
                batches: HashMap::new(),
                settled: VecDeque::new(),
                settled_limit: DEFAULT_SETTLED_BATCH_LIMIT,
            }),
        }
    }

    /// How many accepted or rejected batches stay queryable. At least one
    /// is always kept.
    pub fn with_settled_batch_limit(mut self, limit: usize) -> Self {
        if let Ok(queue) = self.batches.get_mut() {
            queue.settled_limit = limit.max(1);
        }
        self
    }

    pub fn add_source(&mut self, source: Arc<dyn DataSource>) {
        self.pipeline.add_source(source);
    }

    /// The underlying database, for operations the catalog does not wrap.
    pub fn graph(&self) -> &Biograph {
        &self.graph
    }

    // ---- Labels ----

    pub fn search_labels(&self, entity_type: &EntityType, prefix: &str) -> Result<Vec<Label>> {
        self.graph.labels().search(entity_type, prefix)
    }

    pub fn list_labels(&self, entity_type: &EntityType, path: &TaxonomyPath) -> Result<Vec<Label>> {
        self.graph.labels().list_by_path(entity_type, path)
    }

    pub fn create_label(&self, new: NewLabel) -> Result<Label> {
        self.graph.labels().create(new)
    }

    // ---- Biographies ----

    pub fn create_biography(&self, new: NewBiography) -> Result<Biography> {
        self.graph.biographies().create(new)
    }

    pub fn biography(&self, id: &BiographyId) -> Result<Biography> {
        self.graph.biographies().get(id)
    }

    /// Live biographies matching `query` by name, best matches first.
    pub fn search_biographies(
        &self,
        entity_type: Option<&EntityType>,
        query: &str,
    ) -> Result<Vec<Biography>> {
        self.graph.biographies().search(entity_type, query)
    }

    /// Assign a label to a phase as a manual assignment.
    pub fn assign_label(
        &self,
        biography: &BiographyId,
        phase: usize,
        label: &LabelId,
        confidence: f64,
    ) -> Result<Biography> {
        self.graph
            .biographies()
            .assign_label(biography, phase, label, confidence, SourceKind::Manual)
    }

    // ---- Similarity ----

    pub fn compare_biographies(&self, a: &BiographyId, b: &BiographyId) -> Result<SimilarityResult> {
        let bios = self.graph.biographies();
        let (a, b) = (bios.get(a)?, bios.get(b)?);
        let labels = self.graph.labels().snapshot()?;
        Ok(self.graph.similarity().compare(&a, &b, &labels))
    }

    /// The `limit` biographies of the target's entity type most like it.
    pub fn rank_most_like(&self, target: &BiographyId, limit: usize) -> Result<Vec<SimilarityResult>> {
        let bios = self.graph.biographies();
        let target = bios.get(target)?;
        let candidates = bios.list(Some(&target.entity_type), false)?;
        let labels = self.graph.labels().snapshot()?;
        self.graph
            .similarity()
            .rank_most_like(&target, &candidates, &labels, limit)
    }

    // ---- Ingest review ----

    /// Interpret `prompt`, query every source and queue the proposed batch
    /// for review. Nothing is written to the label store.
    pub async fn submit_ingest_prompt(
        &self,
        prompt: &str,
        entity_hint: Option<EntityType>,
    ) -> Result<IngestBatch> {
        self.submit_ingest_prompt_with_cancel(prompt, entity_hint, &CancellationToken::new())
            .await
    }

    pub async fn submit_ingest_prompt_with_cancel(
        &self,
        prompt: &str,
        entity_hint: Option<EntityType>,
        cancel: &CancellationToken,
    ) -> Result<IngestBatch> {
        let mut batch = IngestBatch::received(prompt, entity_hint);
        self.pipeline.run(&mut batch, cancel).await?;
        self.lock_batches()?
            .batches
            .insert(batch.id.clone(), batch.clone());
        Ok(batch)
    }

    /// Persist the selected candidates of a queued batch and reject the rest.
    ///
    /// Repeating the call with the same selection returns the same labels
    /// while the batch is still queued.
    pub fn accept_candidates(&self, batch: &BatchId, selected: &[CandidateId]) -> Result<Vec<Label>> {
        let mut queue = self.lock_batches()?;
        let labels = queue.get_mut(batch)?.accept(&self.graph.labels(), selected)?;
        queue.settle(batch);
        Ok(labels)
    }

    /// Reject every pending candidate of a queued batch.
    pub fn reject_candidates(&self, batch: &BatchId) -> Result<usize> {
        let mut queue = self.lock_batches()?;
        let rejected = queue.get_mut(batch)?.reject()?;
        queue.settle(batch);
        Ok(rejected)
    }

    pub fn batch(&self, batch: &BatchId) -> Result<Option<IngestBatch>> {
        Ok(self.lock_batches()?.batches.get(batch).cloned())
    }

    /// Drop a batch from the review queue. Proposed batches that are never
    /// reviewed stay queued until forgotten.
    pub fn forget_batch(&self, batch: &BatchId) -> Result<bool> {
        Ok(self.lock_batches()?.forget(batch))
    }

    fn lock_batches(&self) -> Result<MutexGuard<'_, ReviewQueue>> {
        self.batches
            .lock()
            .map_err(|_| Error::Internal("ingest batch queue lock poisoned".into()))
    }

    // ---- Links ----

    pub fn create_link(
        &self,
        source: &BiographyId,
        target: &BiographyId,
        kind: &str,
        confidence: f64,
        bidirectional: bool,
    ) -> Result<RelationshipLink> {
        self.graph
            .linker()
            .link(source, target, kind, confidence, bidirectional)
    }

    pub fn remove_link(&self, source: &BiographyId, target: &BiographyId, kind: &str) -> Result<bool> {
        self.graph.linker().unlink(source, target, kind)
    }
}
