//! Biograph: embedded label taxonomy and biography similarity engine.
//!
//! The core primitive is a [`Label`]: a named, confidence-scored entry in a
//! per-entity-type taxonomy (`occupation/medical/nurse`). Biographies of
//! people, buildings, organisations and events are split into life phases,
//! each carrying label assignments, and biographies link to one another
//! through typed [`RelationshipLink`]s.
//!
//! On top of that store the engine provides explainable similarity
//! ([`SimilarityEngine`]) and a review-gated [`ingest`] pipeline that turns
//! free text into candidate labels.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use biograph::{Biograph, NewBiography, NewLabel, Period, SourceKind};
//!
//! let graph = Biograph::open("biographies.redb").unwrap();
//!
//! let nurse = graph
//!     .labels()
//!     .create(NewLabel::new("person", "occupation/medical", "Nurse"))
//!     .unwrap();
//!
//! let florence = graph
//!     .biographies()
//!     .create(NewBiography::new("person", "Florence Nightingale"))
//!     .unwrap();
//! graph
//!     .biographies()
//!     .add_phase(&florence.id, Period::stage("crimea"), "Scutari hospital")
//!     .unwrap();
//! graph
//!     .biographies()
//!     .assign_label(&florence.id, 0, &nurse.id, 0.9, SourceKind::Manual)
//!     .unwrap();
//! ```

pub mod biography;
pub mod confidence;
pub mod config;
pub mod ingest;
pub mod label_store;
pub mod linker;
pub mod model;
pub mod similarity;

use std::sync::Arc;

use redb::Database;

pub use biography::Biographies;
pub use confidence::ConfidenceModel;
pub use config::{EngineConfig, IngestConfig, SimilarityConfig};
pub use ingest::{
    CandidateStatus, DataSource, IngestBatch, IngestCandidate, IngestPipeline, IngestState,
    QueryInterpreter, RawRecord, SourceOutcome, SourceReport, StructuredQuery,
};
pub use label_store::LabelStore;
pub use linker::Linker;
pub use model::{
    AssignmentDraft, BatchId, Biography, BiographyDraft, BiographyId, CandidateId, EntityType,
    Label, LabelAssignment, LabelId, LabelPatch, LabelRevision, LifePhase, LinkDraft, NewBiography,
    NewLabel, Period, PhaseDraft, PhasePatch, RelationshipLink, SourceKind, TaxonomyPath,
};
pub use similarity::{FeatureRef, LabelLookup, RationaleEntry, SimilarityEngine, SimilarityResult};

use label_store::ScopeLocks;

/// Separator inside composite storage keys. Never valid inside a key part.
pub(crate) const KEY_SEP: char = '\u{1f}';

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BiographError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate label '{name}' under {entity_type}:{path} (existing id {existing})")]
    DuplicateLabel {
        entity_type: String,
        path: String,
        name: String,
        existing: LabelId,
    },
    #[error("field '{field}' of label {id} cannot be changed")]
    ImmutableField { id: LabelId, field: &'static str },
    #[error("biography {0} cannot link to itself")]
    SelfLink(BiographyId),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("source '{source_name}' timed out after {after_ms} ms")]
    SourceTimeout { source_name: String, after_ms: u64 },
    #[error("source '{source_name}' failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },
    #[error("ingest batch {0} was cancelled")]
    Cancelled(BatchId),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for BiographError {
    fn from(e: redb::DatabaseError) -> Self {
        BiographError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for BiographError {
    fn from(e: redb::TransactionError) -> Self {
        BiographError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for BiographError {
    fn from(e: redb::TableError) -> Self {
        BiographError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for BiographError {
    fn from(e: redb::StorageError) -> Self {
        BiographError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for BiographError {
    fn from(e: redb::CommitError) -> Self {
        BiographError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BiographError>;

// ---------------------------------------------------------------------------
// Engine handle
// ---------------------------------------------------------------------------

/// Handle to one Biograph database.
///
/// Cloning is cheap: clones share the same redb [`Database`] and per-scope
/// write locks, so a clone can be moved into ingest sources or worker tasks.
/// Component views ([`labels`](Biograph::labels),
/// [`biographies`](Biograph::biographies), [`linker`](Biograph::linker))
/// borrow the handle and carry no state of their own.
#[derive(Clone)]
pub struct Biograph {
    db: Arc<Database>,
    scopes: Arc<ScopeLocks>,
    config: EngineConfig,
}

impl Biograph {
    /// Open or create a database at `path` with default settings.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &str, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::create(path)?;
        Self::init(db, config)
    }

    /// Create an in-memory database (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_config(EngineConfig::default())
    }

    pub fn open_in_memory_with_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, config)
    }

    fn init(db: Database, config: EngineConfig) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            label_store::create_tables(&write_txn)?;
            biography::create_tables(&write_txn)?;
            linker::create_tables(&write_txn)?;
            write_txn.commit()?;
        }
        tracing::debug!("biograph database initialised");
        Ok(Self {
            db: Arc::new(db),
            scopes: Arc::new(ScopeLocks::default()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn labels(&self) -> LabelStore<'_> {
        LabelStore::new(&self.db, &self.scopes)
    }

    pub fn biographies(&self) -> Biographies<'_> {
        Biographies::new(&self.db)
    }

    pub fn linker(&self) -> Linker<'_> {
        Linker::new(&self.db)
    }

    pub fn confidence(&self) -> ConfidenceModel {
        ConfidenceModel::new(self.config.trust)
    }

    pub fn similarity(&self) -> SimilarityEngine {
        SimilarityEngine::new(self.confidence(), self.config.similarity.clone())
    }
}
