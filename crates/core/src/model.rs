//! Records shared by every component: labels, biographies and links.
//!
//! Identifiers are ULID strings, so ids created later sort later. Taxonomy
//! paths and entity types compare case-insensitively through their
//! normalised keys; display forms keep whatever casing the caller used.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{BiographError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Ulid::new().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

ulid_id!(
    /// Stable identifier of a [`Label`].
    LabelId
);
ulid_id!(
    /// Stable identifier of a [`Biography`].
    BiographyId
);
ulid_id!(
    /// Identifier of an ingest batch awaiting review.
    BatchId
);
ulid_id!(
    /// Identifier of one proposal inside an ingest batch.
    CandidateId
);

// ---------------------------------------------------------------------------
// Entity types, taxonomy paths, provenance
// ---------------------------------------------------------------------------

/// What kind of thing a label or biography describes.
///
/// The set is open: anything that is not one of the built-in kinds is kept
/// verbatim (lower-cased) in [`EntityType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EntityType {
    Person,
    Building,
    Organisation,
    Event,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Person => "person",
            EntityType::Building => "building",
            EntityType::Organisation => "organisation",
            EntityType::Event => "event",
            EntityType::Other(s) => s.as_str(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let key = self.as_str();
        if key.is_empty() || key.contains(['/', crate::KEY_SEP]) {
            return Err(BiographError::InvalidArgument(format!(
                "entity type '{key}' must be non-empty and contain no '/'"
            )));
        }
        Ok(())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        let key = s.trim().to_lowercase();
        match key.as_str() {
            "person" | "people" => EntityType::Person,
            "building" | "buildings" => EntityType::Building,
            "organisation" | "organisations" | "organization" | "organizations" => {
                EntityType::Organisation
            }
            "event" | "events" => EntityType::Event,
            _ => EntityType::Other(key),
        }
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        EntityType::from(s.to_string())
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered category chain locating a label, parent first.
///
/// `"occupation/medical"` parses to `["occupation", "medical"]`. Blank
/// segments are dropped on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxonomyPath(Vec<String>);

impl TaxonomyPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            segments
                .into_iter()
                .map(|s| s.as_ref().trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    /// Parse a `/`-separated path.
    pub fn parse(path: &str) -> Self {
        Self::new(path.split('/'))
    }

    /// The empty path: the root of an entity type's taxonomy.
    pub fn root_path() -> Self {
        Self(Vec::new())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// First segment, the branch this path belongs to.
    pub fn root(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<TaxonomyPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn child(&self, segment: &str) -> TaxonomyPath {
        let mut segments = self.0.clone();
        segments.push(segment.trim().to_string());
        Self::new(segments)
    }

    /// Every non-empty prefix of this path, shortest first (ends with `self`).
    pub fn ancestors(&self) -> impl Iterator<Item = TaxonomyPath> + '_ {
        (1..=self.0.len()).map(move |n| Self(self.0[..n].to_vec()))
    }

    /// True when `self` equals `ancestor` or lies underneath it.
    pub fn is_within(&self, ancestor: &TaxonomyPath) -> bool {
        ancestor.0.len() <= self.0.len()
            && ancestor
                .0
                .iter()
                .zip(&self.0)
                .all(|(a, b)| a.to_lowercase() == b.to_lowercase())
    }

    /// Lower-cased, `/`-joined form used in storage keys.
    pub fn key(&self) -> String {
        self.0
            .iter()
            .map(|s| s.to_lowercase())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(bad) = self
            .0
            .iter()
            .find(|s| s.trim().is_empty() || s.contains(['/', crate::KEY_SEP]))
        {
            return Err(BiographError::InvalidArgument(format!(
                "taxonomy segment '{bad}' must be non-empty and contain no '/'"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TaxonomyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl From<&str> for TaxonomyPath {
    fn from(s: &str) -> Self {
        TaxonomyPath::parse(s)
    }
}

/// Where a label, assignment or link came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Entered by a person.
    #[default]
    Manual,
    /// Imported from an external dataset.
    ExternalDataset,
    /// Proposed by the ingest pipeline without an external source.
    IngestSuggested,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Manual => "manual",
            SourceKind::ExternalDataset => "external-dataset",
            SourceKind::IngestSuggested => "ingest-suggested",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A reusable, confidence-scored taxonomy entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    /// Display name, unique (case-insensitively) within its entity type and path.
    pub name: String,
    pub entity_type: EntityType,
    pub taxonomy_path: TaxonomyPath,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub provenance: SourceKind,
    /// Confidence in the label itself \[0.0, 1.0\].
    pub confidence: f64,
    /// Archived labels are hidden from search but still resolve by id.
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`LabelStore::create`](crate::LabelStore::create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLabel {
    pub name: String,
    pub entity_type: EntityType,
    pub taxonomy_path: TaxonomyPath,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub provenance: SourceKind,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

impl NewLabel {
    /// A manual label with full confidence.
    pub fn new(
        entity_type: impl Into<EntityType>,
        taxonomy_path: impl Into<TaxonomyPath>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            taxonomy_path: taxonomy_path.into(),
            metadata: BTreeMap::new(),
            provenance: SourceKind::Manual,
            confidence: 1.0,
        }
    }

    pub fn with_provenance(mut self, provenance: SourceKind, confidence: f64) -> Self {
        self.provenance = provenance;
        self.confidence = confidence;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Partial edit of a label. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelPatch {
    pub name: Option<String>,
    pub entity_type: Option<EntityType>,
    pub taxonomy_path: Option<TaxonomyPath>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub provenance: Option<SourceKind>,
    pub confidence: Option<f64>,
}

/// A superseded version of a label, kept by every edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRevision {
    pub label: Label,
    pub replaced_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Biographies
// ---------------------------------------------------------------------------

/// Time range of a life phase.
///
/// Either bound may be open. `stage` carries a coarse life-stage tag such as
/// `"teens"` or `"1990s"` when exact dates are unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub stage: Option<String>,
}

impl Period {
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            stage: None,
        }
    }

    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    /// Normalised bucket key: the stage tag, else `start..end`, else `unknown`.
    pub fn key(&self) -> String {
        if let Some(stage) = self.stage.as_deref().filter(|s| !s.trim().is_empty()) {
            return stage.trim().to_lowercase();
        }
        match (self.start, self.end) {
            (None, None) => "unknown".to_string(),
            (start, end) => format!(
                "{}..{}",
                start.map(|d| d.to_string()).unwrap_or_default(),
                end.map(|d| d.to_string()).unwrap_or_default()
            ),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(BiographError::InvalidArgument(format!(
                    "period starts ({start}) after it ends ({end})"
                )));
            }
        }
        Ok(())
    }
}

/// A label attached to a life phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelAssignment {
    pub label_id: LabelId,
    /// Confidence that the label applies in this phase \[0.0, 1.0\].
    pub confidence: f64,
    #[serde(default)]
    pub provenance: SourceKind,
    pub assigned_at: DateTime<Utc>,
}

/// One period of an entity's existence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifePhase {
    pub period: Period,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub labels: Vec<LabelAssignment>,
}

impl LifePhase {
    pub fn new(period: Period, narrative: impl Into<String>) -> Self {
        Self {
            period,
            narrative: narrative.into(),
            labels: Vec::new(),
        }
    }
}

/// Structured record of a person, building, organisation or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Biography {
    pub id: BiographyId,
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub phases: Vec<LifePhase>,
    /// Outgoing links plus incoming bidirectional ones. Owned by the linker
    /// and filled in on read; never persisted with the record.
    #[serde(default)]
    pub links: Vec<RelationshipLink>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`Biographies::create`](crate::Biographies::create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBiography {
    pub entity_type: EntityType,
    pub name: String,
}

impl NewBiography {
    pub fn new(entity_type: impl Into<EntityType>, name: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }
}

/// Partial edit of a life phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasePatch {
    pub period: Option<Period>,
    pub narrative: Option<String>,
}

/// Label assignment requested as part of a [`BiographyDraft`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentDraft {
    pub label_id: LabelId,
    pub confidence: f64,
    #[serde(default)]
    pub provenance: SourceKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseDraft {
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub labels: Vec<AssignmentDraft>,
}

/// Outgoing link requested as part of a [`BiographyDraft`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDraft {
    pub target_id: BiographyId,
    pub kind: String,
    pub confidence: f64,
    #[serde(default)]
    pub bidirectional: bool,
}

/// Everything needed to compose a biography in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiographyDraft {
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub phases: Vec<PhaseDraft>,
    #[serde(default)]
    pub links: Vec<LinkDraft>,
}

// ---------------------------------------------------------------------------
// Relationship links
// ---------------------------------------------------------------------------

/// Confidence-scored link between two biographies.
///
/// A link with confidence 0 is a rejected suggestion: it is kept for the
/// record but ignored by similarity scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipLink {
    pub source_id: BiographyId,
    pub target_id: BiographyId,
    /// Free-form relationship kind, e.g. `works_at` or `sibling_of`.
    pub kind: String,
    pub confidence: f64,
    pub bidirectional: bool,
    #[serde(default)]
    pub provenance: SourceKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RelationshipLink {
    /// The biography on the other end of this link as seen from `id`.
    ///
    /// Directed links are only visible from their source.
    pub fn other_end(&self, id: &BiographyId) -> Option<&BiographyId> {
        if &self.source_id == id {
            Some(&self.target_id)
        } else if self.bidirectional && &self.target_id == id {
            Some(&self.source_id)
        } else {
            None
        }
    }
}
