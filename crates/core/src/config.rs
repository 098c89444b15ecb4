//! Engine tuning knobs.
//!
//! Every section deserialises with defaults, so a partial TOML table such as
//! `[similarity]\ndivergence_penalty = 0.25` is enough to override one value.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::confidence::TrustMultipliers;
use crate::{BiographError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub trust: TrustMultipliers,
    pub similarity: SimilarityConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Weight applied to features only one side carries.
    pub divergence_penalty: f64,
    /// Extra factor on the penalty when the other side has nothing at all in
    /// the feature's taxonomy branch.
    pub foreign_branch_factor: f64,
    /// Candidate count at which ranking fans out over worker threads.
    pub parallel_threshold: usize,
    /// Compare only the period buckets both biographies cover.
    pub align_periods: bool,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            divergence_penalty: 0.5,
            foreign_branch_factor: 0.5,
            parallel_threshold: 64,
            align_periods: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub source_timeout_ms: u64,
    /// Upper bound on candidates proposed per batch.
    pub max_candidates: usize,
    /// Upper bound on labels the built-in catalog source scores per query.
    pub catalog_pool_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            source_timeout_ms: 5_000,
            max_candidates: 8,
            catalog_pool_size: 120,
        }
    }
}

impl IngestConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("trust.manual", self.trust.manual),
            ("trust.external-dataset", self.trust.external_dataset),
            ("trust.ingest-suggested", self.trust.ingest_suggested),
            (
                "similarity.foreign_branch_factor",
                self.similarity.foreign_branch_factor,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(BiographError::InvalidArgument(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !self.similarity.divergence_penalty.is_finite() || self.similarity.divergence_penalty < 0.0
        {
            return Err(BiographError::InvalidArgument(format!(
                "similarity.divergence_penalty must be >= 0, got {}",
                self.similarity.divergence_penalty
            )));
        }
        if self.ingest.source_timeout_ms == 0 {
            return Err(BiographError::InvalidArgument(
                "ingest.source_timeout_ms must be > 0".into(),
            ));
        }
        if self.ingest.max_candidates == 0 || self.ingest.catalog_pool_size == 0 {
            return Err(BiographError::InvalidArgument(
                "ingest.max_candidates and ingest.catalog_pool_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}
