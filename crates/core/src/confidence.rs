//! Confidence arithmetic shared by labels, assignments, links and ingest.
//!
//! Confidence is a real number in `[0.0, 1.0]`. Every operation here clamps
//! its output into that range, and [`validate`] is the gate for values that
//! come from callers.

use serde::{Deserialize, Serialize};

use crate::model::SourceKind;
use crate::{BiographError, Result};

/// Per-provenance trust applied by [`ConfidenceModel::decay`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrustMultipliers {
    pub manual: f64,
    pub external_dataset: f64,
    pub ingest_suggested: f64,
}

impl Default for TrustMultipliers {
    fn default() -> Self {
        Self {
            manual: 1.0,
            external_dataset: 0.85,
            ingest_suggested: 0.5,
        }
    }
}

impl TrustMultipliers {
    pub fn for_source(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Manual => self.manual,
            SourceKind::ExternalDataset => self.external_dataset,
            SourceKind::IngestSuggested => self.ingest_suggested,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfidenceModel {
    trust: TrustMultipliers,
}

impl ConfidenceModel {
    pub fn new(trust: TrustMultipliers) -> Self {
        Self { trust }
    }

    pub fn trust(&self) -> &TrustMultipliers {
        &self.trust
    }

    /// Down-weight `confidence` by how much its provenance is trusted.
    pub fn decay(&self, confidence: f64, source: SourceKind) -> f64 {
        clamp(clamp(confidence) * self.trust.for_source(source))
    }
}

/// Clamp into `[0, 1]`. NaN becomes 0.
pub fn clamp(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Reject NaN and anything outside `[0, 1]`.
pub fn validate(value: f64, what: &str) -> Result<f64> {
    if value.is_nan() || !(0.0..=1.0).contains(&value) {
        return Err(BiographError::InvalidArgument(format!(
            "{what} confidence must be within [0, 1], got {value}"
        )));
    }
    Ok(value)
}

/// Self-weighted mean of independent confidences: `Σc² / Σc`.
///
/// Strong evidence dominates weak evidence, a single value comes back
/// unchanged, and the result never exceeds the largest input. Empty input
/// (or all zeros) combines to 0.
pub fn combine(confidences: &[f64]) -> f64 {
    if let [single] = confidences {
        return clamp(*single);
    }
    let (sum, sum_sq) = confidences
        .iter()
        .map(|c| clamp(*c))
        .fold((0.0, 0.0), |(s, sq), c| (s + c, sq + c * c));
    if sum <= 0.0 {
        return 0.0;
    }
    clamp(sum_sq / sum)
}
