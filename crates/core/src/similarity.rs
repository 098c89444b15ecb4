//! Similarity Engine: explainable, confidence-weighted comparison of two
//! biographies.
//!
//! Each biography is reduced to a set of weighted features:
//!
//! - every assigned label, weighted by
//!   `decay(assignment × label confidence, label provenance)` and kept at
//!   its strongest across phases;
//! - every visible relationship link with non-zero confidence, weighted by
//!   `decay(link)`.
//!
//! A feature both sides carry adds `combine(ca, cb)` to the score. A feature
//! only one side carries subtracts `divergence_penalty × c`, halved again
//! (by `foreign_branch_factor`) when the other side has nothing at all in the
//! feature's taxonomy branch. The raw sum is divided by the theoretical
//! maximum, the number of distinct features across both sides, and clamped
//! to `[0, 1]`. Two identical label sets therefore score the combined
//! confidence of their labels, not a flat 1.0.
//!
//! Phases are bucketed by [`Period::key`](crate::model::Period::key). By
//! default labels from every phase are merged; with `align_periods` only the
//! buckets both biographies cover are compared and the same label in two
//! buckets counts twice.
//!
//! Every term becomes a [`RationaleEntry`]; entries are sorted by absolute
//! contribution so the strongest reasons read first.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::confidence::{self, ConfidenceModel};
use crate::config::SimilarityConfig;
use crate::model::{Biography, BiographyId, Label, LabelId};
use crate::{BiographError, Result, KEY_SEP};

/// Resolves label ids during comparison.
pub trait LabelLookup {
    fn label(&self, id: &LabelId) -> Option<&Label>;
}

impl LabelLookup for HashMap<LabelId, Label> {
    fn label(&self, id: &LabelId) -> Option<&Label> {
        self.get(id)
    }
}

impl LabelLookup for BTreeMap<LabelId, Label> {
    fn label(&self, id: &LabelId) -> Option<&Label> {
        self.get(id)
    }
}

/// What a rationale entry talks about.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "feature", rename_all = "snake_case")]
pub enum FeatureRef {
    Label { label_id: LabelId },
    Relationship { relation: String, other: BiographyId },
}

impl FeatureRef {
    fn sort_key(&self) -> String {
        match self {
            FeatureRef::Label { label_id } => format!("label:{label_id}"),
            FeatureRef::Relationship { relation, other } => format!("link:{relation}:{other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleEntry {
    pub feature: FeatureRef,
    /// Period buckets the feature was seen in. Empty for relationships.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub periods: Vec<String>,
    /// Signed share of the final score.
    pub contribution: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub a: BiographyId,
    pub b: BiographyId,
    pub score: f64,
    /// Period buckets both biographies cover.
    #[serde(default)]
    pub shared_periods: Vec<String>,
    pub rationale: Vec<RationaleEntry>,
}

struct Feature {
    reference: FeatureRef,
    branch: String,
    confidence: f64,
    display: String,
    periods: BTreeSet<String>,
}

impl Feature {
    fn noun(&self) -> &'static str {
        match self.reference {
            FeatureRef::Label { .. } => "label",
            FeatureRef::Relationship { .. } => "relationship",
        }
    }
}

enum Term<'f> {
    Shared {
        a: &'f Feature,
        b: &'f Feature,
        value: f64,
    },
    Divergent {
        owner: &'f str,
        feature: &'f Feature,
        value: f64,
    },
}

impl Term<'_> {
    fn signed(&self) -> f64 {
        match self {
            Term::Shared { value, .. } => *value,
            Term::Divergent { value, .. } => -*value,
        }
    }
}

fn period_keys(bio: &Biography) -> BTreeSet<String> {
    bio.phases.iter().map(|p| p.period.key()).collect()
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityEngine {
    model: ConfidenceModel,
    config: SimilarityConfig,
}

impl SimilarityEngine {
    pub fn new(model: ConfidenceModel, config: SimilarityConfig) -> Self {
        Self { model, config }
    }

    /// Weighted features of `bio`, keyed canonically.
    ///
    /// With `only` set, phases outside those buckets are dropped and label
    /// keys are qualified by their bucket.
    fn features<L: LabelLookup + ?Sized>(
        &self,
        bio: &Biography,
        labels: &L,
        only: Option<&BTreeSet<String>>,
    ) -> BTreeMap<String, Feature> {
        let mut out: BTreeMap<String, Feature> = BTreeMap::new();
        for phase in &bio.phases {
            let bucket = phase.period.key();
            if only.is_some_and(|keep| !keep.contains(&bucket)) {
                continue;
            }
            for assignment in &phase.labels {
                let Some(label) = labels.label(&assignment.label_id) else {
                    tracing::debug!(
                        biography_id = %bio.id,
                        label_id = %assignment.label_id,
                        "assignment references unknown label; skipped"
                    );
                    continue;
                };
                let weight = self
                    .model
                    .decay(assignment.confidence * label.confidence, label.provenance);
                let reference = FeatureRef::Label {
                    label_id: label.id.clone(),
                };
                let key = match only {
                    Some(_) => format!("{bucket}{KEY_SEP}{}", reference.sort_key()),
                    None => reference.sort_key(),
                };
                let feature = out.entry(key).or_insert_with(|| Feature {
                    reference,
                    branch: format!(
                        "label:{}",
                        label.taxonomy_path.root().unwrap_or_default().to_lowercase()
                    ),
                    confidence: 0.0,
                    display: label.name.clone(),
                    periods: BTreeSet::new(),
                });
                feature.confidence = feature.confidence.max(weight);
                feature.periods.insert(bucket.clone());
            }
        }
        for link in &bio.links {
            let Some(other) = link.other_end(&bio.id) else {
                continue;
            };
            if link.confidence <= 0.0 {
                continue;
            }
            let relation = link.kind.trim().to_lowercase();
            let weight = self.model.decay(link.confidence, link.provenance);
            let reference = FeatureRef::Relationship {
                relation: relation.clone(),
                other: other.clone(),
            };
            let key = reference.sort_key();
            let feature = out.entry(key).or_insert_with(|| Feature {
                reference,
                branch: format!("link:{relation}"),
                confidence: 0.0,
                display: format!("{} {}", link.kind.trim(), other),
                periods: BTreeSet::new(),
            });
            feature.confidence = feature.confidence.max(weight);
        }
        out
    }

    /// Compare two biographies.
    ///
    /// The score is symmetric in `a` and `b`, bit for bit; only the wording
    /// of the rationale depends on the order. Comparing a biography with
    /// itself scores 1.0 with no rationale, and two biographies with no
    /// usable features score 0.0.
    pub fn compare<L: LabelLookup + ?Sized>(
        &self,
        a: &Biography,
        b: &Biography,
        labels: &L,
    ) -> SimilarityResult {
        let shared_periods: BTreeSet<String> = period_keys(a)
            .intersection(&period_keys(b))
            .cloned()
            .collect();
        let outcome = |score: f64, rationale: Vec<RationaleEntry>| SimilarityResult {
            a: a.id.clone(),
            b: b.id.clone(),
            score,
            shared_periods: shared_periods.iter().cloned().collect(),
            rationale,
        };
        if a.id == b.id {
            return outcome(1.0, Vec::new());
        }

        let only = self.config.align_periods.then_some(&shared_periods);
        let fa = self.features(a, labels, only);
        let fb = self.features(b, labels, only);
        let branches_a: HashSet<&str> = fa.values().map(|f| f.branch.as_str()).collect();
        let branches_b: HashSet<&str> = fb.values().map(|f| f.branch.as_str()).collect();

        // Walk the union in key order so both argument orders add the same
        // terms in the same sequence.
        let union: BTreeSet<&String> = fa.keys().chain(fb.keys()).collect();
        let mut terms: Vec<Term<'_>> = Vec::with_capacity(union.len());
        for key in &union {
            let term = match (fa.get(*key), fb.get(*key)) {
                (Some(feature_a), Some(feature_b)) => Term::Shared {
                    a: feature_a,
                    b: feature_b,
                    value: confidence::combine(&[feature_a.confidence, feature_b.confidence]),
                },
                (Some(feature_a), None) => Term::Divergent {
                    owner: &a.name,
                    feature: feature_a,
                    value: self.penalty(feature_a, &branches_b),
                },
                (None, Some(feature_b)) => Term::Divergent {
                    owner: &b.name,
                    feature: feature_b,
                    value: self.penalty(feature_b, &branches_a),
                },
                (None, None) => continue,
            };
            terms.push(term);
        }

        if terms.is_empty() {
            return outcome(0.0, Vec::new());
        }
        let denominator = terms.len() as f64;
        let raw: f64 = terms.iter().map(Term::signed).sum();
        let mut rationale: Vec<RationaleEntry> = terms
            .iter()
            .map(|t| explain(t, denominator))
            .collect();
        rationale.sort_by(|x, y| {
            y.contribution
                .abs()
                .partial_cmp(&x.contribution.abs())
                .unwrap_or(Ordering::Equal)
                .then_with(|| x.feature.sort_key().cmp(&y.feature.sort_key()))
                .then_with(|| x.periods.cmp(&y.periods))
        });

        outcome(confidence::clamp(raw / denominator), rationale)
    }

    fn penalty(&self, feature: &Feature, other_branches: &HashSet<&str>) -> f64 {
        let mut penalty = self.config.divergence_penalty * feature.confidence;
        if !other_branches.contains(feature.branch.as_str()) {
            penalty *= self.config.foreign_branch_factor;
        }
        penalty
    }

    /// Score `target` against every candidate and keep the best `limit`.
    ///
    /// Archived candidates and the target itself are skipped. Ties break on
    /// ascending biography id. At `parallel_threshold` candidates or more the
    /// comparisons are spread over scoped worker threads; the result is the
    /// same either way.
    pub fn rank_most_like<L: LabelLookup + Sync + ?Sized>(
        &self,
        target: &Biography,
        candidates: &[Biography],
        labels: &L,
        limit: usize,
    ) -> Result<Vec<SimilarityResult>> {
        if limit == 0 {
            return Err(BiographError::InvalidArgument(
                "rank limit must be at least 1".into(),
            ));
        }
        let eligible: Vec<&Biography> = candidates
            .iter()
            .filter(|c| !c.archived && c.id != target.id)
            .collect();

        let mut results = if eligible.len() >= self.config.parallel_threshold.max(1) {
            self.compare_parallel(target, &eligible, labels)?
        } else {
            eligible
                .iter()
                .map(|c| self.compare(target, c, labels))
                .collect()
        };
        results.sort_by(|x, y| {
            y.score
                .partial_cmp(&x.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| x.b.cmp(&y.b))
        });
        results.truncate(limit);
        tracing::debug!(
            target = %target.id,
            candidates = eligible.len(),
            returned = results.len(),
            "ranked most-like"
        );
        Ok(results)
    }

    fn compare_parallel<L: LabelLookup + Sync + ?Sized>(
        &self,
        target: &Biography,
        eligible: &[&Biography],
        labels: &L,
    ) -> Result<Vec<SimilarityResult>> {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        let chunk = eligible.len().div_ceil(workers).max(1);
        std::thread::scope(|s| {
            let handles: Vec<_> = eligible
                .chunks(chunk)
                .map(|part| {
                    s.spawn(move || {
                        part.iter()
                            .map(|c| self.compare(target, c, labels))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let mut out = Vec::with_capacity(eligible.len());
            for handle in handles {
                let part = handle
                    .join()
                    .map_err(|_| BiographError::Internal("similarity worker panicked".into()))?;
                out.extend(part);
            }
            Ok(out)
        })
    }
}

fn during(periods: &BTreeSet<String>) -> String {
    if periods.is_empty() {
        return String::new();
    }
    let list: Vec<&str> = periods.iter().map(String::as_str).collect();
    format!(" during {}", list.join(", "))
}

fn explain(term: &Term<'_>, denominator: f64) -> RationaleEntry {
    let contribution = term.signed() / denominator;
    match term {
        Term::Shared { a, b, .. } => {
            let periods: BTreeSet<String> = a.periods.union(&b.periods).cloned().collect();
            RationaleEntry {
                feature: a.reference.clone(),
                explanation: format!(
                    "contributes +{contribution:.3} because both share {} '{}' (confidence {:.2} and {:.2}){}",
                    a.noun(),
                    a.display,
                    a.confidence,
                    b.confidence,
                    during(&periods)
                ),
                periods: periods.into_iter().collect(),
                contribution,
            }
        }
        Term::Divergent { owner, feature, .. } => RationaleEntry {
            feature: feature.reference.clone(),
            explanation: format!(
                "reduces score by {:.3} because only {owner} has {} '{}' (confidence {:.2}){}",
                -contribution,
                feature.noun(),
                feature.display,
                feature.confidence,
                during(&feature.periods)
            ),
            periods: feature.periods.iter().cloned().collect(),
            contribution,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        EntityType, LabelAssignment, LifePhase, Period, RelationshipLink, SourceKind,
        TaxonomyPath,
    };
    use chrono::Utc;
    use proptest::prelude::*;

    fn label(id: &str, path: &str, name: &str, provenance: SourceKind, confidence: f64) -> Label {
        let now = Utc::now();
        Label {
            id: LabelId::from(id),
            name: name.into(),
            entity_type: EntityType::Person,
            taxonomy_path: TaxonomyPath::parse(path),
            metadata: Default::default(),
            provenance,
            confidence,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn assign(assignments: &[(&str, f64)]) -> Vec<LabelAssignment> {
        let now = Utc::now();
        assignments
            .iter()
            .map(|(label_id, confidence)| LabelAssignment {
                label_id: LabelId::from(*label_id),
                confidence: *confidence,
                provenance: SourceKind::Manual,
                assigned_at: now,
            })
            .collect()
    }

    fn phased(id: &str, name: &str, phases: &[(&str, &[(&str, f64)])]) -> Biography {
        let now = Utc::now();
        Biography {
            id: BiographyId::from(id),
            entity_type: EntityType::Person,
            name: name.into(),
            phases: phases
                .iter()
                .map(|(stage, assignments)| {
                    let mut phase = LifePhase::new(Period::stage(*stage), "");
                    phase.labels = assign(assignments);
                    phase
                })
                .collect(),
            links: Vec::new(),
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn bio(id: &str, name: &str, assignments: &[(&str, f64)]) -> Biography {
        phased(id, name, &[("crimea", assignments)])
    }

    fn crimean_labels() -> HashMap<LabelId, Label> {
        [
            label("nurse", "occupation/medical", "Nurse", SourceKind::Manual, 1.0),
            label("crimean-war", "events/war", "Crimean War", SourceKind::Manual, 1.0),
            label(
                "hospital-admin",
                "occupation/administration",
                "Hospital Administrator",
                SourceKind::ExternalDataset,
                0.7,
            ),
            label("cook", "occupation/catering", "Cook", SourceKind::Manual, 1.0),
            label("chef", "occupation/catering", "Chef", SourceKind::Manual, 1.0),
        ]
        .into_iter()
        .map(|l| (l.id.clone(), l))
        .collect()
    }

    #[test]
    fn nightingale_and_seacole_share_nursing() {
        let labels = crimean_labels();
        let florence = bio(
            "florence",
            "Florence Nightingale",
            &[("nurse", 0.9), ("hospital-admin", 0.6)],
        );
        let mary = bio("mary", "Mary Seacole", &[("nurse", 0.95)]);

        let result = SimilarityEngine::default().compare(&florence, &mary, &labels);
        // (combine(0.9, 0.95) - 0.5 × decay(0.42)) over two distinct labels.
        assert!(
            (result.score - 0.3736).abs() < 0.001,
            "expected ≈0.374, got {}",
            result.score
        );
        assert_eq!(result.shared_periods, ["crimea"]);

        let first = &result.rationale[0];
        assert_eq!(
            first.feature,
            FeatureRef::Label {
                label_id: LabelId::from("nurse")
            }
        );
        let admin = result
            .rationale
            .iter()
            .find(|r| r.feature == FeatureRef::Label { label_id: LabelId::from("hospital-admin") })
            .expect("divergent label must be explained");
        assert!(admin.contribution < 0.0);
        assert!(admin.explanation.contains("only Florence Nightingale has"));
        assert!(admin.explanation.ends_with("during crimea"));
        assert_eq!(admin.periods, ["crimea"]);

        let sum: f64 = result.rationale.iter().map(|r| r.contribution).sum();
        assert!(
            (sum - result.score).abs() < 1e-9,
            "rationale must sum to the score when unclamped"
        );
    }

    #[test]
    fn divergence_inside_a_shared_branch_costs_more() {
        let labels = crimean_labels();
        let cook = bio("a", "Alexis Soyer", &[("cook", 1.0), ("crimean-war", 1.0)]);
        let chef = bio("b", "Chef", &[("chef", 1.0), ("crimean-war", 1.0)]);
        let nurse = bio("c", "Nurse", &[("nurse", 1.0), ("crimean-war", 1.0)]);
        let engine = SimilarityEngine::default();

        let admin_only = bio("d", "Clerk", &[("crimean-war", 1.0)]);
        let near = engine.compare(&cook, &admin_only, &labels).score;
        let same_branch = engine.compare(&cook, &chef, &labels).score;
        let other = engine.compare(&cook, &nurse, &labels).score;
        assert_eq!(same_branch, other, "both differ inside the occupation branch");
        assert!(near > same_branch, "a missing branch is penalised less");
    }

    #[test]
    fn identical_and_empty_edge_cases() {
        let labels = crimean_labels();
        let engine = SimilarityEngine::default();
        let florence = bio("florence", "Florence Nightingale", &[("nurse", 0.9)]);
        let same = engine.compare(&florence, &florence, &labels);
        assert_eq!(same.score, 1.0);
        assert!(same.rationale.is_empty());

        let empty_a = bio("x", "Unknown", &[]);
        let empty_b = bio("y", "Unknown", &[("retired-label", 0.9)]);
        let result = engine.compare(&empty_a, &empty_b, &labels);
        assert_eq!(result.score, 0.0);
        assert!(result.rationale.is_empty());
    }

    #[test]
    fn zero_confidence_links_are_ignored() {
        let labels = crimean_labels();
        let now = Utc::now();
        let mut a = bio("a", "A", &[("nurse", 1.0)]);
        let mut b = bio("b", "B", &[("nurse", 1.0)]);
        let link = |source: &str, confidence: f64| RelationshipLink {
            source_id: BiographyId::from(source),
            target_id: BiographyId::from("hotel"),
            kind: "works_at".into(),
            confidence,
            bidirectional: false,
            provenance: SourceKind::Manual,
            created_at: now,
            updated_at: now,
        };
        a.links.push(link("a", 0.9));
        b.links.push(link("b", 0.0));
        let engine = SimilarityEngine::default();
        let with_link = engine.compare(&a, &b, &labels);
        assert!(with_link.score < 1.0);

        b.links[0].confidence = 0.9;
        let shared = engine.compare(&a, &b, &labels);
        assert!((shared.score - 0.95).abs() < 1e-9, "got {}", shared.score);
        let link_entry = shared
            .rationale
            .iter()
            .find(|r| matches!(r.feature, FeatureRef::Relationship { .. }))
            .unwrap();
        assert!(link_entry.periods.is_empty());
    }

    #[test]
    fn identical_sets_score_their_combined_confidence() {
        let labels = crimean_labels();
        let a = bio("a", "A", &[("nurse", 0.5)]);
        let b = bio("b", "B", &[("nurse", 0.5)]);
        let engine = SimilarityEngine::default();
        let weak = engine.compare(&a, &b, &labels);
        assert!((weak.score - 0.5).abs() < 1e-12, "got {}", weak.score);

        let a = bio("a", "A", &[("nurse", 1.0), ("crimean-war", 0.5)]);
        let b = bio("b", "B", &[("nurse", 1.0), ("crimean-war", 0.5)]);
        let mixed = engine.compare(&a, &b, &labels);
        assert!((mixed.score - 0.75).abs() < 1e-12, "got {}", mixed.score);
    }

    #[test]
    fn aligned_periods_compare_only_shared_buckets() {
        let labels = crimean_labels();
        let soyer = phased(
            "soyer",
            "Alexis Soyer",
            &[("london", &[("cook", 1.0)][..]), ("crimea", &[("nurse", 1.0)][..])],
        );
        let seacole = phased(
            "seacole",
            "Mary Seacole",
            &[("crimea", &[("nurse", 1.0), ("cook", 1.0)][..])],
        );

        let merged = SimilarityEngine::default().compare(&soyer, &seacole, &labels);
        assert_eq!(merged.score, 1.0, "merged phases share both labels");
        assert_eq!(merged.shared_periods, ["crimea"]);
        let cook = merged
            .rationale
            .iter()
            .find(|r| r.feature == FeatureRef::Label { label_id: LabelId::from("cook") })
            .unwrap();
        assert_eq!(cook.periods, ["crimea", "london"]);

        let aligned = SimilarityEngine::new(
            ConfidenceModel::default(),
            SimilarityConfig {
                align_periods: true,
                ..SimilarityConfig::default()
            },
        );
        let result = aligned.compare(&soyer, &seacole, &labels);
        // Inside crimea only Seacole cooks, in a branch Soyer also uses.
        assert!((result.score - 0.25).abs() < 1e-12, "got {}", result.score);
        let cook = result
            .rationale
            .iter()
            .find(|r| r.feature == FeatureRef::Label { label_id: LabelId::from("cook") })
            .unwrap();
        assert!(cook.contribution < 0.0);
        assert!(cook.explanation.contains("only Mary Seacole has"));
        assert_eq!(cook.periods, ["crimea"]);

        let later = phased("later", "Later Life", &[("retirement", &[("nurse", 1.0)][..])]);
        let disjoint = aligned.compare(&soyer, &later, &labels);
        assert_eq!(disjoint.score, 0.0);
        assert!(disjoint.rationale.is_empty());
        assert!(disjoint.shared_periods.is_empty());
    }

    #[test]
    fn rank_orders_by_score_then_id_and_skips_archived() {
        let labels = crimean_labels();
        let target = bio("t", "Florence Nightingale", &[("nurse", 0.9), ("crimean-war", 1.0)]);
        let mut archived = bio("a0", "Archived Twin", &[("nurse", 0.9), ("crimean-war", 1.0)]);
        archived.archived = true;
        let candidates = vec![
            bio("c2", "Mary Seacole", &[("nurse", 0.8), ("crimean-war", 1.0)]),
            bio("c1", "Same Score", &[("nurse", 0.8), ("crimean-war", 1.0)]),
            bio("c3", "Alexis Soyer", &[("cook", 1.0), ("crimean-war", 1.0)]),
            archived,
            target.clone(),
        ];
        let engine = SimilarityEngine::default();
        let ranked = engine
            .rank_most_like(&target, &candidates, &labels, 10)
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.b.as_str()).collect();
        assert_eq!(ids, ["c1", "c2", "c3"]);

        let top = engine
            .rank_most_like(&target, &candidates, &labels, 1)
            .unwrap();
        assert_eq!(top.len(), 1);
        assert!(matches!(
            engine.rank_most_like(&target, &candidates, &labels, 0),
            Err(BiographError::InvalidArgument(_))
        ));
    }

    #[test]
    fn parallel_ranking_matches_sequential() {
        let labels = crimean_labels();
        let target = bio("t", "Target", &[("nurse", 0.9), ("crimean-war", 1.0)]);
        let confidences = [0.5, 0.6, 0.7, 0.8, 0.9];
        let candidates: Vec<Biography> = (0u8..150)
            .map(|i| bio(&format!("c{i:03}"), "Candidate", &pick(i % 32, &confidences)))
            .collect();

        let sequential = SimilarityEngine::new(
            ConfidenceModel::default(),
            SimilarityConfig {
                parallel_threshold: usize::MAX,
                ..SimilarityConfig::default()
            },
        );
        let parallel = SimilarityEngine::new(
            ConfidenceModel::default(),
            SimilarityConfig {
                parallel_threshold: 1,
                ..SimilarityConfig::default()
            },
        );
        let s = sequential
            .rank_most_like(&target, &candidates, &labels, 20)
            .unwrap();
        let p = parallel
            .rank_most_like(&target, &candidates, &labels, 20)
            .unwrap();
        assert_eq!(s, p);
    }

    const LABEL_IDS: [&str; 5] = ["nurse", "crimean-war", "hospital-admin", "cook", "chef"];

    fn pick(mask: u8, conf: &[f64]) -> Vec<(&'static str, f64)> {
        LABEL_IDS
            .iter()
            .enumerate()
            .filter(|(i, _)| (mask >> i) & 1 == 1)
            .map(|(i, id)| (*id, conf[i]))
            .collect()
    }

    proptest! {
        #[test]
        fn score_is_symmetric_and_bounded(
            ca in prop::collection::vec(0.0f64..=1.0, 5),
            cb in prop::collection::vec(0.0f64..=1.0, 5),
            mask_a in 0u8..32,
            mask_b in 0u8..32,
            align_periods in any::<bool>(),
        ) {
            let labels = crimean_labels();
            let (crimea, london) = (pick(mask_a, &ca), pick(mask_b, &ca));
            let a = phased("a", "A", &[("crimea", crimea.as_slice()), ("london", london.as_slice())]);
            let b = bio("b", "B", &pick(mask_b, &cb));
            let engine = SimilarityEngine::new(
                ConfidenceModel::default(),
                SimilarityConfig { align_periods, ..SimilarityConfig::default() },
            );
            let ab = engine.compare(&a, &b, &labels).score;
            let ba = engine.compare(&b, &a, &labels).score;
            prop_assert!((0.0..=1.0).contains(&ab));
            prop_assert_eq!(ab.to_bits(), ba.to_bits(), "asymmetric: {} vs {}", ab, ba);
        }
    }
}
