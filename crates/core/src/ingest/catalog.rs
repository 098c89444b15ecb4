//! Data source backed by the engine's own label store.
//!
//! Scores every live label against the query terms with a term-frequency
//! keyword score (`Σ √freq` over matching terms), boosts labels of the
//! queried entity type and path, and returns the best-scoring pool as
//! records. Accepting one of its candidates resolves to the existing label.
//!
//! Scoring reads a full label snapshot from redb, so it runs on tokio's
//! blocking pool rather than on an executor thread.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use super::keyword::tokenize;
use super::{DataSource, RawRecord, StructuredQuery};
use crate::confidence;
use crate::model::{Label, SourceKind};
use crate::{BiographError, Biograph, Result};

const SAME_TYPE_BOOST: f64 = 1.15;
const PATH_HINT_BOOST: f64 = 1.25;

/// `Σ √freq(term)` over query terms that occur in `haystack`.
pub(crate) fn keyword_score(terms: &[String], haystack: &[String]) -> f64 {
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for token in haystack {
        *freq.entry(token.as_str()).or_default() += 1;
    }
    terms
        .iter()
        .filter_map(|t| freq.get(t.as_str()))
        .map(|&n| (n as f64).sqrt())
        .sum()
}

fn haystack(label: &Label) -> Vec<String> {
    let mut text = format!(
        "{} {} {}",
        label.name,
        label.taxonomy_path.segments().join(" "),
        label.entity_type
    );
    if let Some(description) = label.metadata.get("description") {
        text.push(' ');
        text.push_str(description);
    }
    tokenize(&text)
}

#[derive(Clone)]
pub struct CatalogSource {
    graph: Biograph,
    pool_size: usize,
}

impl CatalogSource {
    pub fn new(graph: Biograph) -> Self {
        let pool_size = graph.config().ingest.catalog_pool_size;
        Self { graph, pool_size }
    }

    fn rank(&self, query: &StructuredQuery) -> Result<Vec<RawRecord>> {
        let snapshot = self.graph.labels().snapshot()?;
        let ceiling = query.terms.len().max(1) as f64;

        let mut scored: Vec<(f64, Label)> = snapshot
            .into_values()
            .filter(|label| !label.archived)
            .filter_map(|label| {
                let mut score = keyword_score(&query.terms, &haystack(&label));
                let in_hint = query
                    .taxonomy_hint
                    .as_ref()
                    .is_some_and(|hint| label.taxonomy_path.is_within(hint));
                if query.terms.is_empty() && in_hint {
                    score = 1.0;
                }
                if score <= 0.0 {
                    return None;
                }
                if query.entity_type.as_ref() == Some(&label.entity_type) {
                    score *= SAME_TYPE_BOOST;
                }
                if in_hint {
                    score *= PATH_HINT_BOOST;
                }
                Some((score, label))
            })
            .collect();
        scored.sort_by(|(sa, la), (sb, lb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| la.id.cmp(&lb.id))
        });
        scored.truncate(self.pool_size);

        Ok(scored
            .into_iter()
            .map(|(score, label)| RawRecord {
                name: label.name,
                entity_type: Some(label.entity_type),
                taxonomy_path: Some(label.taxonomy_path),
                metadata: BTreeMap::from([("catalog_label_id".to_string(), label.id.0)]),
                confidence: Some(confidence::clamp(score / ceiling)),
            })
            .collect())
    }
}

#[async_trait]
impl DataSource for CatalogSource {
    fn name(&self) -> &str {
        "catalog"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::IngestSuggested
    }

    async fn query(&self, query: &StructuredQuery) -> Result<Vec<RawRecord>> {
        if query.terms.is_empty() && query.taxonomy_hint.is_none() {
            return Ok(Vec::new());
        }
        let source = self.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || source.rank(&query))
            .await
            .map_err(|e| BiographError::Internal(format!("catalog source worker failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, NewLabel, TaxonomyPath};

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn keyword_score_uses_sqrt_frequency() {
        let hay = tokenize("nurse nurse nurse nurse medical");
        let score = keyword_score(&terms(&["nurse", "medical", "war"]), &hay);
        assert!((score - 3.0).abs() < 1e-12, "√4 + √1 = 3, got {score}");
        assert_eq!(keyword_score(&terms(&["war"]), &hay), 0.0);
    }

    #[tokio::test]
    async fn prefers_matching_type_and_skips_archived() {
        let graph = Biograph::open_in_memory().unwrap();
        let labels = graph.labels();
        labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();
        labels
            .create(NewLabel::new("building", "use/medical", "Nurse Training School"))
            .unwrap();
        let retired = labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse Probationer"))
            .unwrap();
        labels.archive(&retired.id).unwrap();
        labels
            .create(NewLabel::new("person", "occupation/military", "Soldier"))
            .unwrap();

        let source = CatalogSource::new(graph.clone());
        let records = source
            .query(&StructuredQuery {
                entity_type: Some(EntityType::Person),
                taxonomy_hint: None,
                terms: terms(&["nurse"]),
            })
            .await
            .unwrap();

        let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["Nurse", "Nurse Training School"]);
        assert_eq!(records[0].confidence, Some(1.0));
        assert!(records[0].metadata.contains_key("catalog_label_id"));

        let by_path = source
            .query(&StructuredQuery {
                entity_type: None,
                taxonomy_hint: Some(TaxonomyPath::parse("occupation/military")),
                terms: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(by_path.len(), 1);
        assert_eq!(by_path[0].name, "Soldier");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_queries_agree() {
        let graph = Biograph::open_in_memory().unwrap();
        for name in ["Nurse", "Nurse Midwife", "Army Nurse", "Surgeon"] {
            graph
                .labels()
                .create(NewLabel::new("person", "occupation/medical", name))
                .unwrap();
        }
        let source = CatalogSource::new(graph);
        let query = StructuredQuery {
            entity_type: Some(EntityType::Person),
            taxonomy_hint: None,
            terms: terms(&["nurse"]),
        };

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let source = source.clone();
            let query = query.clone();
            set.spawn(async move { source.query(&query).await });
        }
        let expected = source.rank(&query).unwrap();
        assert_eq!(expected.len(), 3);
        while let Some(joined) = set.join_next().await {
            assert_eq!(joined.unwrap().unwrap(), expected);
        }
    }
}
