//! Relationship Linker: typed, confidence-scored links between biographies.
//!
//! Links live in their own table and are keyed so that each
//! `(source, target, kind)` slot holds at most one directed link and each
//! unordered `{a, b, kind}` pair at most one bidirectional link:
//!
//! - directed: `out␟source␟target␟kind`
//! - bidirectional: `both␟min(a,b)␟max(a,b)␟kind`
//!
//! Kinds match case-insensitively.

use chrono::Utc;
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};

use crate::biography;
use crate::confidence;
use crate::model::{BiographyId, RelationshipLink, SourceKind};
use crate::{BiographError, Result, KEY_SEP};

const LINKS: TableDefinition<&str, &str> = TableDefinition::new("relationship_links");

pub(crate) fn create_tables(write_txn: &WriteTransaction) -> Result<()> {
    write_txn.open_table(LINKS)?;
    Ok(())
}

fn link_key(source: &BiographyId, target: &BiographyId, kind: &str, bidirectional: bool) -> String {
    let kind = kind.trim().to_lowercase();
    if bidirectional {
        let (a, b) = if source <= target {
            (source, target)
        } else {
            (target, source)
        };
        format!("both{KEY_SEP}{a}{KEY_SEP}{b}{KEY_SEP}{kind}")
    } else {
        format!("out{KEY_SEP}{source}{KEY_SEP}{target}{KEY_SEP}{kind}")
    }
}

/// Every stored link, in key order.
pub(crate) fn all_links(read_txn: &ReadTransaction) -> Result<Vec<RelationshipLink>> {
    let table = read_txn.open_table(LINKS)?;
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (_k, v) = entry?;
        out.push(serde_json::from_str(v.value())?);
    }
    Ok(out)
}

/// Create or update a link inside an open write transaction.
pub(crate) fn link_in_txn(
    write_txn: &WriteTransaction,
    source: &BiographyId,
    target: &BiographyId,
    kind: &str,
    confidence: f64,
    bidirectional: bool,
    provenance: SourceKind,
) -> Result<RelationshipLink> {
    if source == target {
        return Err(BiographError::SelfLink(source.clone()));
    }
    let kind = kind.trim();
    if kind.is_empty() {
        return Err(BiographError::InvalidArgument(
            "relationship kind must not be empty".into(),
        ));
    }
    confidence::validate(confidence, "link")?;
    for id in [source, target] {
        if !biography::exists_in_txn(write_txn, id)? {
            return Err(BiographError::NotFound(format!("biography id {id}")));
        }
    }

    let key = link_key(source, target, kind, bidirectional);
    let mut table = write_txn.open_table(LINKS)?;
    let stored = table.get(key.as_str())?.map(|v| v.value().to_string());
    let now = Utc::now();
    let link = match stored {
        Some(raw) => {
            let mut link: RelationshipLink = serde_json::from_str(&raw)?;
            if link.confidence == confidence && link.provenance == provenance {
                return Ok(link);
            }
            link.confidence = confidence;
            link.provenance = provenance;
            link.updated_at = now;
            link
        }
        None => RelationshipLink {
            source_id: source.clone(),
            target_id: target.clone(),
            kind: kind.to_string(),
            confidence,
            bidirectional,
            provenance,
            created_at: now,
            updated_at: now,
        },
    };
    let value = serde_json::to_string(&link)?;
    table.insert(key.as_str(), value.as_str())?;
    Ok(link)
}

/// View over the link table of a [`Biograph`](crate::Biograph).
pub struct Linker<'a> {
    db: &'a Database,
}

impl<'a> Linker<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Link two biographies with a manual link.
    ///
    /// Re-linking with identical attributes is a no-op; with a different
    /// confidence it updates the stored link in place.
    pub fn link(
        &self,
        source: &BiographyId,
        target: &BiographyId,
        kind: &str,
        confidence: f64,
        bidirectional: bool,
    ) -> Result<RelationshipLink> {
        self.link_with_provenance(source, target, kind, confidence, bidirectional, SourceKind::Manual)
    }

    pub fn link_with_provenance(
        &self,
        source: &BiographyId,
        target: &BiographyId,
        kind: &str,
        confidence: f64,
        bidirectional: bool,
        provenance: SourceKind,
    ) -> Result<RelationshipLink> {
        let write_txn = self.db.begin_write()?;
        let link = link_in_txn(
            &write_txn,
            source,
            target,
            kind,
            confidence,
            bidirectional,
            provenance,
        )?;
        write_txn.commit()?;
        tracing::debug!(
            source = %source,
            target = %target,
            kind = %link.kind,
            confidence = link.confidence,
            "relationship linked"
        );
        Ok(link)
    }

    /// Change the confidence of existing `source → target` links of `kind`,
    /// directed or bidirectional.
    pub fn relink(
        &self,
        source: &BiographyId,
        target: &BiographyId,
        kind: &str,
        confidence: f64,
    ) -> Result<Vec<RelationshipLink>> {
        confidence::validate(confidence, "link")?;
        let write_txn = self.db.begin_write()?;
        let mut updated = Vec::new();
        {
            let mut table = write_txn.open_table(LINKS)?;
            for bidirectional in [false, true] {
                let key = link_key(source, target, kind, bidirectional);
                let stored = table.get(key.as_str())?.map(|v| v.value().to_string());
                if let Some(raw) = stored {
                    let mut link: RelationshipLink = serde_json::from_str(&raw)?;
                    link.confidence = confidence;
                    link.updated_at = Utc::now();
                    let value = serde_json::to_string(&link)?;
                    table.insert(key.as_str(), value.as_str())?;
                    updated.push(link);
                }
            }
        }
        if updated.is_empty() {
            return Err(BiographError::NotFound(format!(
                "link {source} -[{}]-> {target}",
                kind.trim()
            )));
        }
        write_txn.commit()?;
        Ok(updated)
    }

    /// Remove `source → target` links of `kind`. Returns whether anything was
    /// removed; unlinking twice is not an error.
    pub fn unlink(&self, source: &BiographyId, target: &BiographyId, kind: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let mut removed = false;
        {
            let mut table = write_txn.open_table(LINKS)?;
            for bidirectional in [false, true] {
                let key = link_key(source, target, kind, bidirectional);
                removed |= table.remove(key.as_str())?.is_some();
            }
        }
        write_txn.commit()?;
        if removed {
            tracing::debug!(source = %source, target = %target, kind = kind.trim(), "relationship unlinked");
        }
        Ok(removed)
    }

    /// Links visible from `id`: its outgoing links plus every bidirectional
    /// link that involves it.
    pub fn links_for(&self, id: &BiographyId) -> Result<Vec<RelationshipLink>> {
        let read_txn = self.db.begin_read()?;
        Ok(all_links(&read_txn)?
            .into_iter()
            .filter(|link| link.other_end(id).is_some())
            .collect())
    }

    /// Directed links pointing at `id`.
    pub fn incoming(&self, id: &BiographyId) -> Result<Vec<RelationshipLink>> {
        let read_txn = self.db.begin_read()?;
        Ok(all_links(&read_txn)?
            .into_iter()
            .filter(|link| !link.bidirectional && &link.target_id == id)
            .collect())
    }
}
