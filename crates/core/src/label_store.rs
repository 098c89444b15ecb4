//! Label Store: the arena of label definitions and its taxonomy indexes.
//!
//! Four redb tables back the store:
//!
//! - `labels`: label id → JSON record.
//! - `label_keys`: `entity␟path␟name` (lower-cased) → label id. Enforces the
//!   uniqueness of the `(entity type, taxonomy path, name)` triple and doubles
//!   as the path index used by [`LabelStore::list_by_path`].
//! - `taxonomy_groups`: `entity␟path` → display path, one row for every group
//!   on every registered ancestor chain.
//! - `label_history`: `id␟ulid` → JSON [`LabelRevision`].
//!
//! Writes that touch the same `(entity type, path)` scope are serialised by a
//! per-scope mutex in addition to redb's single-writer transactions, so a
//! batch that locks several scopes takes them in sorted order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use ulid::Ulid;

use crate::confidence;
use crate::model::{
    EntityType, Label, LabelId, LabelPatch, LabelRevision, NewLabel, TaxonomyPath,
};
use crate::{BiographError, Result, KEY_SEP};

const LABELS: TableDefinition<&str, &str> = TableDefinition::new("labels");
const LABEL_KEYS: TableDefinition<&str, &str> = TableDefinition::new("label_keys");
const TAXONOMY_GROUPS: TableDefinition<&str, &str> = TableDefinition::new("taxonomy_groups");
const LABEL_HISTORY: TableDefinition<&str, &str> = TableDefinition::new("label_history");

pub(crate) fn create_tables(write_txn: &WriteTransaction) -> Result<()> {
    write_txn.open_table(LABELS)?;
    write_txn.open_table(LABEL_KEYS)?;
    write_txn.open_table(TAXONOMY_GROUPS)?;
    write_txn.open_table(LABEL_HISTORY)?;
    Ok(())
}

/// Case- and whitespace-insensitive form of a label name.
pub(crate) fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn triple_key(entity_type: &EntityType, path: &TaxonomyPath, name: &str) -> String {
    format!(
        "{}{KEY_SEP}{}{KEY_SEP}{}",
        entity_type.as_str(),
        path.key(),
        normalize_name(name)
    )
}

fn scope_key(entity_type: &EntityType, path: &TaxonomyPath) -> String {
    format!("{}{KEY_SEP}{}", entity_type.as_str(), path.key())
}

/// Existence check for callers that already hold a write transaction.
pub(crate) fn label_exists_in_txn(write_txn: &WriteTransaction, id: &LabelId) -> Result<bool> {
    let table = write_txn.open_table(LABELS)?;
    let found = table.get(id.as_str())?.is_some();
    Ok(found)
}

// ---------------------------------------------------------------------------
// Scope locks
// ---------------------------------------------------------------------------

/// Lazily created mutex per `(entity type, taxonomy path)` scope.
#[derive(Debug, Default)]
pub(crate) struct ScopeLocks {
    scopes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    /// Resolve the mutexes for `keys`, deduplicated and in sorted order.
    fn resolve<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Result<Vec<Arc<Mutex<()>>>> {
        let ordered: BTreeSet<&str> = keys.into_iter().collect();
        let mut scopes = self
            .scopes
            .lock()
            .map_err(|_| BiographError::Internal("scope registry lock poisoned".into()))?;
        Ok(ordered
            .into_iter()
            .map(|key| Arc::clone(scopes.entry(key.to_string()).or_default()))
            .collect())
    }
}

fn lock_all(scopes: &[Arc<Mutex<()>>]) -> Result<Vec<MutexGuard<'_, ()>>> {
    scopes
        .iter()
        .map(|scope| {
            scope
                .lock()
                .map_err(|_| BiographError::Internal("label scope lock poisoned".into()))
        })
        .collect()
}

/// `label` with `patch` applied, validated against the immutable fields.
fn apply_patch(label: &Label, patch: &LabelPatch) -> Result<Label> {
    if patch
        .entity_type
        .as_ref()
        .is_some_and(|entity_type| entity_type != &label.entity_type)
    {
        return Err(BiographError::ImmutableField {
            id: label.id.clone(),
            field: "entity_type",
        });
    }
    if let Some(path) = &patch.taxonomy_path {
        let moved_root = path.root().map(str::to_lowercase)
            != label.taxonomy_path.root().map(str::to_lowercase);
        if moved_root {
            return Err(BiographError::ImmutableField {
                id: label.id.clone(),
                field: "taxonomy_path",
            });
        }
    }

    let mut next = label.clone();
    if let Some(name) = &patch.name {
        next.name = name.trim().to_string();
    }
    if let Some(path) = &patch.taxonomy_path {
        next.taxonomy_path = path.clone();
    }
    if let Some(metadata) = &patch.metadata {
        next.metadata = metadata.clone();
    }
    if let Some(provenance) = patch.provenance {
        next.provenance = provenance;
    }
    if let Some(c) = patch.confidence {
        next.confidence = confidence::validate(c, "label")?;
    }
    check_label_fields(&next.name, &next.entity_type, &next.taxonomy_path)?;
    Ok(next)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// View over the label tables of a [`Biograph`](crate::Biograph).
pub struct LabelStore<'a> {
    db: &'a Database,
    scopes: &'a ScopeLocks,
}

impl<'a> LabelStore<'a> {
    pub(crate) fn new(db: &'a Database, scopes: &'a ScopeLocks) -> Self {
        Self { db, scopes }
    }

    /// Create a label.
    ///
    /// Fails with [`BiographError::DuplicateLabel`] when a label with the same
    /// entity type, path and (case-insensitive) name already exists. Every
    /// ancestor group of the path is registered as a side effect.
    pub fn create(&self, new: NewLabel) -> Result<Label> {
        let new = prepare(new)?;
        let key = scope_key(&new.entity_type, &new.taxonomy_path);
        let scopes = self.scopes.resolve([key.as_str()])?;
        let _guards = lock_all(&scopes)?;

        let write_txn = self.db.begin_write()?;
        let (label, created) = Self::insert_in_txn(&write_txn, new)?;
        if !created {
            return Err(BiographError::DuplicateLabel {
                entity_type: label.entity_type.to_string(),
                path: label.taxonomy_path.to_string(),
                name: label.name,
                existing: label.id,
            });
        }
        write_txn.commit()?;
        tracing::debug!(label_id = %label.id, path = %label.taxonomy_path, "label created");
        Ok(label)
    }

    /// Create-or-get for a batch of labels in one transaction.
    ///
    /// Returns each label paired with `true` when it was newly created. Either
    /// every label is persisted or, on error, none is. Used by ingest
    /// acceptance, so repeating the same batch returns the same ids.
    pub fn create_or_get_many(&self, news: Vec<NewLabel>) -> Result<Vec<(Label, bool)>> {
        let news = news.into_iter().map(prepare).collect::<Result<Vec<_>>>()?;
        let keys: Vec<String> = news
            .iter()
            .map(|n| scope_key(&n.entity_type, &n.taxonomy_path))
            .collect();
        let scopes = self.scopes.resolve(keys.iter().map(String::as_str))?;
        let _guards = lock_all(&scopes)?;

        let write_txn = self.db.begin_write()?;
        let mut out = Vec::with_capacity(news.len());
        for new in news {
            out.push(Self::insert_in_txn(&write_txn, new)?);
        }
        write_txn.commit()?;
        let created = out.iter().filter(|(_, created)| *created).count();
        tracing::debug!(
            created,
            reused = out.len() - created,
            "label batch persisted"
        );
        Ok(out)
    }

    /// Insert `new` unless its triple already exists; returns the stored label
    /// and whether it was created.
    fn insert_in_txn(write_txn: &WriteTransaction, new: NewLabel) -> Result<(Label, bool)> {
        let key = triple_key(&new.entity_type, &new.taxonomy_path, &new.name);
        let existing = {
            let keys = write_txn.open_table(LABEL_KEYS)?;
            let found = keys.get(key.as_str())?.map(|v| v.value().to_string());
            found
        };
        if let Some(id) = existing {
            let labels = write_txn.open_table(LABELS)?;
            let raw = labels.get(id.as_str())?.map(|v| v.value().to_string());
            return match raw {
                Some(raw) => Ok((serde_json::from_str(&raw)?, false)),
                None => Err(BiographError::Storage(format!(
                    "label key {key:?} points at missing label {id}"
                ))),
            };
        }

        let now = Utc::now();
        let label = Label {
            id: LabelId::new(),
            name: new.name,
            entity_type: new.entity_type,
            taxonomy_path: new.taxonomy_path,
            metadata: new.metadata,
            provenance: new.provenance,
            confidence: new.confidence,
            archived: false,
            created_at: now,
            updated_at: now,
        };
        let value = serde_json::to_string(&label)?;
        {
            let mut labels = write_txn.open_table(LABELS)?;
            labels.insert(label.id.as_str(), value.as_str())?;
        }
        {
            let mut keys = write_txn.open_table(LABEL_KEYS)?;
            keys.insert(key.as_str(), label.id.as_str())?;
        }
        Self::register_groups_in_txn(write_txn, &label.entity_type, &label.taxonomy_path)?;
        Ok((label, true))
    }

    fn register_groups_in_txn(
        write_txn: &WriteTransaction,
        entity_type: &EntityType,
        path: &TaxonomyPath,
    ) -> Result<()> {
        let mut groups = write_txn.open_table(TAXONOMY_GROUPS)?;
        for ancestor in path.ancestors() {
            let key = scope_key(entity_type, &ancestor);
            if groups.get(key.as_str())?.is_none() {
                let display = ancestor.to_string();
                groups.insert(key.as_str(), display.as_str())?;
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &LabelId) -> Result<Label> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LABELS)?;
        match table.get(id.as_str())? {
            Some(raw) => Ok(serde_json::from_str(raw.value())?),
            None => Err(BiographError::NotFound(format!("label id {id}"))),
        }
    }

    /// Edit a label, recording the previous version in its history.
    ///
    /// The entity type is immutable and the path may only move within its
    /// root branch; violations fail with [`BiographError::ImmutableField`].
    pub fn update(&self, id: &LabelId, patch: LabelPatch) -> Result<Label> {
        loop {
            let current = self.get(id)?;
            let planned = apply_patch(&current, &patch)?;
            let old_scope = scope_key(&current.entity_type, &current.taxonomy_path);
            let new_scope = scope_key(&planned.entity_type, &planned.taxonomy_path);
            let scopes = self
                .scopes
                .resolve([old_scope.as_str(), new_scope.as_str()])?;
            let _guards = lock_all(&scopes)?;

            let write_txn = self.db.begin_write()?;
            let stored: Label = {
                let labels = write_txn.open_table(LABELS)?;
                let raw = labels.get(id.as_str())?.map(|v| v.value().to_string());
                match raw {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => return Err(BiographError::NotFound(format!("label id {id}"))),
                }
            };
            if stored.taxonomy_path != current.taxonomy_path {
                // Moved while we waited; the held locks cover the old scope.
                write_txn.abort()?;
                continue;
            }
            let mut next = apply_patch(&stored, &patch)?;

            let old_key = triple_key(&stored.entity_type, &stored.taxonomy_path, &stored.name);
            let new_key = triple_key(&next.entity_type, &next.taxonomy_path, &next.name);
            if old_key != new_key {
                let mut keys = write_txn.open_table(LABEL_KEYS)?;
                let clash = keys.get(new_key.as_str())?.map(|v| v.value().to_string());
                if let Some(existing) = clash {
                    if existing != id.as_str() {
                        return Err(BiographError::DuplicateLabel {
                            entity_type: next.entity_type.to_string(),
                            path: next.taxonomy_path.to_string(),
                            name: next.name,
                            existing: LabelId(existing),
                        });
                    }
                }
                keys.remove(old_key.as_str())?;
                keys.insert(new_key.as_str(), id.as_str())?;
            }
            Self::register_groups_in_txn(&write_txn, &next.entity_type, &next.taxonomy_path)?;

            let now = Utc::now();
            next.updated_at = now;
            let revision = serde_json::to_string(&LabelRevision {
                label: stored,
                replaced_at: now,
            })?;
            {
                let mut history = write_txn.open_table(LABEL_HISTORY)?;
                let key = format!("{id}{KEY_SEP}{}", Ulid::new());
                history.insert(key.as_str(), revision.as_str())?;
            }
            {
                let value = serde_json::to_string(&next)?;
                let mut labels = write_txn.open_table(LABELS)?;
                labels.insert(id.as_str(), value.as_str())?;
            }
            write_txn.commit()?;
            tracing::debug!(label_id = %id, "label updated");
            return Ok(next);
        }
    }

    /// Previous versions of a label, oldest first.
    pub fn history(&self, id: &LabelId) -> Result<Vec<LabelRevision>> {
        self.get(id)?;
        let prefix = format!("{id}{KEY_SEP}");
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LABEL_HISTORY)?;
        let mut revisions = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            revisions.push(serde_json::from_str(v.value())?);
        }
        Ok(revisions)
    }

    /// Hide a label from search and listings. Existing assignments keep
    /// resolving. Idempotent.
    pub fn archive(&self, id: &LabelId) -> Result<Label> {
        self.set_archived(id, true)
    }

    pub fn restore(&self, id: &LabelId) -> Result<Label> {
        self.set_archived(id, false)
    }

    fn set_archived(&self, id: &LabelId, archived: bool) -> Result<Label> {
        let write_txn = self.db.begin_write()?;
        let label = {
            let mut labels = write_txn.open_table(LABELS)?;
            let raw = labels.get(id.as_str())?.map(|v| v.value().to_string());
            let mut label: Label = match raw {
                Some(raw) => serde_json::from_str(&raw)?,
                None => return Err(BiographError::NotFound(format!("label id {id}"))),
            };
            if label.archived != archived {
                label.archived = archived;
                label.updated_at = Utc::now();
                let value = serde_json::to_string(&label)?;
                labels.insert(id.as_str(), value.as_str())?;
            }
            label
        };
        write_txn.commit()?;
        Ok(label)
    }

    /// Live labels of `entity_type` whose name contains `prefix`.
    ///
    /// Exact matches rank first, then prefix matches, then substring
    /// matches; ties break on lower-cased name and then id. An empty prefix
    /// lists every live label of the type.
    pub fn search(&self, entity_type: &EntityType, prefix: &str) -> Result<Vec<Label>> {
        let needle = normalize_name(prefix);
        let mut ranked: Vec<(u8, String, Label)> = self
            .scan(|label| &label.entity_type == entity_type && !label.archived)?
            .into_iter()
            .filter_map(|label| {
                let name = normalize_name(&label.name);
                let rank = if name == needle {
                    0
                } else if name.starts_with(&needle) {
                    1
                } else if name.contains(&needle) {
                    2
                } else {
                    return None;
                };
                Some((rank, name, label))
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.id.cmp(&b.2.id))
        });
        Ok(ranked.into_iter().map(|(_, _, label)| label).collect())
    }

    /// Live labels of `entity_type` at `path` or anywhere below it.
    ///
    /// An empty path lists the whole entity type. Results are ordered by
    /// path, then name.
    pub fn list_by_path(&self, entity_type: &EntityType, path: &TaxonomyPath) -> Result<Vec<Label>> {
        let entity_prefix = format!("{}{KEY_SEP}", entity_type.as_str());
        let wanted = path.key();
        let read_txn = self.db.begin_read()?;
        let keys = read_txn.open_table(LABEL_KEYS)?;
        let labels = read_txn.open_table(LABELS)?;

        let mut out = Vec::new();
        for entry in keys.range(entity_prefix.as_str()..)? {
            let (k, v) = entry?;
            let Some(rest) = k.value().strip_prefix(&entity_prefix) else {
                break;
            };
            let Some((label_path, _name)) = rest.split_once(KEY_SEP) else {
                continue;
            };
            let inside = wanted.is_empty()
                || label_path == wanted
                || label_path
                    .strip_prefix(&wanted)
                    .is_some_and(|tail| tail.starts_with('/'));
            if !inside {
                continue;
            }
            if let Some(raw) = labels.get(v.value())? {
                let label: Label = serde_json::from_str(raw.value())?;
                if !label.archived {
                    out.push(label);
                }
            }
        }
        Ok(out)
    }

    /// Every label, archived ones included, keyed by id.
    ///
    /// Similarity scoring resolves assignments against this map so one
    /// comparison sees a single consistent version of each label.
    pub fn snapshot(&self) -> Result<HashMap<LabelId, Label>> {
        Ok(self
            .scan(|_| true)?
            .into_iter()
            .map(|label| (label.id.clone(), label))
            .collect())
    }

    /// Register an empty taxonomy group (and its ancestors).
    pub fn create_group(&self, entity_type: &EntityType, path: &TaxonomyPath) -> Result<()> {
        entity_type.validate()?;
        if path.is_empty() {
            return Err(BiographError::InvalidArgument(
                "taxonomy group path must not be empty".into(),
            ));
        }
        path.validate()?;
        let write_txn = self.db.begin_write()?;
        Self::register_groups_in_txn(&write_txn, entity_type, path)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Names of the direct child groups of `path` (the empty path lists the
    /// top-level branches), sorted case-insensitively.
    pub fn children(&self, entity_type: &EntityType, path: &TaxonomyPath) -> Result<Vec<String>> {
        let parent = path.key();
        let mut names: Vec<String> = self
            .groups_of(entity_type)?
            .into_iter()
            .filter_map(|(key, display)| {
                let (head, tail) = match key.rsplit_once('/') {
                    Some((head, tail)) => (head, tail),
                    None => ("", key.as_str()),
                };
                (head == parent && !tail.is_empty())
                    .then(|| display.last().unwrap_or(tail).to_string())
            })
            .collect();
        names.sort_by_key(|n| n.to_lowercase());
        Ok(names)
    }

    /// Every registered group of `entity_type`, sorted by key.
    pub fn groups(&self, entity_type: &EntityType) -> Result<Vec<TaxonomyPath>> {
        Ok(self
            .groups_of(entity_type)?
            .into_iter()
            .map(|(_, display)| display)
            .collect())
    }

    fn groups_of(&self, entity_type: &EntityType) -> Result<Vec<(String, TaxonomyPath)>> {
        let prefix = format!("{}{KEY_SEP}", entity_type.as_str());
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TAXONOMY_GROUPS)?;
        let mut out = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            let Some(path_key) = k.value().strip_prefix(&prefix) else {
                break;
            };
            out.push((path_key.to_string(), TaxonomyPath::parse(v.value())));
        }
        Ok(out)
    }

    fn scan(&self, keep: impl Fn(&Label) -> bool) -> Result<Vec<Label>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LABELS)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let label: Label = serde_json::from_str(v.value())?;
            if keep(&label) {
                out.push(label);
            }
        }
        Ok(out)
    }
}

fn check_label_fields(name: &str, entity_type: &EntityType, path: &TaxonomyPath) -> Result<()> {
    if name.trim().is_empty() {
        return Err(BiographError::InvalidArgument(
            "label name must not be empty".into(),
        ));
    }
    entity_type.validate()?;
    if path.is_empty() {
        return Err(BiographError::InvalidArgument(format!(
            "label '{name}' needs a non-empty taxonomy path"
        )));
    }
    path.validate()
}

fn prepare(mut new: NewLabel) -> Result<NewLabel> {
    new.name = new.name.trim().to_string();
    check_label_fields(&new.name, &new.entity_type, &new.taxonomy_path)?;
    confidence::validate(new.confidence, "label")?;
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;
    use crate::Biograph;
    use std::collections::BTreeMap;
    use tempfile::NamedTempFile;

    fn open_temp_db() -> (Biograph, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let db = Biograph::open(&path).unwrap();
        (db, file)
    }

    fn person() -> EntityType {
        EntityType::Person
    }

    #[test]
    fn create_and_get_label() {
        let (db, _tmp) = open_temp_db();
        let created = db
            .labels()
            .create(
                NewLabel::new("person", "occupation/medical", " Nurse ")
                    .with_metadata("description", "Cares for the sick"),
            )
            .unwrap();
        assert_eq!(created.name, "Nurse", "name must be trimmed");

        let fetched = db.labels().get(&created.id).unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.provenance, SourceKind::Manual);
        assert_eq!(fetched.metadata["description"], "Cares for the sick");
    }

    #[test]
    fn duplicate_triple_is_rejected_case_insensitively() {
        let (db, _tmp) = open_temp_db();
        let first = db
            .labels()
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();
        let err = db
            .labels()
            .create(NewLabel::new("person", "Occupation/Medical", "NURSE"))
            .unwrap_err();
        match err {
            BiographError::DuplicateLabel { existing, .. } => assert_eq!(existing, first.id),
            other => panic!("expected DuplicateLabel, got {other:?}"),
        }

        // Same name under another path or entity type is a different label.
        db.labels()
            .create(NewLabel::new("person", "occupation/military", "Nurse"))
            .unwrap();
        db.labels()
            .create(NewLabel::new("building", "occupation/medical", "Nurse"))
            .unwrap();
    }

    #[test]
    fn concurrent_creates_of_one_triple_yield_one_label() {
        let (db, _tmp) = open_temp_db();
        let outcomes: Vec<Result<Label>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let db = db.clone();
                    s.spawn(move || {
                        db.labels()
                            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let created = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(created, 1, "exactly one create may win");
        assert!(outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, BiographError::DuplicateLabel { .. })));
        assert_eq!(db.labels().search(&person(), "nurse").unwrap().len(), 1);
    }

    #[test]
    fn create_validates_input() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        assert!(matches!(
            labels.create(NewLabel::new("person", "occupation", "  ")),
            Err(BiographError::InvalidArgument(_))
        ));
        assert!(matches!(
            labels.create(NewLabel::new("person", "", "Nurse")),
            Err(BiographError::InvalidArgument(_))
        ));
        assert!(matches!(
            labels.create(
                NewLabel::new("person", "occupation", "Nurse")
                    .with_provenance(SourceKind::Manual, 1.2)
            ),
            Err(BiographError::InvalidArgument(_))
        ));
    }

    #[test]
    fn get_unknown_label_is_not_found() {
        let (db, _tmp) = open_temp_db();
        let err = db.labels().get(&LabelId::from("missing")).unwrap_err();
        assert!(matches!(err, BiographError::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn search_ranks_exact_then_prefix_then_substring() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        for name in ["Head Nurse", "Nursemaid", "Nurse", "Army Nurse Corps", "Nurse Educator"] {
            labels
                .create(NewLabel::new("person", "occupation/medical", name))
                .unwrap();
        }
        labels
            .create(NewLabel::new("building", "use/medical", "Nurse Home"))
            .unwrap();

        let names: Vec<String> = labels
            .search(&person(), "nurse")
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(
            names,
            ["Nurse", "Nurse Educator", "Nursemaid", "Army Nurse Corps", "Head Nurse"]
        );

        assert_eq!(labels.search(&person(), "").unwrap().len(), 5);
        assert!(labels.search(&person(), "surgeon").unwrap().is_empty());
    }

    #[test]
    fn list_by_path_includes_descendants_only() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();
        labels
            .create(NewLabel::new("person", "occupation/medical/surgery", "Surgeon"))
            .unwrap();
        labels
            .create(NewLabel::new("person", "occupation/medicine-trade", "Apothecary"))
            .unwrap();
        labels
            .create(NewLabel::new("person", "honours", "Royal Red Cross"))
            .unwrap();

        let medical: Vec<String> = labels
            .list_by_path(&person(), &TaxonomyPath::parse("occupation/medical"))
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(medical, ["Nurse", "Surgeon"]);

        let all = labels
            .list_by_path(&person(), &TaxonomyPath::root_path())
            .unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn update_records_history_and_enforces_immutable_fields() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        let nurse = labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();

        let renamed = labels
            .update(
                &nurse.id,
                LabelPatch {
                    name: Some("Registered Nurse".into()),
                    taxonomy_path: Some(TaxonomyPath::parse("occupation/healthcare")),
                    confidence: Some(0.9),
                    ..LabelPatch::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.id, nurse.id, "id is stable across edits");
        assert_eq!(renamed.created_at, nurse.created_at);
        assert_eq!(renamed.confidence, 0.9);

        let history = labels.history(&nurse.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].label.name, "Nurse");

        // Old triple is free again, new triple is taken.
        labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();
        assert!(matches!(
            labels.create(NewLabel::new("person", "occupation/healthcare", "registered nurse")),
            Err(BiographError::DuplicateLabel { .. })
        ));

        let err = labels
            .update(
                &nurse.id,
                LabelPatch {
                    entity_type: Some(EntityType::Building),
                    ..LabelPatch::default()
                },
            )
            .unwrap_err();
        assert!(
            matches!(err, BiographError::ImmutableField { field: "entity_type", .. }),
            "got {err:?}"
        );
        let err = labels
            .update(
                &nurse.id,
                LabelPatch {
                    taxonomy_path: Some(TaxonomyPath::parse("honours/medical")),
                    ..LabelPatch::default()
                },
            )
            .unwrap_err();
        assert!(
            matches!(err, BiographError::ImmutableField { field: "taxonomy_path", .. }),
            "got {err:?}"
        );
        assert_eq!(labels.history(&nurse.id).unwrap().len(), 1);
    }

    #[test]
    fn update_into_existing_triple_is_duplicate() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        let nurse = labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();
        labels
            .create(NewLabel::new("person", "occupation/medical", "Surgeon"))
            .unwrap();
        let err = labels
            .update(
                &nurse.id,
                LabelPatch {
                    name: Some("surgeon".into()),
                    ..LabelPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, BiographError::DuplicateLabel { .. }), "got {err:?}");
        assert_eq!(labels.get(&nurse.id).unwrap().name, "Nurse");
    }

    #[test]
    fn concurrent_edits_to_different_fields_all_survive() {
        let (db, _tmp) = open_temp_db();
        let nurse = db
            .labels()
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();
        let rounds = 10;
        std::thread::scope(|s| {
            for round in 0..rounds {
                let (db_a, id) = (db.clone(), nurse.id.clone());
                s.spawn(move || {
                    db_a.labels()
                        .update(
                            &id,
                            LabelPatch {
                                metadata: Some(BTreeMap::from([(
                                    "wikidata".to_string(),
                                    "Q186360".to_string(),
                                )])),
                                ..LabelPatch::default()
                            },
                        )
                        .unwrap();
                });
                let (db_b, id) = (db.clone(), nurse.id.clone());
                s.spawn(move || {
                    db_b.labels()
                        .update(
                            &id,
                            LabelPatch {
                                confidence: Some(0.5),
                                ..LabelPatch::default()
                            },
                        )
                        .unwrap();
                });
                if round == rounds / 2 {
                    let (db_c, id) = (db.clone(), nurse.id.clone());
                    s.spawn(move || {
                        db_c.labels()
                            .update(
                                &id,
                                LabelPatch {
                                    taxonomy_path: Some(TaxonomyPath::parse("occupation/nursing")),
                                    ..LabelPatch::default()
                                },
                            )
                            .unwrap();
                    });
                }
            }
        });

        let stored = db.labels().get(&nurse.id).unwrap();
        assert_eq!(stored.metadata.get("wikidata").map(String::as_str), Some("Q186360"));
        assert_eq!(stored.confidence, 0.5);
        assert_eq!(stored.taxonomy_path, TaxonomyPath::parse("occupation/nursing"));
        assert_eq!(
            db.labels().history(&nurse.id).unwrap().len(),
            2 * rounds + 1,
            "every edit is recorded"
        );
    }

    #[test]
    fn archived_labels_leave_search_but_still_resolve() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        let nurse = labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();
        labels.archive(&nurse.id).unwrap();
        labels.archive(&nurse.id).unwrap();

        assert!(labels.search(&person(), "nurse").unwrap().is_empty());
        assert!(labels.get(&nurse.id).unwrap().archived);
        assert!(labels.snapshot().unwrap().contains_key(&nurse.id));

        labels.restore(&nurse.id).unwrap();
        assert_eq!(labels.search(&person(), "nurse").unwrap().len(), 1);
    }

    #[test]
    fn groups_register_ancestor_chains() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        labels
            .create(NewLabel::new("person", "Occupation/Medical", "Nurse"))
            .unwrap();
        labels
            .create_group(&person(), &TaxonomyPath::parse("occupation/Military/Navy"))
            .unwrap();
        labels
            .create_group(&person(), &TaxonomyPath::parse("Honours"))
            .unwrap();

        assert_eq!(
            labels.children(&person(), &TaxonomyPath::root_path()).unwrap(),
            ["Honours", "Occupation"]
        );
        assert_eq!(
            labels
                .children(&person(), &TaxonomyPath::parse("occupation"))
                .unwrap(),
            ["Medical", "Military"]
        );
        assert_eq!(labels.groups(&person()).unwrap().len(), 5);
        assert!(labels.groups(&EntityType::Building).unwrap().is_empty());
    }

    #[test]
    fn create_or_get_many_is_idempotent_and_atomic() {
        let (db, _tmp) = open_temp_db();
        let labels = db.labels();
        let existing = labels
            .create(NewLabel::new("person", "occupation/medical", "Nurse"))
            .unwrap();

        let batch = vec![
            NewLabel::new("person", "occupation/medical", "nurse"),
            NewLabel::new("person", "honours", "Royal Red Cross"),
        ];
        let first = labels.create_or_get_many(batch.clone()).unwrap();
        assert_eq!(first[0].0.id, existing.id);
        assert!(!first[0].1);
        assert!(first[1].1);

        let second = labels.create_or_get_many(batch).unwrap();
        assert_eq!(second[1].0.id, first[1].0.id, "second run must reuse ids");
        assert!(second.iter().all(|(_, created)| !created));

        let err = labels
            .create_or_get_many(vec![
                NewLabel::new("person", "honours", "Order of Merit"),
                NewLabel::new("person", "", "Broken"),
            ])
            .unwrap_err();
        assert!(matches!(err, BiographError::InvalidArgument(_)));
        assert!(
            labels.search(&person(), "order of merit").unwrap().is_empty(),
            "failed batch must persist nothing"
        );
    }
}
