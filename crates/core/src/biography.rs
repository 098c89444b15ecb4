//! Biography Aggregator: create and edit biographies, their life phases and
//! label assignments.
//!
//! Records are stored as JSON under their id. Links are owned by the
//! [`Linker`](crate::Linker); they are stripped before a record is written
//! and re-attached whenever one is read.

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};

use crate::confidence;
use crate::label_store;
use crate::linker;
use crate::model::{
    Biography, BiographyDraft, BiographyId, EntityType, LabelAssignment, LabelId, LifePhase,
    NewBiography, Period, PhasePatch, RelationshipLink, SourceKind,
};
use crate::{BiographError, Result};

const BIOGRAPHIES: TableDefinition<&str, &str> = TableDefinition::new("biographies");

pub(crate) fn create_tables(write_txn: &WriteTransaction) -> Result<()> {
    write_txn.open_table(BIOGRAPHIES)?;
    Ok(())
}

pub(crate) fn exists_in_txn(write_txn: &WriteTransaction, id: &BiographyId) -> Result<bool> {
    let table = write_txn.open_table(BIOGRAPHIES)?;
    let found = table.get(id.as_str())?.is_some();
    Ok(found)
}

fn load_in_txn(write_txn: &WriteTransaction, id: &BiographyId) -> Result<Biography> {
    let table = write_txn.open_table(BIOGRAPHIES)?;
    let raw = table.get(id.as_str())?.map(|v| v.value().to_string());
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Err(BiographError::NotFound(format!("biography id {id}"))),
    }
}

fn store_in_txn(write_txn: &WriteTransaction, bio: &Biography) -> Result<()> {
    let mut record = bio.clone();
    record.links.clear();
    let value = serde_json::to_string(&record)?;
    let mut table = write_txn.open_table(BIOGRAPHIES)?;
    table.insert(bio.id.as_str(), value.as_str())?;
    Ok(())
}

fn attach_links(bio: &mut Biography, links: &[RelationshipLink]) {
    bio.links = links
        .iter()
        .filter(|link| link.other_end(&bio.id).is_some())
        .cloned()
        .collect();
}

fn check_name(entity_type: &EntityType, name: &str) -> Result<()> {
    entity_type.validate()?;
    if name.trim().is_empty() {
        return Err(BiographError::InvalidArgument(
            "biography name must not be empty".into(),
        ));
    }
    Ok(())
}

fn phase_mut<'b>(bio: &'b mut Biography, index: usize) -> Result<&'b mut LifePhase> {
    let id = bio.id.clone();
    bio.phases
        .get_mut(index)
        .ok_or_else(|| BiographError::NotFound(format!("phase {index} of biography {id}")))
}

/// Insert or replace the assignment of `label_id` in `phase`.
fn upsert_assignment(
    phase: &mut LifePhase,
    label_id: &LabelId,
    confidence: f64,
    provenance: SourceKind,
) {
    let assignment = LabelAssignment {
        label_id: label_id.clone(),
        confidence,
        provenance,
        assigned_at: Utc::now(),
    };
    match phase.labels.iter_mut().find(|a| &a.label_id == label_id) {
        Some(existing) => *existing = assignment,
        None => phase.labels.push(assignment),
    }
}

/// View over the biography table of a [`Biograph`](crate::Biograph).
pub struct Biographies<'a> {
    db: &'a Database,
}

impl<'a> Biographies<'a> {
    pub(crate) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(&self, new: NewBiography) -> Result<Biography> {
        check_name(&new.entity_type, &new.name)?;
        let now = Utc::now();
        let bio = Biography {
            id: BiographyId::new(),
            entity_type: new.entity_type,
            name: new.name.trim().to_string(),
            phases: Vec::new(),
            links: Vec::new(),
            archived: false,
            created_at: now,
            updated_at: now,
        };
        let write_txn = self.db.begin_write()?;
        store_in_txn(&write_txn, &bio)?;
        write_txn.commit()?;
        tracing::debug!(biography_id = %bio.id, entity_type = %bio.entity_type, "biography created");
        Ok(bio)
    }

    /// Create a biography together with its phases, label assignments and
    /// outgoing links, atomically. Every referenced label and link target
    /// must already exist.
    pub fn compose(&self, draft: BiographyDraft) -> Result<Biography> {
        check_name(&draft.entity_type, &draft.name)?;
        let now = Utc::now();
        let mut bio = Biography {
            id: BiographyId::new(),
            entity_type: draft.entity_type,
            name: draft.name.trim().to_string(),
            phases: Vec::with_capacity(draft.phases.len()),
            links: Vec::new(),
            archived: false,
            created_at: now,
            updated_at: now,
        };

        let write_txn = self.db.begin_write()?;
        for phase_draft in draft.phases {
            phase_draft.period.validate()?;
            let mut phase = LifePhase::new(phase_draft.period, phase_draft.narrative);
            for assignment in phase_draft.labels {
                confidence::validate(assignment.confidence, "assignment")?;
                if !label_store::label_exists_in_txn(&write_txn, &assignment.label_id)? {
                    return Err(BiographError::NotFound(format!(
                        "label id {}",
                        assignment.label_id
                    )));
                }
                upsert_assignment(
                    &mut phase,
                    &assignment.label_id,
                    assignment.confidence,
                    assignment.provenance,
                );
            }
            bio.phases.push(phase);
        }
        store_in_txn(&write_txn, &bio)?;
        for link in draft.links {
            let stored = linker::link_in_txn(
                &write_txn,
                &bio.id,
                &link.target_id,
                &link.kind,
                link.confidence,
                link.bidirectional,
                SourceKind::Manual,
            )?;
            bio.links.push(stored);
        }
        write_txn.commit()?;
        tracing::debug!(
            biography_id = %bio.id,
            phases = bio.phases.len(),
            links = bio.links.len(),
            "biography composed"
        );
        Ok(bio)
    }

    /// Fetch a biography with its links attached.
    pub fn get(&self, id: &BiographyId) -> Result<Biography> {
        let read_txn = self.db.begin_read()?;
        let mut bio: Biography = {
            let table = read_txn.open_table(BIOGRAPHIES)?;
            let raw = table.get(id.as_str())?.map(|v| v.value().to_string());
            match raw {
                Some(raw) => serde_json::from_str(&raw)?,
                None => return Err(BiographError::NotFound(format!("biography id {id}"))),
            }
        };
        let links = linker::all_links(&read_txn)?;
        attach_links(&mut bio, &links);
        Ok(bio)
    }

    /// Biographies with links attached, oldest first.
    ///
    /// `entity_type` narrows the listing to one kind; archived records are
    /// skipped unless `include_archived` is set.
    pub fn list(
        &self,
        entity_type: Option<&EntityType>,
        include_archived: bool,
    ) -> Result<Vec<Biography>> {
        let read_txn = self.db.begin_read()?;
        let links = linker::all_links(&read_txn)?;
        let table = read_txn.open_table(BIOGRAPHIES)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let mut bio: Biography = serde_json::from_str(v.value())?;
            if entity_type.is_some_and(|t| t != &bio.entity_type) {
                continue;
            }
            if bio.archived && !include_archived {
                continue;
            }
            attach_links(&mut bio, &links);
            out.push(bio);
        }
        Ok(out)
    }

    /// Live biographies whose name matches `query`, optionally limited to
    /// one entity type.
    ///
    /// Ranked like label search: exact name first, then prefix, then
    /// substring matches, with ties on lower-cased name and then id.
    pub fn search(&self, entity_type: Option<&EntityType>, query: &str) -> Result<Vec<Biography>> {
        let needle = label_store::normalize_name(query);
        let mut ranked: Vec<(u8, String, Biography)> = self
            .list(entity_type, false)?
            .into_iter()
            .filter_map(|bio| {
                let name = label_store::normalize_name(&bio.name);
                let rank = if name == needle {
                    0
                } else if name.starts_with(&needle) {
                    1
                } else if name.contains(&needle) {
                    2
                } else {
                    return None;
                };
                Some((rank, name, bio))
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.id.cmp(&b.2.id))
        });
        Ok(ranked.into_iter().map(|(_, _, bio)| bio).collect())
    }

    fn modify<T>(
        &self,
        id: &BiographyId,
        edit: impl FnOnce(&WriteTransaction, &mut Biography) -> Result<T>,
    ) -> Result<(Biography, T)> {
        let write_txn = self.db.begin_write()?;
        let mut bio = load_in_txn(&write_txn, id)?;
        let outcome = edit(&write_txn, &mut bio)?;
        bio.updated_at = Utc::now();
        store_in_txn(&write_txn, &bio)?;
        write_txn.commit()?;
        Ok((self.get(id)?, outcome))
    }

    pub fn rename(&self, id: &BiographyId, name: &str) -> Result<Biography> {
        let (bio, ()) = self.modify(id, |_, bio| {
            check_name(&bio.entity_type, name)?;
            bio.name = name.trim().to_string();
            Ok(())
        })?;
        Ok(bio)
    }

    /// Append a life phase. Returns the updated biography; the new phase is
    /// the last one.
    pub fn add_phase(
        &self,
        id: &BiographyId,
        period: Period,
        narrative: &str,
    ) -> Result<Biography> {
        period.validate()?;
        let (bio, ()) = self.modify(id, |_, bio| {
            bio.phases.push(LifePhase::new(period, narrative));
            Ok(())
        })?;
        Ok(bio)
    }

    pub fn update_phase(
        &self,
        id: &BiographyId,
        index: usize,
        patch: PhasePatch,
    ) -> Result<Biography> {
        if let Some(period) = &patch.period {
            period.validate()?;
        }
        let (bio, ()) = self.modify(id, |_, bio| {
            let phase = phase_mut(bio, index)?;
            if let Some(period) = patch.period {
                phase.period = period;
            }
            if let Some(narrative) = patch.narrative {
                phase.narrative = narrative;
            }
            Ok(())
        })?;
        Ok(bio)
    }

    /// Remove a phase and the assignments it carries.
    pub fn remove_phase(&self, id: &BiographyId, index: usize) -> Result<Biography> {
        let (bio, ()) = self.modify(id, |_, bio| {
            phase_mut(bio, index)?;
            bio.phases.remove(index);
            Ok(())
        })?;
        Ok(bio)
    }

    /// Attach an existing label to phase `phase` with the given confidence.
    ///
    /// Assigning a label the phase already carries replaces that assignment.
    pub fn assign_label(
        &self,
        id: &BiographyId,
        phase: usize,
        label_id: &LabelId,
        confidence: f64,
        provenance: SourceKind,
    ) -> Result<Biography> {
        confidence::validate(confidence, "assignment")?;
        let (bio, ()) = self.modify(id, |write_txn, bio| {
            if !label_store::label_exists_in_txn(write_txn, label_id)? {
                return Err(BiographError::NotFound(format!("label id {label_id}")));
            }
            upsert_assignment(phase_mut(bio, phase)?, label_id, confidence, provenance);
            Ok(())
        })?;
        tracing::debug!(biography_id = %id, label_id = %label_id, phase, confidence, "label assigned");
        Ok(bio)
    }

    /// Detach a label from a phase. Returns whether it was assigned.
    pub fn remove_label(&self, id: &BiographyId, phase: usize, label_id: &LabelId) -> Result<bool> {
        let (_, removed) = self.modify(id, |_, bio| {
            let phase = phase_mut(bio, phase)?;
            let before = phase.labels.len();
            phase.labels.retain(|a| &a.label_id != label_id);
            Ok(phase.labels.len() != before)
        })?;
        Ok(removed)
    }

    /// Hide a biography from listings and rankings. Idempotent.
    pub fn archive(&self, id: &BiographyId) -> Result<Biography> {
        let (bio, ()) = self.modify(id, |_, bio| {
            bio.archived = true;
            Ok(())
        })?;
        Ok(bio)
    }

    pub fn restore(&self, id: &BiographyId) -> Result<Biography> {
        let (bio, ()) = self.modify(id, |_, bio| {
            bio.archived = false;
            Ok(())
        })?;
        Ok(bio)
    }
}
