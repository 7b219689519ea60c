use chrono::{DateTime, Utc};
use tracing::debug;

use lockdoc_core::{ActorId, Entity, EntityId, HistoricEntry, HistoricKind, escape::unescape_document};
use lockdoc_storage::DocumentStore;

use crate::error::EngineError;

/// Append-only access to the historic entries of one collection.
///
/// Snapshots are written in stored (escaped) form and the persisted checksum
/// covers that form; the store verifies it on every read. Entries handed back
/// to callers carry the unescaped snapshot and a checksum over it, so
/// `HistoricEntry::verify` holds for what the caller sees.
#[derive(Debug, Clone)]
pub struct HistoricManager {
    collection: String,
}

impl HistoricManager {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
        }
    }

    pub fn record_snapshot<S: DocumentStore>(
        &self,
        store: &mut S,
        kind: HistoricKind,
        stored_snapshot: &Entity,
        actor: &ActorId,
        date: DateTime<Utc>,
    ) -> Result<HistoricEntry, EngineError> {
        let entry = HistoricEntry::new(kind, stored_snapshot.clone(), actor, date)?;
        store
            .append_historic(&self.collection, &entry)
            .map_err(|source| EngineError::Historic {
                entity_id: entry.entity_id.to_string(),
                source,
            })?;
        debug!(
            collection = %self.collection,
            entity_id = %entry.entity_id,
            kind = entry.kind.as_str(),
            "recorded historic snapshot"
        );
        Ok(entry)
    }

    /// Oldest first.
    pub fn find_for_entity<S: DocumentStore>(
        &self,
        store: &S,
        id: EntityId,
    ) -> Result<Vec<HistoricEntry>, EngineError> {
        store
            .historic_for_entity(&self.collection, id)?
            .into_iter()
            .map(unescape_entry)
            .collect()
    }

    pub fn find_most_recent_by_actor<S: DocumentStore>(
        &self,
        store: &S,
        id: EntityId,
        actor: &ActorId,
    ) -> Result<Option<HistoricEntry>, EngineError> {
        store
            .most_recent_historic_by_actor(&self.collection, id, actor)?
            .map(unescape_entry)
            .transpose()
    }
}

fn unescape_entry(mut entry: HistoricEntry) -> Result<HistoricEntry, EngineError> {
    entry.snapshot.body = unescape_document(&entry.snapshot.body)?;
    entry.checksum = HistoricEntry::compute_checksum(&entry.snapshot)?;
    Ok(entry)
}
