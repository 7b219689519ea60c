use std::collections::BTreeMap;

use lockdoc_core::{
    ActorId, Entity, EntityId, EntityMetadata, FieldPath, HistoricEntry, Value, path::set_at_path,
};

use crate::error::StorageError;
use crate::traits::{DocumentStore, conflict};

#[derive(Debug, Clone, Default)]
struct State {
    documents: BTreeMap<(String, EntityId), Entity>,
    inserted: Vec<(String, EntityId)>,
    historic: Vec<(String, HistoricEntry)>,
}

/// In-process store with the same conditional-write and append-only
/// semantics as [`crate::SqliteStore`].
///
/// A transaction keeps a copy of the state taken at `begin`; `rollback`
/// restores it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: State,
    saved: Option<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.saved.is_some()
    }

    fn key(collection: &str, id: EntityId) -> (String, EntityId) {
        (collection.to_string(), id)
    }

    fn check_version(
        &self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        match self.state.documents.get(&Self::key(collection, id)) {
            Some(stored) if stored.version == expected_version => Ok(()),
            Some(stored) => Err(conflict(id, expected_version, Some(stored.version))),
            None => Err(conflict(id, expected_version, None)),
        }
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, collection: &str, id: EntityId) -> Result<Option<Entity>, StorageError> {
        Ok(self.state.documents.get(&Self::key(collection, id)).cloned())
    }

    fn insert(&mut self, collection: &str, entity: &Entity) -> Result<(), StorageError> {
        let key = Self::key(collection, entity.id);
        if self.state.documents.contains_key(&key) {
            return Err(StorageError::EntityCollision {
                entity_id: entity.id.to_string(),
            });
        }
        self.state.inserted.push(key.clone());
        self.state.documents.insert(key, entity.clone());
        Ok(())
    }

    fn conditional_replace(
        &mut self,
        collection: &str,
        expected_version: u64,
        entity: &Entity,
    ) -> Result<Entity, StorageError> {
        self.check_version(collection, entity.id, expected_version)?;
        let mut written = entity.clone();
        written.version = expected_version + 1;
        self.state
            .documents
            .insert(Self::key(collection, entity.id), written.clone());
        Ok(written)
    }

    fn update_at_path(
        &mut self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
        path: &FieldPath,
        value: &Value,
        metadata: &EntityMetadata,
    ) -> Result<Entity, StorageError> {
        self.check_version(collection, id, expected_version)?;
        let key = Self::key(collection, id);
        let stored = self
            .state
            .documents
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let mut body = stored.body.clone();
        set_at_path(&mut body, path, value.clone())?;
        stored.body = body;
        stored.metadata = metadata.clone();
        stored.version = expected_version + 1;
        Ok(stored.clone())
    }

    fn delete(
        &mut self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        self.check_version(collection, id, expected_version)?;
        let key = Self::key(collection, id);
        self.state.documents.remove(&key);
        self.state.inserted.retain(|k| k != &key);
        Ok(())
    }

    fn count(&self, collection: &str) -> Result<u64, StorageError> {
        let count = self
            .state
            .documents
            .keys()
            .filter(|(c, _)| c == collection)
            .count();
        Ok(count as u64)
    }

    fn list(&self, collection: &str) -> Result<Vec<Entity>, StorageError> {
        Ok(self
            .state
            .inserted
            .iter()
            .filter(|(c, _)| c == collection)
            .filter_map(|key| self.state.documents.get(key).cloned())
            .collect())
    }

    fn append_historic(
        &mut self,
        collection: &str,
        entry: &HistoricEntry,
    ) -> Result<(), StorageError> {
        if self.state.historic.iter().any(|(_, e)| e.id == entry.id) {
            return Err(StorageError::EntityCollision {
                entity_id: entry.id.to_string(),
            });
        }
        self.state
            .historic
            .push((collection.to_string(), entry.clone()));
        Ok(())
    }

    fn historic_for_entity(
        &self,
        collection: &str,
        id: EntityId,
    ) -> Result<Vec<HistoricEntry>, StorageError> {
        let mut entries: Vec<HistoricEntry> = self
            .state
            .historic
            .iter()
            .filter(|(c, e)| c == collection && e.entity_id == id)
            .map(|(_, e)| e.clone())
            .collect();
        // Stable: equal dates keep append order.
        entries.sort_by_key(|e| e.date);
        Ok(entries)
    }

    fn most_recent_historic_by_actor(
        &self,
        collection: &str,
        id: EntityId,
        actor: &ActorId,
    ) -> Result<Option<HistoricEntry>, StorageError> {
        let entries = self.historic_for_entity(collection, id)?;
        Ok(entries.into_iter().rev().find(|e| &e.user_id == actor))
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        if self.saved.is_some() {
            return Err(StorageError::Transaction("transaction already open".into()));
        }
        self.saved = Some(self.state.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.saved
            .take()
            .map(|_| ())
            .ok_or_else(|| StorageError::Transaction("no open transaction".into()))
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| StorageError::Transaction("no open transaction".into()))?;
        self.state = saved;
        Ok(())
    }
}
