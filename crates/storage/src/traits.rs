use lockdoc_core::{ActorId, Entity, EntityId, EntityMetadata, FieldPath, HistoricEntry, Value};

use crate::error::StorageError;

/// Persistence capability for entities and their historic entries.
///
/// Bodies are handed over in escaped form. Every write that replaces a
/// document is conditional on the version the caller read; a mismatch is a
/// [`StorageError::Conflict`]. Historic entries can only be appended.
pub trait DocumentStore {
    fn get(&self, collection: &str, id: EntityId) -> Result<Option<Entity>, StorageError>;

    fn insert(&mut self, collection: &str, entity: &Entity) -> Result<(), StorageError>;

    /// Replaces the stored entity if its version is still `expected_version`.
    /// The stored version becomes `expected_version + 1` regardless of
    /// `entity.version`; the written entity is returned.
    fn conditional_replace(
        &mut self,
        collection: &str,
        expected_version: u64,
        entity: &Entity,
    ) -> Result<Entity, StorageError>;

    /// Writes one value at `path` (escaped addressing) and replaces the
    /// metadata, under the same version predicate as `conditional_replace`.
    fn update_at_path(
        &mut self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
        path: &FieldPath,
        value: &Value,
        metadata: &EntityMetadata,
    ) -> Result<Entity, StorageError>;

    fn delete(
        &mut self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
    ) -> Result<(), StorageError>;

    fn count(&self, collection: &str) -> Result<u64, StorageError>;

    /// Every entity of the collection, in insertion order.
    fn list(&self, collection: &str) -> Result<Vec<Entity>, StorageError>;

    fn append_historic(
        &mut self,
        collection: &str,
        entry: &HistoricEntry,
    ) -> Result<(), StorageError>;

    /// All entries of an entity, oldest first.
    fn historic_for_entity(
        &self,
        collection: &str,
        id: EntityId,
    ) -> Result<Vec<HistoricEntry>, StorageError>;

    fn most_recent_historic_by_actor(
        &self,
        collection: &str,
        id: EntityId,
        actor: &ActorId,
    ) -> Result<Option<HistoricEntry>, StorageError>;

    fn begin(&mut self) -> Result<(), StorageError>;

    fn commit(&mut self) -> Result<(), StorageError>;

    fn rollback(&mut self) -> Result<(), StorageError>;
}

pub(crate) fn conflict(id: EntityId, expected: u64, actual: Option<u64>) -> StorageError {
    StorageError::Conflict {
        entity_id: id.to_string(),
        expected,
        actual,
    }
}
