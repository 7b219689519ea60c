use lockdoc_core::{ActorId, Entity, EntityId, EntityMetadata, FieldPath, HistoricEntry, Value};
use lockdoc_storage::{DocumentStore, StorageError};

/// Wraps a store and injects failures into chosen operations.
#[derive(Debug, Default)]
pub struct FaultyStore<S> {
    pub inner: S,
    /// `append_historic` fails while set.
    pub fail_historic: bool,
    /// Conditional writes report a version conflict while set.
    pub conflict_on_write: bool,
}

impl<S: DocumentStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_historic: false,
            conflict_on_write: false,
        }
    }

    fn injected_conflict(&self, id: EntityId, expected: u64) -> Result<(), StorageError> {
        if self.conflict_on_write {
            return Err(StorageError::Conflict {
                entity_id: id.to_string(),
                expected,
                actual: Some(expected + 1),
            });
        }
        Ok(())
    }
}

impl<S: DocumentStore> DocumentStore for FaultyStore<S> {
    fn get(&self, collection: &str, id: EntityId) -> Result<Option<Entity>, StorageError> {
        self.inner.get(collection, id)
    }

    fn insert(&mut self, collection: &str, entity: &Entity) -> Result<(), StorageError> {
        self.inner.insert(collection, entity)
    }

    fn conditional_replace(
        &mut self,
        collection: &str,
        expected_version: u64,
        entity: &Entity,
    ) -> Result<Entity, StorageError> {
        self.injected_conflict(entity.id, expected_version)?;
        self.inner
            .conditional_replace(collection, expected_version, entity)
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
        self.injected_conflict(id, expected_version)?;
        self.inner
            .update_at_path(collection, id, expected_version, path, value, metadata)
    }

    fn delete(
        &mut self,
        collection: &str,
        id: EntityId,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        self.injected_conflict(id, expected_version)?;
        self.inner.delete(collection, id, expected_version)
    }

    fn count(&self, collection: &str) -> Result<u64, StorageError> {
        self.inner.count(collection)
    }

    fn list(&self, collection: &str) -> Result<Vec<Entity>, StorageError> {
        self.inner.list(collection)
    }

    fn append_historic(
        &mut self,
        collection: &str,
        entry: &HistoricEntry,
    ) -> Result<(), StorageError> {
        if self.fail_historic {
            return Err(StorageError::Serialization(
                "injected historic failure".into(),
            ));
        }
        self.inner.append_historic(collection, entry)
    }

    fn historic_for_entity(
        &self,
        collection: &str,
        id: EntityId,
    ) -> Result<Vec<HistoricEntry>, StorageError> {
        self.inner.historic_for_entity(collection, id)
    }

    fn most_recent_historic_by_actor(
        &self,
        collection: &str,
        id: EntityId,
        actor: &ActorId,
    ) -> Result<Option<HistoricEntry>, StorageError> {
        self.inner.most_recent_historic_by_actor(collection, id, actor)
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.inner.rollback()
    }
}
