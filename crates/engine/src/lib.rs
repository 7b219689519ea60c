pub mod config;
pub mod error;
pub mod historic;

pub use config::{CollectionConfig, LockFieldsConfig};
pub use error::EngineError;
pub use historic::HistoricManager;

use tracing::{debug, info, warn};

use lockdoc_core::{
    ActorId, Clock, CoreError, DiffWarning, Entity, EntityId, FieldPath, HistoricEntry, HistoricKind,
    IgnoredChange, LockField, LockMetadata, Stamp, Value,
    escape::{escape_document, unescape_document},
    locks::{lock_all_fields, merge_with_locks, remove_locks},
    path::{get_at_path, set_at_path},
};
use lockdoc_storage::DocumentStore;

/// Result of a protected update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The entity as it is stored after the call.
    pub entity: Entity,
    /// Paths whose incoming value was written.
    pub applied: Vec<FieldPath>,
    /// Incoming values dropped because their path is locked.
    pub ignored: Vec<IgnoredChange>,
    pub warnings: Vec<DiffWarning>,
    /// False when the merge changed nothing and no write happened.
    pub written: bool,
}

/// Mutation boundary for one collection.
///
/// Every write runs in a single store transaction together with its
/// historic snapshot: if either fails, neither is kept. Conflicting
/// concurrent writes surface as retryable errors and are not retried here.
pub struct DocumentClient<S: DocumentStore, C: Clock> {
    config: CollectionConfig,
    store: S,
    clock: C,
    historic: HistoricManager,
}

fn to_stored(entity: &Entity) -> Result<Entity, EngineError> {
    let mut stored = entity.clone();
    stored.body = escape_document(&entity.body)?;
    Ok(stored)
}

fn from_stored(stored: Entity) -> Result<Entity, EngineError> {
    let mut entity = stored;
    entity.body = unescape_document(&entity.body)?;
    Ok(entity)
}

fn require_field_path(path: &FieldPath) -> Result<(), EngineError> {
    if path.is_root() {
        return Err(CoreError::InvalidPath {
            path: path.to_string(),
            reason: "cannot replace the whole body".into(),
        }
        .into());
    }
    Ok(())
}

fn require_object(value: &Value) -> Result<(), EngineError> {
    if value.as_object().is_none() {
        return Err(CoreError::InvalidData(format!(
            "document must be an object, got {}",
            value.kind()
        ))
        .into());
    }
    Ok(())
}

impl<S: DocumentStore, C: Clock> DocumentClient<S, C> {
    pub fn new(store: S, clock: C, config: CollectionConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let historic = HistoricManager::new(config.name.clone());
        Ok(Self {
            config,
            store,
            clock,
            historic,
        })
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn historic(&self) -> &HistoricManager {
        &self.historic
    }

    /// Runs `f` inside a store transaction, committing on success and
    /// rolling back on any error.
    fn transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.store.begin()?;
        let result = f(self).and_then(|value| {
            self.store.commit()?;
            Ok(value)
        });
        if result.is_err()
            && let Err(e) = self.store.rollback()
        {
            warn!(collection = %self.config.name, error = %e, "rollback failed");
        }
        result
    }

    fn load(&self, id: EntityId) -> Result<Entity, EngineError> {
        self.store
            .get(&self.config.name, id)?
            .ok_or_else(|| EngineError::EntityNotFound(id.to_string()))
    }

    fn snapshot(
        &mut self,
        kind: HistoricKind,
        stored: &Entity,
        actor: &ActorId,
        date: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), EngineError> {
        if self.config.keep_historic {
            self.historic
                .record_snapshot(&mut self.store, kind, stored, actor, date)?;
        }
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Inserts a new entity. With `lock_fields` and lock tracking configured,
    /// every leaf of the body is locked in the actor's name.
    pub fn insert_one(
        &mut self,
        body: Value,
        actor: &ActorId,
        lock_fields: bool,
    ) -> Result<Entity, EngineError> {
        let now = self.clock.now();
        let mut entity = Entity::new(body, Stamp::new(actor, now))?;
        if lock_fields && self.config.lock_tracking() {
            let options = self.config.merge_options(false)?;
            entity.metadata.lock_fields = lock_all_fields(&entity.body, actor, now, &options.diff)?;
        }
        let stored = to_stored(&entity)?;

        self.transaction(|client| {
            client.store.insert(&client.config.name, &stored)?;
            client.snapshot(HistoricKind::Creation, &stored, actor, now)
        })?;

        info!(
            collection = %self.config.name,
            entity_id = %entity.id,
            locks = entity.metadata.lock_fields.len(),
            "inserted entity"
        );
        Ok(entity)
    }

    /// Inserts each body on its own; a failure stops the batch and leaves
    /// the earlier inserts in place.
    pub fn insert_many(
        &mut self,
        bodies: Vec<Value>,
        actor: &ActorId,
        lock_fields: bool,
    ) -> Result<Vec<Entity>, EngineError> {
        bodies
            .into_iter()
            .map(|body| self.insert_one(body, actor, lock_fields))
            .collect()
    }

    /// Merges `incoming` into the stored entity, honoring its lock fields.
    pub fn update_one_with_locks(
        &mut self,
        id: EntityId,
        incoming: Value,
        actor: &ActorId,
        force: bool,
    ) -> Result<UpdateOutcome, EngineError> {
        require_object(&incoming)?;
        let options = self.config.merge_options(force)?;
        let tracking = self.config.lock_tracking();

        let outcome = self.transaction(|client| {
            let stored = client.load(id)?;
            let current = from_stored(stored.clone())?;
            let now = client.clock.now();

            let merged = merge_with_locks(
                &current.body,
                &current.metadata.lock_fields,
                &incoming,
                actor,
                now,
                &options,
            )?;
            for warning in &merged.warnings {
                warn!(collection = %client.config.name, entity_id = %id, ?warning, "diff warning");
            }
            let lock_fields = if tracking {
                merged.lock_fields
            } else {
                current.metadata.lock_fields.clone()
            };

            if merged.applied.is_empty() && lock_fields == current.metadata.lock_fields {
                debug!(collection = %client.config.name, entity_id = %id, "update is a no-op");
                return Ok(UpdateOutcome {
                    entity: current,
                    applied: merged.applied,
                    ignored: merged.ignored,
                    warnings: merged.warnings,
                    written: false,
                });
            }

            client.snapshot(HistoricKind::Update, &stored, actor, now)?;

            let mut next = current;
            next.body = merged.document;
            next.metadata.lock_fields = lock_fields;
            next.metadata.last_update = Some(Stamp::new(actor, now));
            let written = client.store.conditional_replace(
                &client.config.name,
                stored.version,
                &to_stored(&next)?,
            )?;

            Ok(UpdateOutcome {
                entity: from_stored(written)?,
                applied: merged.applied,
                ignored: merged.ignored,
                warnings: merged.warnings,
                written: true,
            })
        })?;

        if outcome.written {
            info!(
                collection = %self.config.name,
                entity_id = %id,
                applied = outcome.applied.len(),
                ignored = outcome.ignored.len(),
                "updated entity with locks"
            );
        }
        Ok(outcome)
    }

    /// Writes one value at `path`. This is an explicit edit: with lock
    /// tracking on, the path is locked (or the lock covering it refreshed)
    /// and locks beneath it are superseded.
    pub fn update_field(
        &mut self,
        id: EntityId,
        path: &FieldPath,
        value: Value,
        actor: &ActorId,
    ) -> Result<Entity, EngineError> {
        require_field_path(path)?;
        let entity = self.transaction(|client| client.write_field(id, path, &value, actor))?;

        info!(collection = %self.config.name, entity_id = %id, path = %path, "updated field");
        Ok(entity)
    }

    /// Looks up the first entity whose value at `key_path` equals `key` and
    /// writes `value` at `path` on it, in one transaction. Returns `None`
    /// when no entity matches.
    pub fn update_field_by_key(
        &mut self,
        key: &Value,
        key_path: &FieldPath,
        path: &FieldPath,
        value: Value,
        actor: &ActorId,
    ) -> Result<Option<Entity>, EngineError> {
        require_field_path(path)?;
        let entity = self.transaction(|client| {
            let Some(found) = client.find_one_by_key(key, key_path)? else {
                return Ok(None);
            };
            client.write_field(found.id, path, &value, actor).map(Some)
        })?;

        match &entity {
            Some(entity) => info!(
                collection = %self.config.name,
                entity_id = %entity.id,
                key_path = %key_path,
                path = %path,
                "updated field by key"
            ),
            None => debug!(collection = %self.config.name, key_path = %key_path, "no entity for key"),
        }
        Ok(entity)
    }

    fn write_field(
        &mut self,
        id: EntityId,
        path: &FieldPath,
        value: &Value,
        actor: &ActorId,
    ) -> Result<Entity, EngineError> {
        let options = self.config.merge_options(true)?;
        let tracking = self.config.lock_tracking() && !options.diff.excluded.covers(path);

        let stored = self.load(id)?;
        let current = from_stored(stored.clone())?;
        let now = self.clock.now();

        let mut metadata = current.metadata.clone();
        metadata.last_update = Some(Stamp::new(actor, now));
        if tracking {
            let mut body = current.body.clone();
            set_at_path(&mut body, path, value.clone())?;
            refresh_locks(&mut metadata.lock_fields, &body, path, actor, now);
        }

        self.snapshot(HistoricKind::Update, &stored, actor, now)?;
        let written = self.store.update_at_path(
            &self.config.name,
            id,
            stored.version,
            &path.escaped(),
            &escape_document(value)?,
            &metadata,
        )?;
        from_stored(written)
    }

    /// Drops the lock on `path` and every lock beneath it. Returns the
    /// entity unchanged, without a write, when nothing was locked there.
    pub fn remove_lock_field(
        &mut self,
        id: EntityId,
        path: &FieldPath,
        actor: &ActorId,
    ) -> Result<Entity, EngineError> {
        self.transaction(|client| {
            let stored = client.load(id)?;
            let mut entity = from_stored(stored.clone())?;
            let removed = remove_locks(&mut entity.metadata.lock_fields, path);
            if removed == 0 {
                return Ok(entity);
            }

            let now = client.clock.now();
            client.snapshot(HistoricKind::Update, &stored, actor, now)?;
            entity.metadata.last_update = Some(Stamp::new(actor, now));
            let written = client.store.conditional_replace(
                &client.config.name,
                stored.version,
                &to_stored(&entity)?,
            )?;
            debug!(
                collection = %client.config.name,
                entity_id = %id,
                path = %path,
                removed,
                "removed lock fields"
            );
            from_stored(written)
        })
    }

    /// Deletes the entity. Returns what was deleted, or `None` if there was
    /// nothing to delete.
    pub fn delete_one(&mut self, id: EntityId, actor: &ActorId) -> Result<Option<Entity>, EngineError> {
        let deleted = self.transaction(|client| {
            let Some(stored) = client.store.get(&client.config.name, id)? else {
                return Ok(None);
            };
            let now = client.clock.now();
            client.snapshot(HistoricKind::Deletion, &stored, actor, now)?;
            client.store.delete(&client.config.name, id, stored.version)?;
            from_stored(stored).map(Some)
        })?;

        if deleted.is_some() {
            info!(collection = %self.config.name, entity_id = %id, "deleted entity");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn find_one_by_id(&self, id: EntityId) -> Result<Option<Entity>, EngineError> {
        self.store
            .get(&self.config.name, id)?
            .map(from_stored)
            .transpose()
    }

    pub fn find_all(&self) -> Result<Vec<Entity>, EngineError> {
        self.store
            .list(&self.config.name)?
            .into_iter()
            .map(from_stored)
            .collect()
    }

    /// First entity whose value at `key_path` equals `value`.
    pub fn find_one_by_key(
        &self,
        value: &Value,
        key_path: &FieldPath,
    ) -> Result<Option<Entity>, EngineError> {
        for entity in self.find_all()? {
            if get_at_path(&entity.body, key_path) == Some(value) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    pub fn count(&self) -> Result<u64, EngineError> {
        Ok(self.store.count(&self.config.name)?)
    }

    /// Historic entries of an entity, oldest first.
    pub fn find_historic(&self, id: EntityId) -> Result<Vec<HistoricEntry>, EngineError> {
        self.historic.find_for_entity(&self.store, id)
    }

    pub fn find_most_recent_historic_by_actor(
        &self,
        id: EntityId,
        actor: &ActorId,
    ) -> Result<Option<HistoricEntry>, EngineError> {
        self.historic.find_most_recent_by_actor(&self.store, id, actor)
    }
}

/// Lock bookkeeping for a path write: locks beneath `path` are superseded,
/// an ancestor lock absorbs the write, otherwise `path` itself is locked.
fn refresh_locks(
    locks: &mut Vec<LockField>,
    body: &Value,
    path: &FieldPath,
    actor: &ActorId,
    now: chrono::DateTime<chrono::Utc>,
) {
    remove_locks(locks, path);
    let metadata = LockMetadata::new(actor, now);
    match locks.iter_mut().find(|lock| path.starts_with(&lock.path)) {
        Some(lock) => {
            lock.value = get_at_path(body, &lock.path).cloned();
            lock.metadata = metadata;
        }
        None => locks.push(LockField {
            path: path.clone(),
            value: get_at_path(body, path).cloned(),
            metadata,
        }),
    }
}
