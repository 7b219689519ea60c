use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::{ActorId, EntityId};
use crate::locks::LockField;
use crate::value::Value;

/// Who did something, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamp {
    pub user_id: ActorId,
    pub date: DateTime<Utc>,
}

impl Stamp {
    pub fn new(user_id: &ActorId, date: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.clone(),
            date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub creation: Stamp,
    pub last_update: Option<Stamp>,
    pub lock_fields: Vec<LockField>,
}

/// A persisted document.
///
/// `version` starts at 1 and is bumped by every committed write; it is the
/// predicate of conditional replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub version: u64,
    pub body: Value,
    pub metadata: EntityMetadata,
}

impl Entity {
    pub fn new(body: Value, creation: Stamp) -> Result<Self, CoreError> {
        if body.as_object().is_none() {
            return Err(CoreError::InvalidData(format!(
                "entity body must be an object, got {}",
                body.kind()
            )));
        }
        Ok(Self {
            id: EntityId::new(),
            version: 1,
            body,
            metadata: EntityMetadata {
                creation,
                last_update: None,
                lock_fields: Vec::new(),
            },
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.as_object()?.get(key)
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}
