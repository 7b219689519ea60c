//! Append-only audit records.
//!
//! Every entry carries a snapshot of the entity: the inserted entity for a
//! creation, and the stored entity as it was before the write for an update
//! or a deletion. The checksum is a blake3 digest of the msgpack-encoded
//! snapshot, so a tampered or truncated payload is caught on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::error::CoreError;
use crate::ids::{ActorId, EntityId, HistoricId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoricKind {
    Creation,
    Update,
    Deletion,
}

impl HistoricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoricKind::Creation => "creation",
            HistoricKind::Update => "update",
            HistoricKind::Deletion => "deletion",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "creation" => Ok(HistoricKind::Creation),
            "update" => Ok(HistoricKind::Update),
            "deletion" => Ok(HistoricKind::Deletion),
            other => Err(CoreError::InvalidData(format!(
                "unknown historic kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricEntry {
    pub id: HistoricId,
    pub entity_id: EntityId,
    pub user_id: ActorId,
    pub snapshot: Entity,
    pub date: DateTime<Utc>,
    pub kind: HistoricKind,
    pub checksum: [u8; 32],
}

impl HistoricEntry {
    pub fn new(
        kind: HistoricKind,
        snapshot: Entity,
        user_id: &ActorId,
        date: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let checksum = Self::compute_checksum(&snapshot)?;
        Ok(Self {
            id: HistoricId::new(),
            entity_id: snapshot.id,
            user_id: user_id.clone(),
            snapshot,
            date,
            kind,
            checksum,
        })
    }

    pub fn compute_checksum(snapshot: &Entity) -> Result<[u8; 32], CoreError> {
        let bytes = snapshot.to_msgpack()?;
        Ok(*blake3::hash(&bytes).as_bytes())
    }

    /// Recomputes the snapshot digest and compares it with the stored one.
    pub fn verify(&self) -> Result<(), CoreError> {
        let actual = Self::compute_checksum(&self.snapshot)?;
        if actual != self.checksum {
            return Err(CoreError::InvalidData(format!(
                "historic entry {} failed checksum verification",
                self.id
            )));
        }
        Ok(())
    }
}
