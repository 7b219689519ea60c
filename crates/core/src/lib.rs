pub mod clock;
pub mod diff;
pub mod entity;
pub mod error;
pub mod escape;
pub mod historic;
pub mod ids;
pub mod locks;
pub mod path;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use diff::{ArrayRules, Change, ChangeValue, DiffOptions, DiffReport, DiffWarning, ExcludedFields};
pub use entity::{Entity, EntityMetadata, Stamp};
pub use error::CoreError;
pub use historic::{HistoricEntry, HistoricKind};
pub use ids::*;
pub use locks::{IgnoredChange, LockField, LockIndex, LockMetadata, MergeOptions, MergeOutcome, RemovedFieldPolicy};
pub use path::{ElementId, FieldPath, Segment};
pub use value::{Map, Value};
