//! Field-level lock tracking.
//!
//! A lock records that a path of an entity was explicitly given a value by
//! an actor. Protected updates diff the stored document against the
//! incoming one; divergent paths that are not locked are written and locked,
//! divergent paths that are locked keep their stored value unless the
//! update is forced.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::{diff, Change, ChangeValue, DiffOptions, DiffWarning};
use crate::error::CoreError;
use crate::ids::ActorId;
use crate::path::{get_at_path, remove_at_path, set_at_path, FieldPath};
use crate::value::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMetadata {
    pub user_id: ActorId,
    pub update_date: DateTime<Utc>,
}

impl LockMetadata {
    pub fn new(user_id: &ActorId, update_date: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.clone(),
            update_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockField {
    pub path: FieldPath,
    /// `None` when the lock holds a removal.
    pub value: Option<Value>,
    pub metadata: LockMetadata,
}

/// Lookup structure over a lock list. Built on read, never persisted.
pub struct LockIndex<'a> {
    locks: &'a [LockField],
    by_path: HashMap<&'a FieldPath, usize>,
}

impl<'a> LockIndex<'a> {
    pub fn build(locks: &'a [LockField]) -> Self {
        let by_path = locks
            .iter()
            .enumerate()
            .map(|(pos, lock)| (&lock.path, pos))
            .collect();
        Self { locks, by_path }
    }

    pub fn get(&self, path: &FieldPath) -> Option<&'a LockField> {
        self.by_path.get(path).map(|&pos| &self.locks[pos])
    }

    /// Position of the lock on `path` itself or on its nearest locked ancestor.
    pub fn covering(&self, path: &FieldPath) -> Option<usize> {
        if let Some(&pos) = self.by_path.get(path) {
            return Some(pos);
        }
        let ancestors: Vec<FieldPath> = path.ancestors().collect();
        ancestors
            .iter()
            .rev()
            .find_map(|ancestor| self.by_path.get(ancestor).copied())
    }

    /// Positions of locks strictly beneath `path`.
    pub fn below(&self, path: &FieldPath) -> Vec<usize> {
        self.locks
            .iter()
            .enumerate()
            .filter(|(_, lock)| lock.path.len() > path.len() && lock.path.starts_with(path))
            .map(|(pos, _)| pos)
            .collect()
    }
}

/// What a protected update does with fields the incoming document omits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovedFieldPolicy {
    /// The incoming document is partial; omitted fields keep their stored value.
    #[default]
    Keep,
    /// Omitted fields are removed unless locked. Removals are not locked.
    Remove,
    /// Omitted fields are removed unless locked, and the removal is locked.
    RemoveAndLock,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub diff: DiffOptions,
    pub force: bool,
    pub removed_fields: RemovedFieldPolicy,
}

/// An incoming value dropped because its path is locked.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnoredChange {
    pub path: FieldPath,
    pub incoming: ChangeValue,
    pub locked_path: FieldPath,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub document: Value,
    pub lock_fields: Vec<LockField>,
    pub applied: Vec<FieldPath>,
    pub ignored: Vec<IgnoredChange>,
    pub warnings: Vec<DiffWarning>,
}

impl MergeOutcome {
    pub fn is_unchanged(&self, stored_locks: &[LockField]) -> bool {
        self.applied.is_empty() && self.lock_fields.as_slice() == stored_locks
    }
}

fn apply(document: &mut Value, change: &Change) -> Result<(), CoreError> {
    match &change.value {
        ChangeValue::Set(value) => set_at_path(document, &change.path, value.clone()),
        ChangeValue::Absent => {
            remove_at_path(document, &change.path);
            Ok(())
        }
    }
}

/// Reconciles `incoming` against the stored document and its locks.
///
/// Pure: the caller persists the returned document and lock list.
pub fn merge_with_locks(
    stored: &Value,
    stored_locks: &[LockField],
    incoming: &Value,
    actor: &ActorId,
    now: DateTime<Utc>,
    options: &MergeOptions,
) -> Result<MergeOutcome, CoreError> {
    let report = diff(stored, incoming, &options.diff)?;
    let index = LockIndex::build(stored_locks);

    let mut document = stored.clone();
    let mut lock_fields = stored_locks.to_vec();
    let mut applied = Vec::new();
    let mut ignored = Vec::new();

    for change in &report.changes {
        let is_removal = change.value == ChangeValue::Absent;
        if is_removal && options.removed_fields == RemovedFieldPolicy::Keep {
            continue;
        }

        let covering = index.covering(&change.path);
        let below = index.below(&change.path);

        if !options.force
            && let Some(pos) = covering.or_else(|| below.first().copied())
        {
            ignored.push(IgnoredChange {
                path: change.path.clone(),
                incoming: change.value.clone(),
                locked_path: stored_locks[pos].path.clone(),
            });
            continue;
        }

        apply(&mut document, change)?;
        applied.push(change.path.clone());

        let metadata = LockMetadata::new(actor, now);
        for pos in covering.iter().chain(below.iter()) {
            let lock = &mut lock_fields[*pos];
            lock.value = get_at_path(&document, &lock.path).cloned();
            lock.metadata = metadata.clone();
        }

        let records_lock = covering.is_none()
            && !(is_removal && options.removed_fields == RemovedFieldPolicy::Remove);
        if records_lock {
            lock_fields.push(LockField {
                path: change.path.clone(),
                value: change.value.as_value().cloned(),
                metadata,
            });
        }
    }

    for change in &report.excluded {
        if change.value == ChangeValue::Absent && options.removed_fields == RemovedFieldPolicy::Keep {
            continue;
        }
        apply(&mut document, change)?;
        applied.push(change.path.clone());
    }

    Ok(MergeOutcome {
        document,
        lock_fields,
        applied,
        ignored,
        warnings: report.warnings,
    })
}

/// Locks every leaf of a new document, as an insert with locking does.
pub fn lock_all_fields(
    document: &Value,
    actor: &ActorId,
    now: DateTime<Utc>,
    options: &DiffOptions,
) -> Result<Vec<LockField>, CoreError> {
    let report = diff(&Value::Object(Map::new()), document, options)?;
    Ok(report
        .changes
        .into_iter()
        .filter_map(|change| match change.value {
            ChangeValue::Set(value) => Some(LockField {
                path: change.path,
                value: Some(value),
                metadata: LockMetadata::new(actor, now),
            }),
            ChangeValue::Absent => None,
        })
        .collect())
}

/// Drops the lock on `path` and every lock beneath it. Returns how many
/// entries were removed.
pub fn remove_locks(locks: &mut Vec<LockField>, path: &FieldPath) -> usize {
    let before = locks.len();
    locks.retain(|lock| !lock.path.starts_with(path));
    before - locks.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{ArrayRules, ExcludedFields};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn doc(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    fn path(text: &str) -> FieldPath {
        FieldPath::parse(text).unwrap()
    }

    fn lock_paths(locks: &[LockField]) -> Vec<String> {
        locks.iter().map(|l| l.path.to_string()).collect()
    }

    #[test]
    fn protected_update_locks_divergent_leaf() {
        let stored = doc(json!({ "a": { "b": 1, "c": 2 } }));
        let incoming = doc(json!({ "a": { "b": 1, "c": 3 } }));
        let actor = ActorId::from("user1");

        let outcome =
            merge_with_locks(&stored, &[], &incoming, &actor, at(0), &MergeOptions::default()).unwrap();

        assert_eq!(outcome.document, doc(json!({ "a": { "b": 1, "c": 3 } })));
        assert_eq!(lock_paths(&outcome.lock_fields), vec!["a.c"]);
        assert_eq!(outcome.lock_fields[0].value, Some(Value::Integer(3)));
        assert_eq!(outcome.lock_fields[0].metadata.user_id, actor);
        assert!(outcome.ignored.is_empty());
    }

    #[test]
    fn locked_path_keeps_stored_value() {
        let stored = doc(json!({ "a": { "b": 1, "c": 3 } }));
        let first = merge_with_locks(
            &doc(json!({ "a": { "b": 1, "c": 2 } })),
            &[],
            &stored,
            &ActorId::from("human"),
            at(0),
            &MergeOptions::default(),
        )
        .unwrap();

        let incoming = doc(json!({ "a": { "b": 1, "c": 99 } }));
        let outcome = merge_with_locks(
            &first.document,
            &first.lock_fields,
            &incoming,
            &ActorId::from("import"),
            at(10),
            &MergeOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.document, stored);
        assert_eq!(outcome.lock_fields, first.lock_fields);
        assert_eq!(
            outcome.ignored,
            vec![IgnoredChange {
                path: path("a.c"),
                incoming: ChangeValue::Set(Value::Integer(99)),
                locked_path: path("a.c"),
            }]
        );
        assert!(outcome.is_unchanged(&first.lock_fields));
    }

    #[test]
    fn forced_update_wins_and_refreshes_lock() {
        let stored = doc(json!({ "a": { "c": 1 } }));
        let locks = vec![LockField {
            path: path("a.c"),
            value: Some(Value::Integer(1)),
            metadata: LockMetadata::new(&ActorId::from("human"), at(0)),
        }];
        let options = MergeOptions {
            force: true,
            ..MergeOptions::default()
        };
        let outcome = merge_with_locks(
            &stored,
            &locks,
            &doc(json!({ "a": { "c": 2 } })),
            &ActorId::from("admin"),
            at(5),
            &options,
        )
        .unwrap();

        assert_eq!(outcome.document, doc(json!({ "a": { "c": 2 } })));
        assert_eq!(outcome.lock_fields.len(), 1);
        assert_eq!(outcome.lock_fields[0].value, Some(Value::Integer(2)));
        assert_eq!(outcome.lock_fields[0].metadata, LockMetadata::new(&ActorId::from("admin"), at(5)));
    }

    #[test]
    fn ancestor_lock_protects_children() {
        let stored = doc(json!({ "label": { "fr": "a", "en": "b" } }));
        let locks = vec![LockField {
            path: path("label"),
            value: Some(doc(json!({ "fr": "a", "en": "b" }))),
            metadata: LockMetadata::new(&ActorId::from("human"), at(0)),
        }];
        let outcome = merge_with_locks(
            &stored,
            &locks,
            &doc(json!({ "label": { "fr": "z", "en": "b" } })),
            &ActorId::from("import"),
            at(1),
            &MergeOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.document, stored);
        assert_eq!(outcome.ignored[0].locked_path, path("label"));
    }

    #[test]
    fn change_over_locked_descendant_is_rejected() {
        let stored = doc(json!({ "wrapper": { "tags": 1 }, "other": 1 }));
        let locks = vec![LockField {
            path: path("wrapper.tags"),
            value: Some(Value::Integer(1)),
            metadata: LockMetadata::new(&ActorId::from("human"), at(0)),
        }];
        let options = MergeOptions {
            removed_fields: RemovedFieldPolicy::Remove,
            ..MergeOptions::default()
        };

        let outcome = merge_with_locks(
            &stored,
            &locks,
            &doc(json!({ "other": 1 })),
            &ActorId::from("import"),
            at(1),
            &options,
        )
        .unwrap();

        assert_eq!(outcome.document, stored);
        assert_eq!(outcome.ignored.len(), 1);
        assert_eq!(outcome.ignored[0].path, path("wrapper"));
        assert_eq!(outcome.ignored[0].locked_path, path("wrapper.tags"));
        assert!(outcome.is_unchanged(&locks));
    }

    #[test]
    fn sequential_updates_accumulate_distinct_locks() {
        let mut document = doc(json!({ "a": 0, "b": 0, "c": 0 }));
        let mut locks = Vec::new();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            let mut incoming = document.clone();
            set_at_path(&mut incoming, &path(key), Value::Integer(i as i64 + 1)).unwrap();
            let outcome = merge_with_locks(
                &document,
                &locks,
                &incoming,
                &ActorId::from("user"),
                at(i as i64),
                &MergeOptions::default(),
            )
            .unwrap();
            document = outcome.document;
            locks = outcome.lock_fields;
            assert_eq!(locks.len(), i + 1);
        }
        assert_eq!(lock_paths(&locks), vec!["a", "b", "c"]);
    }

    #[test]
    fn excluded_paths_are_written_but_never_locked() {
        let options = MergeOptions {
            diff: DiffOptions {
                excluded: ExcludedFields::parse(["sku", "externalReferences"]).unwrap(),
                array_rules: ArrayRules::new(),
            },
            ..MergeOptions::default()
        };
        let mut document = doc(json!({ "sku": "0", "name": "n" }));
        let mut locks = Vec::new();
        for i in 1..=3 {
            let incoming = doc(json!({ "sku": i.to_string(), "name": "n", "externalReferences": { "erp": i } }));
            let outcome =
                merge_with_locks(&document, &locks, &incoming, &ActorId::from("sync"), at(i), &options).unwrap();
            document = outcome.document;
            locks = outcome.lock_fields;
        }
        assert!(locks.is_empty());
        assert_eq!(document, doc(json!({ "sku": "3", "name": "n", "externalReferences": { "erp": 3 } })));
    }

    #[test]
    fn removal_policies() {
        let stored = doc(json!({ "a": 1, "b": 2 }));
        let incoming = doc(json!({ "a": 1 }));
        let actor = ActorId::from("user");
        let with = |policy| MergeOptions {
            removed_fields: policy,
            ..MergeOptions::default()
        };

        let keep = merge_with_locks(&stored, &[], &incoming, &actor, at(0), &with(RemovedFieldPolicy::Keep)).unwrap();
        assert_eq!(keep.document, stored);
        assert!(keep.lock_fields.is_empty());

        let remove =
            merge_with_locks(&stored, &[], &incoming, &actor, at(0), &with(RemovedFieldPolicy::Remove)).unwrap();
        assert_eq!(remove.document, incoming);
        assert!(remove.lock_fields.is_empty());

        let lock =
            merge_with_locks(&stored, &[], &incoming, &actor, at(0), &with(RemovedFieldPolicy::RemoveAndLock))
                .unwrap();
        assert_eq!(lock.document, incoming);
        assert_eq!(lock_paths(&lock.lock_fields), vec!["b"]);
        assert_eq!(lock.lock_fields[0].value, None);
    }

    #[test]
    fn identified_array_merge_keeps_locked_element_field() {
        let options = MergeOptions {
            diff: DiffOptions {
                excluded: ExcludedFields::new(),
                array_rules: ArrayRules::parse([("attributes", "attributeId")]).unwrap(),
            },
            ..MergeOptions::default()
        };
        let stored = doc(json!({ "attributes": [
            { "attributeId": "1", "value": "human" },
            { "attributeId": "2", "value": "b" },
        ] }));
        let locks = vec![LockField {
            path: path("attributes[attributeId=1].value"),
            value: Some(Value::from("human")),
            metadata: LockMetadata::new(&ActorId::from("human"), at(0)),
        }];
        let incoming = doc(json!({ "attributes": [
            { "attributeId": "2", "value": "import b" },
            { "attributeId": "1", "value": "import a" },
        ] }));

        let outcome =
            merge_with_locks(&stored, &locks, &incoming, &ActorId::from("import"), at(1), &options).unwrap();

        assert_eq!(
            outcome.document,
            doc(json!({ "attributes": [
                { "attributeId": "1", "value": "human" },
                { "attributeId": "2", "value": "import b" },
            ] }))
        );
        assert_eq!(
            lock_paths(&outcome.lock_fields),
            vec!["attributes[attributeId=1].value", "attributes[attributeId=2].value"]
        );
    }

    #[test]
    fn element_with_other_identity_type_is_added_not_rewritten() {
        let options = MergeOptions {
            diff: DiffOptions {
                excluded: ExcludedFields::new(),
                array_rules: ArrayRules::parse([("a", "id")]).unwrap(),
            },
            ..MergeOptions::default()
        };
        let stored = doc(json!({ "a": [{ "id": 1, "v": "human" }] }));
        let locks = vec![LockField {
            path: path("a[id=$1].v"),
            value: Some(Value::from("human")),
            metadata: LockMetadata::new(&ActorId::from("human"), at(0)),
        }];
        let incoming = doc(json!({ "a": [{ "id": "1", "v": "import" }] }));

        let outcome =
            merge_with_locks(&stored, &locks, &incoming, &ActorId::from("import"), at(1), &options).unwrap();

        assert_eq!(
            outcome.document,
            doc(json!({ "a": [{ "id": 1, "v": "human" }, { "id": "1", "v": "import" }] }))
        );
        assert!(outcome.ignored.is_empty());
        assert_eq!(lock_paths(&outcome.lock_fields), vec!["a[id=$1].v", "a[id=1]"]);
    }

    #[test]
    fn lock_all_fields_covers_every_leaf() {
        let document = doc(json!({ "a": { "b": 1, "c": "x" }, "d": [1, 2] }));
        let locks = lock_all_fields(&document, &ActorId::from("user"), at(0), &DiffOptions::default()).unwrap();
        assert_eq!(lock_paths(&locks), vec!["a.b", "a.c", "d"]);
    }

    #[test]
    fn remove_locks_drops_subtree() {
        let meta = LockMetadata::new(&ActorId::from("user"), at(0));
        let mut locks: Vec<LockField> = ["a.b", "a.c", "d"]
            .iter()
            .map(|p| LockField {
                path: path(p),
                value: None,
                metadata: meta.clone(),
            })
            .collect();
        assert_eq!(remove_locks(&mut locks, &path("a")), 2);
        assert_eq!(lock_paths(&locks), vec!["d"]);
        assert_eq!(remove_locks(&mut locks, &path("zzz")), 0);
    }

    #[test]
    fn lock_index_lookups() {
        let meta = LockMetadata::new(&ActorId::from("user"), at(0));
        let locks: Vec<LockField> = ["a", "b.c"]
            .iter()
            .map(|p| LockField {
                path: path(p),
                value: None,
                metadata: meta.clone(),
            })
            .collect();
        let index = LockIndex::build(&locks);
        assert!(index.get(&path("a")).is_some());
        assert_eq!(index.covering(&path("a.x.y")), Some(0));
        assert_eq!(index.covering(&path("b")), None);
        assert_eq!(index.below(&path("b")), vec![1]);
        assert!(index.below(&path("b.c")).is_empty());
    }
}
