//! Structural diff of two document trees.
//!
//! The walk follows the candidate: every key present in the candidate is
//! visited in its order, then keys only present in the base are reported as
//! absent. The resulting change list is therefore deterministic for a given
//! pair of documents, which keeps lock lists stable across runs.

use std::collections::HashMap;

use crate::error::CoreError;
use crate::path::{ElementId, FieldPath};
use crate::value::{Map, Value};

/// Key paths whose subtrees are never diffed or locked.
#[derive(Debug, Clone, Default)]
pub struct ExcludedFields(Vec<FieldPath>);

impl ExcludedFields {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn parse<'a>(paths: impl IntoIterator<Item = &'a str>) -> Result<Self, CoreError> {
        let mut excluded = Self::new();
        for path in paths {
            excluded.insert(FieldPath::parse(path)?);
        }
        Ok(excluded)
    }

    pub fn insert(&mut self, path: FieldPath) {
        let path = path.key_path();
        if !self.0.contains(&path) {
            self.0.push(path);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `path` equals or lies beneath an excluded path.
    pub fn covers(&self, path: &FieldPath) -> bool {
        let key_path = path.key_path();
        self.0.iter().any(|excluded| key_path.starts_with(excluded))
    }
}

/// Array key path -> name of the field identifying its elements.
#[derive(Debug, Clone, Default)]
pub struct ArrayRules(HashMap<FieldPath, String>);

impl ArrayRules {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn parse<'a>(
        rules: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, CoreError> {
        let mut parsed = Self::new();
        for (path, field) in rules {
            parsed.insert(FieldPath::parse(path)?, field)?;
        }
        Ok(parsed)
    }

    pub fn insert(&mut self, path: FieldPath, identity_field: &str) -> Result<(), CoreError> {
        crate::escape::validate_key(identity_field)?;
        self.0.insert(path.key_path(), identity_field.to_string());
        Ok(())
    }

    pub fn identity_field(&self, path: &FieldPath) -> Option<&str> {
        self.0.get(&path.key_path()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub excluded: ExcludedFields,
    pub array_rules: ArrayRules,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeValue {
    Set(Value),
    /// Present in the base, missing from the candidate.
    Absent,
}

impl ChangeValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ChangeValue::Set(v) => Some(v),
            ChangeValue::Absent => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: FieldPath,
    pub value: ChangeValue,
}

impl Change {
    fn set(path: &FieldPath, value: &Value) -> Self {
        Self {
            path: path.clone(),
            value: ChangeValue::Set(value.clone()),
        }
    }

    fn absent(path: FieldPath) -> Self {
        Self {
            path,
            value: ChangeValue::Absent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DiffWarning {
    /// An identity rule matched an array whose elements could not be keyed;
    /// the array was compared as a whole instead.
    UnknownArrayIdentity { path: FieldPath, field: String },
}

impl From<&DiffWarning> for CoreError {
    fn from(warning: &DiffWarning) -> Self {
        match warning {
            DiffWarning::UnknownArrayIdentity { path, field } => CoreError::UnknownArrayIdentity {
                path: path.to_string(),
                field: field.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffReport {
    /// Divergent paths outside excluded subtrees, in walk order.
    pub changes: Vec<Change>,
    /// Divergences found at excluded nodes, reported once per node.
    pub excluded: Vec<Change>,
    pub warnings: Vec<DiffWarning>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

pub fn diff(base: &Value, candidate: &Value, options: &DiffOptions) -> Result<DiffReport, CoreError> {
    let mut walker = Walker {
        options,
        report: DiffReport::default(),
    };
    walker.node(&FieldPath::root(), Some(base), candidate)?;
    Ok(walker.report)
}

struct Walker<'o> {
    options: &'o DiffOptions,
    report: DiffReport,
}

impl Walker<'_> {
    fn node(
        &mut self,
        path: &FieldPath,
        base: Option<&Value>,
        candidate: &Value,
    ) -> Result<(), CoreError> {
        if !path.is_root() && self.options.excluded.covers(path) {
            if base != Some(candidate) {
                self.report.excluded.push(Change::set(path, candidate));
            }
            return Ok(());
        }

        match (base, candidate) {
            (Some(Value::Object(b)), Value::Object(c)) => self.object(path, Some(b), c),
            (_, Value::Object(c)) if !c.is_empty() => self.object(path, None, c),
            (Some(Value::Array(b)), Value::Array(c)) => self.array(path, b, c),
            (base, candidate) => {
                self.opaque(path, base, candidate);
                Ok(())
            }
        }
    }

    fn opaque(&mut self, path: &FieldPath, base: Option<&Value>, candidate: &Value) {
        if base != Some(candidate) {
            self.report.changes.push(Change::set(path, candidate));
        }
    }

    fn object(&mut self, path: &FieldPath, base: Option<&Map>, candidate: &Map) -> Result<(), CoreError> {
        for (key, child) in candidate.iter() {
            let child_path = path.key(key)?;
            self.node(&child_path, base.and_then(|b| b.get(key)), child)?;
        }

        let Some(base) = base else {
            return Ok(());
        };
        for key in base.keys() {
            if candidate.contains_key(key) {
                continue;
            }
            let child_path = path.key(key)?;
            if self.options.excluded.covers(&child_path) {
                self.report.excluded.push(Change::absent(child_path));
            } else {
                self.report.changes.push(Change::absent(child_path));
            }
        }
        Ok(())
    }

    fn array(&mut self, path: &FieldPath, base: &[Value], candidate: &[Value]) -> Result<(), CoreError> {
        let Some(field) = self.options.array_rules.identity_field(path) else {
            self.opaque_array(path, base, candidate);
            return Ok(());
        };

        let (Some(base_index), Some(candidate_index)) =
            (IdentityIndex::build(base, field), IdentityIndex::build(candidate, field))
        else {
            tracing::warn!(
                path = %path,
                field,
                "array elements lack a usable identity field, comparing the whole array"
            );
            self.report.warnings.push(DiffWarning::UnknownArrayIdentity {
                path: path.clone(),
                field: field.to_string(),
            });
            self.opaque_array(path, base, candidate);
            return Ok(());
        };

        for (pos, id) in candidate_index.order.iter().enumerate() {
            let element_path = path.element(field, id.clone())?;
            match base_index.positions.get(id) {
                Some(&base_pos) => self.node(&element_path, Some(&base[base_pos]), &candidate[pos])?,
                None => self.report.changes.push(Change::set(&element_path, &candidate[pos])),
            }
        }
        for id in &base_index.order {
            if !candidate_index.positions.contains_key(id) {
                self.report.changes.push(Change::absent(path.element(field, id.clone())?));
            }
        }
        Ok(())
    }

    fn opaque_array(&mut self, path: &FieldPath, base: &[Value], candidate: &[Value]) {
        if base != candidate {
            self.report
                .changes
                .push(Change::set(path, &Value::Array(candidate.to_vec())));
        }
    }
}

/// Elements of one array keyed by their identity value. Building it is a
/// single pass; it fails when any element lacks a unique scalar identity.
struct IdentityIndex {
    order: Vec<ElementId>,
    positions: HashMap<ElementId, usize>,
}

impl IdentityIndex {
    fn build(items: &[Value], field: &str) -> Option<Self> {
        let mut order = Vec::with_capacity(items.len());
        let mut positions = HashMap::with_capacity(items.len());
        for (pos, item) in items.iter().enumerate() {
            let id = item.as_object()?.get(field)?.identity_key()?;
            if !id.is_selectable() || positions.insert(id.clone(), pos).is_some() {
                return None;
            }
            order.push(id);
        }
        Some(Self { order, positions })
    }
}
