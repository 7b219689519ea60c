use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::escape::{encode, unescape_key, validate_key};
use crate::value::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// An object key, held in raw (unescaped) form.
    Key(String),
    /// The element of the preceding array whose `field` has the canonical
    /// identity value `id`.
    Element { field: String, id: ElementId },
}

/// Canonical identity value of an array element.
///
/// Text, timestamps and entity references share the text variant, the same
/// way they compare equal as values. Numbers and booleans keep their type,
/// so `1`, `"1"` and `true` never select the same element. In the textual
/// path form non-text identities are written as `$` literals (`[id=$1]`);
/// an escaped text id can never start with a raw `$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementId {
    Text(String),
    /// Canonical decimal form; integral floats are written as integers. The
    /// decimal point is escaped like any key character in the path form.
    Number(String),
    Boolean(bool),
}

impl ElementId {
    pub fn integer(n: i64) -> Self {
        ElementId::Number(n.to_string())
    }

    pub fn float(f: f64) -> Self {
        if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
            ElementId::integer(f as i64)
        } else {
            ElementId::Number(f.to_string())
        }
    }

    pub(crate) fn is_selectable(&self) -> bool {
        self.validate().is_ok()
    }

    fn validate(&self) -> Result<(), CoreError> {
        match self {
            ElementId::Text(text) => validate_key(text),
            ElementId::Number(_) | ElementId::Boolean(_) => Ok(()),
        }
    }

    fn parse(text: &str) -> Result<Self, CoreError> {
        let Some(literal) = text.strip_prefix(LITERAL) else {
            return Ok(ElementId::Text(unescape_key(text)?));
        };
        match unescape_key(literal)?.as_str() {
            "true" => Ok(ElementId::Boolean(true)),
            "false" => Ok(ElementId::Boolean(false)),
            number => {
                if let Ok(n) = number.parse::<i64>() {
                    return Ok(ElementId::integer(n));
                }
                number
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(ElementId::float)
                    .ok_or_else(|| CoreError::invalid_key(text, "unknown selector literal"))
            }
        }
    }
}

const LITERAL: char = '$';

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementId::Text(text) => f.write_str(&encode(text)),
            ElementId::Number(n) => write!(f, "{LITERAL}{}", encode(n)),
            ElementId::Boolean(b) => write!(f, "{LITERAL}{b}"),
        }
    }
}

impl From<&str> for ElementId {
    fn from(text: &str) -> Self {
        ElementId::Text(text.to_string())
    }
}

impl From<String> for ElementId {
    fn from(text: String) -> Self {
        ElementId::Text(text)
    }
}

impl From<i64> for ElementId {
    fn from(n: i64) -> Self {
        ElementId::integer(n)
    }
}

impl From<bool> for ElementId {
    fn from(b: bool) -> Self {
        ElementId::Boolean(b)
    }
}

/// A path to a node of a document.
///
/// The textual form is the escaped path used as a store address and as the
/// key of lock entries: `labels.fr%2EFR`, `attributes[attributeId=A].value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<Segment>);

impl FieldPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn key(&self, key: &str) -> Result<Self, CoreError> {
        validate_key(key)?;
        let mut segments = self.0.clone();
        segments.push(Segment::Key(key.to_string()));
        Ok(Self(segments))
    }

    pub fn element(&self, field: &str, id: impl Into<ElementId>) -> Result<Self, CoreError> {
        match self.0.last() {
            Some(Segment::Key(_)) => {}
            _ => {
                return Err(CoreError::invalid_path(
                    &self.to_string(),
                    "element selector must follow a key",
                ));
            }
        }
        validate_key(field)?;
        let id = id.into();
        id.validate()?;
        let mut segments = self.0.clone();
        segments.push(Segment::Element {
            field: field.to_string(),
            id,
        });
        Ok(Self(segments))
    }

    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Proper prefixes of this path, shortest first.
    pub fn ancestors(&self) -> impl Iterator<Item = FieldPath> + '_ {
        (1..self.0.len()).map(|n| FieldPath(self.0[..n].to_vec()))
    }

    /// The same path with array element selectors dropped. Exclusion and
    /// array identity rules are declared on key paths.
    pub fn key_path(&self) -> FieldPath {
        FieldPath(
            self.0
                .iter()
                .filter(|s| matches!(s, Segment::Key(_)))
                .cloned()
                .collect(),
        )
    }

    /// Addresses the same node inside the escaped form of a document.
    ///
    /// Key segments and selector fields are object keys and get escaped;
    /// selector ids are values and are kept as they are. The result is only
    /// meant for `get_at_path`/`set_at_path` on stored documents.
    pub fn escaped(&self) -> FieldPath {
        FieldPath(
            self.0
                .iter()
                .map(|segment| match segment {
                    Segment::Key(key) => Segment::Key(encode(key)),
                    Segment::Element { field, id } => Segment::Element {
                        field: encode(field),
                        id: id.clone(),
                    },
                })
                .collect(),
        )
    }

    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let mut segments = Vec::new();
        if text.is_empty() {
            return Ok(Self(segments));
        }

        for piece in text.split('.') {
            let (key, mut selectors) = match piece.find('[') {
                Some(pos) => (&piece[..pos], &piece[pos..]),
                None => (piece, ""),
            };
            if key.is_empty() {
                return Err(CoreError::invalid_path(text, "empty segment"));
            }
            segments.push(Segment::Key(unescape_key(key)?));

            while !selectors.is_empty() {
                let close = selectors
                    .find(']')
                    .ok_or_else(|| CoreError::invalid_path(text, "unterminated selector"))?;
                let body = &selectors[1..close];
                let (field, id) = body
                    .split_once('=')
                    .ok_or_else(|| CoreError::invalid_path(text, "selector without '='"))?;
                segments.push(Segment::Element {
                    field: unescape_key(field)?,
                    id: ElementId::parse(id)?,
                });
                selectors = &selectors[close + 1..];
                if !selectors.is_empty() && !selectors.starts_with('[') {
                    return Err(CoreError::invalid_path(text, "text after selector"));
                }
            }
        }
        Ok(Self(segments))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Key(key) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(&encode(key))?;
                }
                Segment::Element { field, id } => {
                    write!(f, "[{}={}]", encode(field), id)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        FieldPath::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn element_position(items: &[Value], field: &str, id: &ElementId) -> Option<usize> {
    items.iter().position(|item| {
        item.as_object()
            .and_then(|map| map.get(field))
            .and_then(Value::identity_key)
            .is_some_and(|key| key == *id)
    })
}

fn ensure_object(value: &mut Value) -> &mut Map {
    match value {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(Map::new());
            ensure_object(other)
        }
    }
}

pub fn get_at_path<'a>(doc: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.segments() {
        current = match segment {
            Segment::Key(key) => current.as_object()?.get(key)?,
            Segment::Element { field, id } => {
                let items = current.as_array()?;
                &items[element_position(items, field, id)?]
            }
        };
    }
    Some(current)
}

/// Writes `value` at `path`, creating intermediate objects and replacing
/// scalars that stand where an object is needed. A missing identified
/// element is appended when it is the last segment.
pub fn set_at_path(doc: &mut Value, path: &FieldPath, value: Value) -> Result<(), CoreError> {
    let Some((last, parents)) = path.segments().split_last() else {
        *doc = value;
        return Ok(());
    };

    let mut current = doc;
    for (i, segment) in parents.iter().enumerate() {
        current = match segment {
            Segment::Key(key) => {
                let map = ensure_object(current);
                if !map.contains_key(key) {
                    map.insert(key.clone(), Value::Object(Map::new()));
                }
                map.get_mut(key).ok_or_else(|| {
                    CoreError::invalid_path(&path.to_string(), "key vanished during write")
                })?
            }
            Segment::Element { field, id } => {
                let Value::Array(items) = current else {
                    return Err(CoreError::invalid_path(
                        &path.to_string(),
                        format!("segment {i} selects an element of a non-array"),
                    ));
                };
                let pos = element_position(items, field, id).ok_or_else(|| {
                    CoreError::invalid_path(&path.to_string(), format!("no element {field}={id}"))
                })?;
                &mut items[pos]
            }
        };
    }

    match last {
        Segment::Key(key) => {
            ensure_object(current).insert(key.clone(), value);
        }
        Segment::Element { field, id } => {
            let Value::Array(items) = current else {
                return Err(CoreError::invalid_path(
                    &path.to_string(),
                    "last segment selects an element of a non-array",
                ));
            };
            match element_position(items, field, id) {
                Some(pos) => items[pos] = value,
                None => items.push(value),
            }
        }
    }
    Ok(())
}

pub fn remove_at_path(doc: &mut Value, path: &FieldPath) -> Option<Value> {
    let (last, parents) = path.segments().split_last()?;
    let mut current = doc;
    for segment in parents {
        current = match segment {
            Segment::Key(key) => current.as_object_mut()?.get_mut(key)?,
            Segment::Element { field, id } => {
                let Value::Array(items) = current else {
                    return None;
                };
                let pos = element_position(items, field, id)?;
                &mut items[pos]
            }
        };
    }
    match last {
        Segment::Key(key) => current.as_object_mut()?.remove(key),
        Segment::Element { field, id } => {
            let Value::Array(items) = current else {
                return None;
            };
            let pos = element_position(items, field, id)?;
            Some(items.remove(pos))
        }
    }
}
