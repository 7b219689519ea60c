use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;
use crate::path::ElementId;

/// A node of a document tree.
///
/// Equality is canonical rather than structural: mapping keys compare
/// order-independently, integers and floats compare numerically, and
/// timestamps and entity references compare equal to the text they
/// serialize to. A document read back from the store therefore never
/// differs from the value that was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    EntityRef(EntityId),
    Array(Vec<Value>),
    Object(Map),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Integer(i), Self::Float(f)) | (Self::Float(f), Self::Integer(i)) => {
                (*i as f64).total_cmp(f).is_eq()
            }
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (a, b) => match (a.canonical_text(), b.canonical_text()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Object(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::EntityRef(_) => "entity_ref",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// The text form a value takes once serialized, for the variants that
    /// serialize to a string.
    fn canonical_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::Text(s) => Some(Cow::Borrowed(s)),
            Value::Timestamp(ts) => Some(Cow::Owned(canonical_timestamp(ts))),
            Value::EntityRef(id) => Some(Cow::Owned(id.to_string())),
            _ => None,
        }
    }

    /// Canonical key of a scalar, used to match array elements by identity.
    /// Two scalars share a key exactly when they compare equal. Composite
    /// values have no identity key.
    pub fn identity_key(&self) -> Option<ElementId> {
        match self {
            Value::Null | Value::Array(_) | Value::Object(_) => None,
            Value::Boolean(b) => Some(ElementId::Boolean(*b)),
            Value::Integer(n) => Some(ElementId::integer(*n)),
            Value::Float(f) => Some(ElementId::float(*f)),
            other => other
                .canonical_text()
                .map(|text| ElementId::Text(text.into_owned())),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Integer(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(canonical_timestamp(ts)),
            Value::EntityRef(id) => serde_json::Value::String(id.to_string()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect(),
            ),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Value::EntityRef(id)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

/// An insertion-ordered mapping. The order is what makes diff output
/// deterministic; lookups are hashed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Map(IndexMap<String, Value>);

impl Map {
    pub fn new() -> Self {
        Self(IndexMap::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(IndexMap::with_capacity(capacity))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Replaces the value in place if the key exists, otherwise appends.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Removes a key, keeping the order of the others.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(k, v)| other.get(k) == Some(v))
    }
}

impl FromIterator<(String, Value)> for Map {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Map {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn object_equality_ignores_key_order() {
        let a = Value::from(json!({ "fr-FR": "description", "en-GB": "english" }));
        let b = Value::from(json!({ "en-GB": "english", "fr-FR": "description" }));
        assert_eq!(a, b);
    }

    #[test]
    fn array_equality_is_positional() {
        let a = Value::from(json!([1, 2, 3]));
        let b = Value::from(json!([3, 2, 1]));
        assert_ne!(a, b);
    }

    #[test]
    fn integer_and_float_compare_numerically() {
        assert_eq!(Value::Integer(3), Value::Float(3.0));
        assert_ne!(Value::Integer(3), Value::Float(3.5));
    }

    #[test]
    fn timestamp_equals_its_serialized_text() {
        let ts = Utc.with_ymd_and_hms(2019, 4, 17, 14, 0, 0).unwrap();
        assert_eq!(Value::Timestamp(ts), Value::from("2019-04-17T14:00:00.000Z"));
        assert_ne!(Value::Timestamp(ts), Value::from("2019-04-17T14:00:01.000Z"));
    }

    #[test]
    fn entity_ref_equals_its_uuid_text() {
        let id = EntityId::new();
        assert_eq!(Value::EntityRef(id), Value::Text(id.to_string()));
    }

    #[test]
    fn json_conversion_keeps_key_order() {
        let value = Value::from(json!({ "z": 1, "a": { "y": true, "b": null } }));
        let keys: Vec<&str> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
        assert_eq!(value.to_json(), json!({ "z": 1, "a": { "y": true, "b": null } }));
    }

    #[test]
    fn msgpack_preserves_variants() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut map = Map::new();
        map.insert("when", Value::Timestamp(ts));
        map.insert("ratio", Value::Float(0.25));
        let value = Value::Object(map);
        let decoded = Value::from_msgpack(&value.to_msgpack().unwrap()).unwrap();
        assert!(matches!(
            decoded.as_object().unwrap().get("when"),
            Some(Value::Timestamp(_))
        ));
        assert_eq!(decoded, value);
    }

    #[test]
    fn identity_keys_are_canonical() {
        assert_eq!(Value::Integer(7).identity_key(), Some(ElementId::integer(7)));
        assert_eq!(Value::Float(7.0).identity_key(), Value::Integer(7).identity_key());
        assert_eq!(Value::from("A").identity_key(), Some(ElementId::from("A")));
        let ts = Utc.with_ymd_and_hms(2019, 4, 17, 14, 0, 0).unwrap();
        assert_eq!(
            Value::Timestamp(ts).identity_key(),
            Value::from("2019-04-17T14:00:00.000Z").identity_key()
        );
        assert_eq!(Value::Null.identity_key(), None);
        assert_eq!(Value::from(json!({ "id": 1 })).identity_key(), None);
    }

    #[test]
    fn identity_keys_keep_scalar_types_apart() {
        let keys = [
            Value::Integer(1).identity_key(),
            Value::from("1").identity_key(),
            Value::Boolean(true).identity_key(),
            Value::from("true").identity_key(),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_ne!(Value::Integer(1), Value::from("1"));
    }

    #[test]
    fn map_insert_replaces_in_place() {
        let mut map = Map::new();
        map.insert("a", Value::Integer(1));
        map.insert("b", Value::Integer(2));
        assert_eq!(map.insert("a", Value::Integer(3)), Some(Value::Integer(1)));
        let keys: Vec<&str> = map.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.remove("a"), Some(Value::Integer(3)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn map_remove_keeps_order_of_the_rest() {
        let mut map: Map = ["a", "b", "c", "d"]
            .into_iter()
            .enumerate()
            .map(|(i, k)| (k.to_string(), Value::Integer(i as i64)))
            .collect();
        map.remove("b");
        let keys: Vec<&str> = map.keys().collect();
        assert_eq!(keys, vec!["a", "c", "d"]);
        assert_eq!(map.get("d"), Some(&Value::Integer(3)));
    }
}
