use std::fmt::Write;

use serde::Serialize;
use serde_json::Value;

/// An ordered sequence of key segments supplied by the caller.
///
/// Segments are primitives or plain objects. Identity is by value: two keys built
/// from deep-equal segments hash identically, whatever the insertion order of object fields.
///
/// Use [`cache_key!`](crate::cache_key) to build one from heterogeneous values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKey(pub Vec<Value>);

impl CacheKey {
    /// Creates an empty key.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a segment. Values that fail to serialize become `null`.
    pub fn push(&mut self, segment: impl Serialize) {
        self.0.push(serde_json::to_value(segment).unwrap_or(Value::Null));
    }

    /// Builder flavour of [`push`](Self::push).
    pub fn with(mut self, segment: impl Serialize) -> Self {
        self.push(segment);
        self
    }

    /// The key segments.
    pub fn segments(&self) -> &[Value] {
        &self.0
    }

    /// Canonical hash of the whole sequence.
    pub fn hash(&self) -> KeyHash {
        KeyHash(serialize_key(&self.0))
    }
}

impl From<Vec<Value>> for CacheKey {
    fn from(segments: Vec<Value>) -> Self {
        Self(segments)
    }
}

impl FromIterator<Value> for CacheKey {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Canonical string identity of a key sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHash(pub String);

impl KeyHash {
    /// The canonical serialization.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for KeyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Serializes a key sequence canonically.
///
/// Object fields are written in lexicographic order at every depth, arrays keep their order
/// and primitives use their JSON literal. The output does not depend on whether serde_json
/// preserves map insertion order.
pub fn serialize_key(segments: &[Value]) -> String {
    let mut out = String::new();
    out.push('[');
    for (index, segment) in segments.iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_canonical(segment, &mut out);
    }
    out.push(']');
    out
}

/// Serializes a single key segment canonically.
pub fn serialize_segment(segment: &Value) -> String {
    let mut out = String::new();
    write_canonical(segment, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        // Serializing a str cannot fail, keep a readable fallback anyway.
        Err(_) => {
            let _ = write!(out, "{s:?}");
        }
    }
}

/// The container kind a key belongs to. Part of every derived hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueryKind {
    /// A plain [`Query`](crate::Query).
    Query,
    /// An [`InfiniteQuery`](crate::InfiniteQuery).
    InfiniteQuery,
}

/// The four hashes derived for one query instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    /// The full key of the instance, root key plus configuration descriptor.
    pub query_key: CacheKey,
    /// Identifies the instance (includes fetch policy, background flag and time bucket).
    pub query_key_hash: KeyHash,
    /// Identifies the shared data cell. Independent of per-call configuration.
    pub data_key_hash: KeyHash,
    /// Identifies the shared status cell.
    pub status_key_hash: KeyHash,
    /// Identifies the shared background status cell.
    pub background_status_key_hash: KeyHash,
}
