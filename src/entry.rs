//! Stream entry and record types.
//!
//! A [`StreamEntry`] is what the consumer delivers: the store-assigned entry
//! id plus the ordered field list, with values passed through the best-effort
//! JSON decode. A [`Record`] is what the producer accepts: an ordered field
//! list whose non-string values are JSON-encoded on the wire.

use serde_json::Value;

/// One entry read from a stream.
///
/// Field order is exactly the order the store returned. The entry is an
/// immutable value object; consumers own their copy.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Store-assigned entry id, e.g. `"1700000000000-0"`.
    pub id: String,
    /// Field name / decoded value pairs, in wire order.
    pub fields: Vec<(String, Value)>,
}

impl StreamEntry {
    /// Look up the first field with the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
}

/// Best-effort JSON decode of a field value.
///
/// Only payloads that *look* like JSON containers (first non-whitespace byte
/// is `{` or `[`) are parsed; everything else stays a string. This keeps
/// `"123"` as the string `"123"` rather than the number 123, so values that
/// were written as strings round-trip as strings.
pub fn try_decode(raw: &str) -> Value {
    let looks_like_json = matches!(
        raw.trim_start().as_bytes().first(),
        Some(b'{') | Some(b'[')
    );
    if looks_like_json {
        match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => Value::String(raw.to_string()),
        }
    } else {
        Value::String(raw.to_string())
    }
}

/// An ordered field list to append to a stream.
///
/// String values go on the wire unchanged; anything else is JSON-encoded.
///
/// Field names and string values must not contain CR or LF: the wire
/// protocol frames bulk payloads as CRLF-delimited lines, so an embedded
/// line break is rejected on read-back as a frame-integrity error.
/// JSON-encoded values never contain literal line breaks.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, preserving insertion order. Builder-style.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the record carries no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Flatten to the wire argument list: `field, value, field, value, ...`.
    ///
    /// Strings pass through; other JSON values are serialized compactly.
    pub fn to_wire_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.fields.len() * 2);
        for (name, value) in &self.fields {
            args.push(name.clone());
            match value {
                Value::String(s) => args.push(s.clone()),
                other => args.push(other.to_string()),
            }
        }
        args
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
