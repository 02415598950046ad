//! C2 — a case-insensitive, multi-value HTTP header collection.
//!
//! Names are compared case-insensitively but their original casing (of the
//! first insertion) is preserved for the canonical lower-cased iteration key;
//! insertion order of distinct names is preserved.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::InvalidHeaderName;

/// `true` iff `name` is a legal RFC 7230 `token`:
/// `[A-Za-z0-9!#$%&'*+\-.^_`|~]+`
fn is_legal_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Case-insensitive, ordered, multi-value header map.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    // keyed by lowercased name; values preserve insertion order within a name
    entries: HashMap<String, Vec<String>>,
    // preserves the order names were first inserted, for iteration
    order: Vec<String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an iterator of `(name, value)` pairs, appending duplicates.
    pub fn from_pairs<I, N, V>(pairs: I) -> Result<Self, InvalidHeaderName>
    where
        I: IntoIterator<Item = (N, V)>,
        N: AsRef<str>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.append(name.as_ref(), value)?;
        }
        Ok(headers)
    }

    fn normalize(name: &str) -> Result<String, InvalidHeaderName> {
        if !is_legal_token(name) {
            return Err(InvalidHeaderName(name.to_string()));
        }
        Ok(name.to_ascii_lowercase())
    }

    /// Replaces any existing values for `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), InvalidHeaderName> {
        let key = Self::normalize(name)?;
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, vec![value.into()]);
        Ok(())
    }

    /// Appends a value for `name`, preserving any existing ones.
    pub fn append(&mut self, name: &str, value: impl Into<String>) -> Result<(), InvalidHeaderName> {
        let key = Self::normalize(name)?;
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.entry(key).or_default().push(value.into());
        Ok(())
    }

    /// Returns the first value for `name`, if present. Name comparison is
    /// case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Returns every value for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        let key = name.to_ascii_lowercase();
        self.entries.get(&key).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Iterates `(lowercased-name, values)` in name-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.order
            .iter()
            .map(|key| (key.as_str(), self.entries[key].as_slice()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Collapses single-value entries to scalars for the outgoing JSON form.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::with_capacity(self.order.len());
        for (name, values) in self.iter() {
            let value = if values.len() == 1 {
                serde_json::Value::String(values[0].clone())
            } else {
                serde_json::Value::Array(
                    values
                        .iter()
                        .cloned()
                        .map(serde_json::Value::String)
                        .collect(),
                )
            };
            map.insert(name.to_string(), value);
        }
        serde_json::Value::Object(map)
    }
}

impl Serialize for Headers {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get_after_set() {
        let mut headers = Headers::new();
        headers.set("Content-Type", "text/plain").unwrap();
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn append_preserves_order_and_duplicates() {
        let mut headers = Headers::new();
        headers.append("X-Foo", "a").unwrap();
        headers.append("X-Foo", "b").unwrap();
        assert_eq!(headers.get_all("x-foo"), &["a".to_string(), "b".to_string()]);
        assert_eq!(headers.get("x-foo"), Some("a"));
    }

    #[test]
    fn set_replaces_existing_values() {
        let mut headers = Headers::new();
        headers.append("X-Foo", "a").unwrap();
        headers.set("X-Foo", "z").unwrap();
        assert_eq!(headers.get_all("x-foo"), &["z".to_string()]);
    }

    #[test]
    fn illegal_name_is_rejected() {
        let mut headers = Headers::new();
        assert!(headers.set("bad header", "x").is_err());
        assert!(headers.set("bad:header", "x").is_err());
    }

    #[test]
    fn iteration_preserves_name_insertion_order() {
        let mut headers = Headers::new();
        headers.set("B", "1").unwrap();
        headers.set("A", "2").unwrap();
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn to_json_collapses_single_values() {
        let mut headers = Headers::new();
        headers.set("X-Foo", "bar").unwrap();
        headers.append("X-Multi", "1").unwrap();
        headers.append("X-Multi", "2").unwrap();
        let json = headers.to_json();
        assert_eq!(json["x-foo"], serde_json::json!("bar"));
        assert_eq!(json["x-multi"], serde_json::json!(["1", "2"]));
    }
}
