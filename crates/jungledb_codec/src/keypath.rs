//! Key paths for secondary-key extraction.

use crate::value::Value;

/// A path used to extract a secondary key from a record.
///
/// A key path is a single attribute name or a non-empty ordered sequence
/// of attribute names. Resolution walks nested map attributes; a missing
/// attribute at any depth yields *absent* rather than an error, so
/// records that do not conform to an index's shape are simply skipped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Creates a key path from a single attribute name.
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            segments: vec![attribute.into()],
        }
    }

    /// Creates a key path from an ordered sequence of attribute names.
    ///
    /// # Panics
    ///
    /// Panics if `segments` is empty; a key path must name at least one
    /// attribute.
    pub fn nested<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        assert!(!segments.is_empty(), "key path must not be empty");
        Self { segments }
    }

    /// The attribute names of this path, outermost first.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Resolves this path against a record.
    ///
    /// Returns `None` if any intermediate attribute is missing or the
    /// record is not map-shaped at some depth.
    #[must_use]
    pub fn resolve<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        let mut current = record;
        for segment in &self.segments {
            current = current.attribute(segment)?;
        }
        Some(current)
    }

    /// Returns the secondary keys a record contributes to an index.
    ///
    /// Without `multi_entry` the resolved value itself is the single
    /// secondary key. With `multi_entry`, an array value contributes one
    /// key per distinct element; any other resolved value still
    /// contributes itself. An unresolved path contributes nothing.
    #[must_use]
    pub fn index_keys(&self, record: &Value, multi_entry: bool) -> Vec<Value> {
        let Some(resolved) = self.resolve(record) else {
            return Vec::new();
        };
        match resolved {
            Value::Array(items) if multi_entry => {
                let mut keys: Vec<Value> = items.clone();
                keys.sort();
                keys.dedup();
                keys
            }
            other => vec![other.clone()],
        }
    }
}

impl From<&str> for KeyPath {
    fn from(attribute: &str) -> Self {
        KeyPath::new(attribute)
    }
}

impl std::fmt::Display for KeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Value {
        Value::map(vec![
            ("val", Value::Integer(123)),
            ("a", Value::map(vec![("b", Value::Integer(1))])),
            (
                "tags",
                Value::Array(vec![Value::from("x"), Value::from("y"), Value::from("x")]),
            ),
        ])
    }

    #[test]
    fn resolve_single_attribute() {
        let path = KeyPath::new("val");
        assert_eq!(path.resolve(&record()), Some(&Value::Integer(123)));
    }

    #[test]
    fn resolve_nested_path() {
        let path = KeyPath::nested(["a", "b"]);
        assert_eq!(path.resolve(&record()), Some(&Value::Integer(1)));
    }

    #[test]
    fn missing_attribute_is_absent() {
        let path = KeyPath::nested(["a", "missing"]);
        assert_eq!(path.resolve(&record()), None);
    }

    #[test]
    fn non_map_record_is_absent() {
        let path = KeyPath::nested(["a", "b"]);
        assert_eq!(path.resolve(&Value::from("other")), None);
    }

    #[test]
    fn index_keys_plain() {
        let path = KeyPath::new("val");
        assert_eq!(path.index_keys(&record(), false), vec![Value::Integer(123)]);
    }

    #[test]
    fn index_keys_multi_entry_dedups() {
        let path = KeyPath::new("tags");
        let keys = path.index_keys(&record(), true);
        assert_eq!(keys, vec![Value::from("x"), Value::from("y")]);
    }

    #[test]
    fn index_keys_multi_entry_non_array() {
        let path = KeyPath::new("val");
        assert_eq!(path.index_keys(&record(), true), vec![Value::Integer(123)]);
    }

    #[test]
    fn index_keys_absent_contributes_nothing() {
        let path = KeyPath::nested(["a", "b"]);
        assert!(path.index_keys(&Value::from("other"), false).is_empty());
    }

    #[test]
    #[should_panic(expected = "key path must not be empty")]
    fn empty_path_panics() {
        let _ = KeyPath::nested(Vec::<String>::new());
    }
}
