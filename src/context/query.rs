//! Parsed query strings

use indexmap::IndexMap;
use serde::Serialize;

/// Pairs past this many are ignored
pub const MAX_QUERY_PAIRS: usize = 1000;

/// Value of one query-string key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum QueryValue {
    /// The key appeared once
    Single(String),
    /// The key appeared more than once; values in order of appearance
    Multiple(Vec<String>),
}

impl QueryValue {
    /// The first value seen for the key
    pub fn first(&self) -> &str {
        match self {
            QueryValue::Single(value) => value,
            QueryValue::Multiple(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// Every value seen for the key
    pub fn all(&self) -> Vec<&str> {
        match self {
            QueryValue::Single(value) => vec![value.as_str()],
            QueryValue::Multiple(values) => values.iter().map(String::as_str).collect(),
        }
    }

    fn push(&mut self, value: String) {
        match self {
            QueryValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = QueryValue::Multiple(vec![first, value]);
            }
            QueryValue::Multiple(values) => values.push(value),
        }
    }
}

/// A decoded `application/x-www-form-urlencoded` query string, keys in order
/// of first appearance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Query(IndexMap<String, QueryValue>);

impl Query {
    /// Decode a query string (without the leading `?`).
    ///
    /// `+` decodes to a space, a key without `=` maps to an empty string, and a
    /// repeated key collects all of its values. Only the first
    /// [`MAX_QUERY_PAIRS`] pairs are read.
    pub fn parse(input: &str) -> Self {
        let mut entries: IndexMap<String, QueryValue> = IndexMap::new();
        for (key, value) in form_urlencoded::parse(input.as_bytes()).take(MAX_QUERY_PAIRS) {
            let value = value.into_owned();
            match entries.get_mut(&*key) {
                Some(existing) => existing.push(value),
                None => {
                    entries.insert(key.into_owned(), QueryValue::Single(value));
                }
            }
        }
        Self(entries)
    }

    /// All values for `key`
    pub fn get(&self, key: &str) -> Option<&QueryValue> {
        self.0.get(key)
    }

    /// First value for `key`
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(QueryValue::first)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries in order of first appearance
    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}
