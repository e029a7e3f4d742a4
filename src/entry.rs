//! Log entries, label normalization and stream keys.
//!
//! An [`Entry`] is the unit callers submit: a timestamp, a log line and the
//! labels identifying the stream it belongs to. Labels are normalized into a
//! sorted [`LabelSet`] at submission time, and every label set maps to exactly
//! one [`StreamKey`] regardless of the order the caller supplied the labels in.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Label substituted when a caller submits an entry without labels.
pub const DEFAULT_LABEL_NAME: &str = "job";

/// Value of the default label.
pub const DEFAULT_LABEL_VALUE: &str = "loki-shipper";

/// Loki's own default for `max_label_names_per_series`.
pub const DEFAULT_MAX_LABELS_PER_STREAM: usize = 15;

/// A single log line tagged with the labels of its stream.
///
/// Entries are immutable once created. Label order does not matter; two
/// entries whose labels contain the same pairs end up in the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    timestamp: DateTime<Utc>,
    line: String,
    labels: Vec<(String, String)>,
}

impl Entry {
    /// Create an entry stamped with the current wall-clock time.
    pub fn new<I, K, V>(line: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::with_timestamp(Utc::now(), line, labels)
    }

    /// Create an entry with an explicit timestamp.
    pub fn with_timestamp<I, K, V>(
        timestamp: DateTime<Utc>,
        line: impl Into<String>,
        labels: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            timestamp,
            line: line.into(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Labels exactly as the caller supplied them.
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    /// Number of bytes this entry contributes to a stream buffer.
    pub fn size(&self) -> usize {
        self.line.len()
    }

    /// Stream key of the raw labels, without validation.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::compute(self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub(crate) fn into_parts(self) -> (DateTime<Utc>, String, Vec<(String, String)>) {
        (self.timestamp, self.line, self.labels)
    }
}

/// Reasons a label set is refused at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("label name is empty")]
    EmptyName,

    #[error("invalid label name '{0}'")]
    InvalidName(String),

    #[error("duplicate label name '{0}'")]
    DuplicateName(String),

    #[error("label set has {count} labels, maximum is {max}")]
    TooMany { count: usize, max: usize },
}

/// Rules applied when normalizing a caller's labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPolicy {
    /// Maximum number of labels in a single label set
    pub max_labels: usize,

    /// Label used when the caller supplies none
    pub default_label: (String, String),
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self {
            max_labels: DEFAULT_MAX_LABELS_PER_STREAM,
            default_label: (DEFAULT_LABEL_NAME.to_string(), DEFAULT_LABEL_VALUE.to_string()),
        }
    }
}

/// A validated label set, sorted by label name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet {
    labels: Vec<(String, String)>,
}

impl LabelSet {
    /// Validate and sort `labels`.
    ///
    /// An empty input is replaced by the policy's default label. Empty names,
    /// names that are not valid Loki label names, duplicate names and sets
    /// larger than the policy allows are rejected.
    pub fn normalize(
        mut labels: Vec<(String, String)>,
        policy: &LabelPolicy,
    ) -> Result<Self, LabelError> {
        if labels.is_empty() {
            labels.push(policy.default_label.clone());
        }

        for (name, _) in &labels {
            if name.is_empty() {
                return Err(LabelError::EmptyName);
            }
            if !is_valid_label_name(name) {
                return Err(LabelError::InvalidName(name.clone()));
            }
        }

        labels.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(pair) = labels.windows(2).find(|pair| pair[0].0 == pair[1].0) {
            return Err(LabelError::DuplicateName(pair[0].0.clone()));
        }

        if labels.len() > policy.max_labels {
            return Err(LabelError::TooMany {
                count: labels.len(),
                max: policy.max_labels,
            });
        }

        Ok(Self { labels })
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::from_sorted(self.iter())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .binary_search_by(|(k, _)| k.as_str().cmp(name))
            .ok()
            .map(|idx| self.labels[idx].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Serialize for LabelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.labels.len()))?;
        for (name, value) in &self.labels {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Canonical, order-independent identity of a stream.
///
/// The key is rendered as a LogQL stream selector (`{app="foo",env="prod"}`)
/// with names sorted, so it can also be used verbatim in a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    /// Compute the key of an arbitrary label sequence.
    ///
    /// Pure and total: input order is irrelevant and nothing is rejected.
    pub fn compute<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut pairs: Vec<(&str, &str)> = labels.into_iter().collect();
        pairs.sort_unstable();
        Self::from_sorted(pairs)
    }

    fn from_sorted<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut key = String::from("{");
        for (idx, (name, value)) in labels.into_iter().enumerate() {
            if idx > 0 {
                key.push(',');
            }
            key.push_str(name);
            key.push_str("=\"");
            escape_into(&mut key, value);
            key.push('"');
        }
        key.push('}');
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
