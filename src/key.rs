//! Query key definitions.
//!
//! A [`QueryKey`] is an ordered sequence of primitive segments that
//! partitions the cache. Keys form a prefix lattice: `comments` is a prefix
//! of `comments/abc`, which bulk invalidation relies on.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One element of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    /// Entity names, slugs, external identifiers.
    Str(String),
    /// Numeric identifiers and page numbers.
    Int(i64),
    /// A filter slot that is present but unset.
    Null,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Str(s) => f.write_str(s),
            Segment::Int(n) => write!(f, "{n}"),
            Segment::Null => f.write_str("null"),
        }
    }
}

impl From<&str> for Segment {
    fn from(value: &str) -> Self {
        Segment::Str(value.to_string())
    }
}

impl From<String> for Segment {
    fn from(value: String) -> Self {
        Segment::Str(value)
    }
}

impl From<i64> for Segment {
    fn from(value: i64) -> Self {
        Segment::Int(value)
    }
}

impl From<u32> for Segment {
    fn from(value: u32) -> Self {
        Segment::Int(i64::from(value))
    }
}

impl<T: Into<Segment>> From<Option<T>> for Segment {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => inner.into(),
            None => Segment::Null,
        }
    }
}

/// Structured identifier for one cached resource instance.
///
/// Two keys are equal iff their segment sequences are element-wise equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(Vec<Segment>);

impl QueryKey {
    /// Start a key from its entity segment, e.g. `QueryKey::root("comments")`.
    pub fn root(segment: impl Into<Segment>) -> Self {
        Self(vec![segment.into()])
    }

    /// Append a segment, consuming the key. Chains into tuple-style keys:
    /// `QueryKey::root("comments").with(announcement_id)`.
    pub fn with(mut self, segment: impl Into<Segment>) -> Self {
        self.0.push(segment.into());
        self
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

    /// True when `prefix` equals this key or is an ancestor of it in the
    /// prefix lattice. An empty prefix matches every key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl<S: Into<Segment>> FromIterator<S> for QueryKey {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}
