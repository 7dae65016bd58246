//! Cacheable metadata carried alongside every resolved value.
//!
//! Tags and contexts bubble up from producers to the field and from fields to
//! the response, so that an outer HTTP cache can vary and purge correctly.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// How long a value stays valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxAge {
    /// Valid until a tag invalidates it.
    #[default]
    Permanent,
    /// Valid for the given number of seconds. Zero means never persist.
    Seconds(u64),
}

impl MaxAge {
    /// The "do not cache" value.
    pub const UNCACHEABLE: MaxAge = MaxAge::Seconds(0);

    /// Returns true if this max-age forbids persisting the value.
    pub const fn is_uncacheable(&self) -> bool {
        matches!(self, MaxAge::Seconds(0))
    }
}

impl PartialOrd for MaxAge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MaxAge {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (MaxAge::Permanent, MaxAge::Permanent) => Ordering::Equal,
            (MaxAge::Permanent, MaxAge::Seconds(_)) => Ordering::Greater,
            (MaxAge::Seconds(_), MaxAge::Permanent) => Ordering::Less,
            (MaxAge::Seconds(a), MaxAge::Seconds(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for MaxAge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxAge::Permanent => write!(f, "permanent"),
            MaxAge::Seconds(secs) => write!(f, "{}s", secs),
        }
    }
}

/// Cache tags, cache contexts and max-age accumulated while resolving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheableMetadata {
    /// Invalidation labels.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Cache context tokens the value varies by.
    #[serde(default)]
    pub contexts: BTreeSet<String>,
    /// Validity of the value.
    #[serde(default)]
    pub max_age: MaxAge,
}

impl CacheableMetadata {
    /// Creates empty, permanently cacheable metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata that forbids caching.
    pub fn uncacheable() -> Self {
        Self {
            max_age: MaxAge::UNCACHEABLE,
            ..Self::default()
        }
    }

    /// Adds cache tags.
    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
    }

    /// Adds cache context tokens.
    pub fn add_contexts<I, S>(&mut self, contexts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contexts.extend(contexts.into_iter().map(Into::into));
    }

    /// Lowers the max-age to `max_age` if it is more restrictive.
    pub fn merge_max_age(&mut self, max_age: MaxAge) {
        self.max_age = Ord::min(self.max_age, max_age);
    }

    /// Folds another dependency into this one.
    pub fn add_dependency(&mut self, other: &CacheableMetadata) {
        self.tags.extend(other.tags.iter().cloned());
        self.contexts.extend(other.contexts.iter().cloned());
        self.merge_max_age(other.max_age);
    }

    /// Returns the merge of `self` and `other`.
    #[must_use]
    pub fn merge(mut self, other: &CacheableMetadata) -> Self {
        self.add_dependency(other);
        self
    }

    /// Builder form of [`add_tags`](Self::add_tags).
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_tags(tags);
        self
    }

    /// Builder form of [`add_contexts`](Self::add_contexts).
    #[must_use]
    pub fn with_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_contexts(contexts);
        self
    }

    /// Builder form of [`merge_max_age`](Self::merge_max_age).
    #[must_use]
    pub fn with_max_age(mut self, max_age: MaxAge) -> Self {
        self.merge_max_age(max_age);
        self
    }
}
