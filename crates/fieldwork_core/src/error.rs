//! Error taxonomy shared by every resolution layer.
//!
//! All errors are `Clone`: a failed [`Deferred`](crate::Deferred) hands the
//! same error to every waiter.

use thiserror::Error;

/// A configuration mistake: surfaced synchronously and never cached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No producer is registered under the id.
    #[error("unknown data producer '{0}'")]
    UnknownProducer(String),

    /// A producer with the same id is already registered.
    #[error("data producer '{0}' is already registered")]
    DuplicateProducer(String),

    /// A mapping targets a slot the producer does not consume.
    #[error("data producer '{producer}' has no input slot named '{slot}'")]
    UndeclaredSlot { producer: String, slot: String },

    /// A required slot has no mapping.
    #[error("data producer '{producer}' requires input slot '{slot}'")]
    MissingSlot { producer: String, slot: String },

    /// A mapping is not a valid resolver expression.
    #[error("invalid input mapper for slot '{slot}': {message}")]
    InvalidMapping { slot: String, message: String },

    /// The producer rejected its configuration.
    #[error("invalid configuration for data producer '{producer}': {message}")]
    InvalidConfig { producer: String, message: String },
}

/// A bulk fetch failure, reported identically to every item of the group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The bulk fetch itself failed.
    #[error("bulk load for buffer group {group} failed: {message}")]
    Load { group: String, message: String },

    /// The loader did not return one result per submitted item.
    #[error("bulk load for buffer group {group} returned {actual} results for {expected} items")]
    Cardinality {
        group: String,
        expected: usize,
        actual: usize,
    },
}

/// Failure of a single field resolution.
#[derive(Error, Debug, Clone)]
pub enum ResolveError {
    /// Invalid mapping or unresolvable producer id.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An input slot failed upstream.
    #[error("input '{slot}' failed: {source}")]
    Slot {
        slot: String,
        #[source]
        source: Box<ResolveError>,
    },

    /// The cache key could not be computed.
    #[error("failed to compute cache key for data producer '{producer}': {message}")]
    CacheKey { producer: String, message: String },

    /// The producer itself failed.
    #[error("data producer '{producer}' failed: {message}")]
    Producer { producer: String, message: String },

    /// A buffered bulk load failed.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// A field argument was missing or malformed.
    #[error("invalid argument '{name}': {message}")]
    Argument { name: String, message: String },
}

impl ResolveError {
    /// Creates a producer failure.
    pub fn producer(producer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Producer {
            producer: producer.into(),
            message: message.into(),
        }
    }

    /// Creates a cache key failure.
    pub fn cache_key(producer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CacheKey {
            producer: producer.into(),
            message: message.into(),
        }
    }

    /// Wraps an upstream failure of an input slot.
    pub fn slot(slot: impl Into<String>, source: ResolveError) -> Self {
        Self::Slot {
            slot: slot.into(),
            source: Box::new(source),
        }
    }

    /// Returns the innermost error, skipping slot wrappers.
    pub fn root_cause(&self) -> &ResolveError {
        match self {
            Self::Slot { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the GraphQL error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Slot { source, .. } => source.code(),
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::CacheKey { .. } => "CACHE_KEY_ERROR",
            Self::Producer { .. } => "PRODUCER_ERROR",
            Self::Buffer(_) => "BUFFER_ERROR",
            Self::Argument { .. } => "ARGUMENT_ERROR",
        }
    }

    /// Returns true if this is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self.root_cause(), Self::Config(_))
    }
}

/// Result type for resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;
