//! Error types for Strata
//!
//! One error enum is shared by the codec, the field-group algebra and every
//! storage backend. Absent keys and fields are never errors.

use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
#[derive(Debug, Error)]
pub enum Error {
    // Encoding errors
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid field group: {fields} fields but {values} values")]
    InvalidFieldGroup { fields: usize, values: usize },

    #[error("unknown codec identifier: {0}")]
    UnknownCodec(u8),

    // Request shape errors
    #[error("key, value lengths do not match: {keys} keys, {deltas} deltas")]
    LengthMismatch { keys: usize, deltas: usize },

    #[error("item {index} failed: {source}")]
    Item {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    // Engine errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op} failed for {keys} keys: {source}")]
    Engine {
        op: &'static str,
        keys: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("store is closed")]
    Closed,

    // Programmer / configuration errors
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("teardown is only available in test builds")]
    TeardownForbidden,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Attach the failing item index to an error
    #[must_use]
    pub fn at_item(self, index: usize) -> Self {
        Self::Item {
            index,
            source: Box::new(self),
        }
    }

    /// Annotate an engine error with the operation and the number of keys involved
    #[must_use]
    pub fn during(self, op: &'static str, keys: usize) -> Self {
        Self::Engine {
            op,
            keys,
            source: Box::new(self),
        }
    }

    /// Check if this error came from malformed input rather than the engine
    #[must_use]
    pub fn is_encoding(&self) -> bool {
        match self {
            Self::BufferTooSmall { .. }
            | Self::Decode(_)
            | Self::InvalidFieldGroup { .. }
            | Self::UnknownCodec(_) => true,
            Self::Item { source, .. } | Self::Engine { source, .. } => source.is_encoding(),
            _ => false,
        }
    }

    /// Check if this is a caller misuse that correct code never triggers
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::LengthMismatch { .. } | Self::TeardownForbidden | Self::Closed
        )
    }
}
