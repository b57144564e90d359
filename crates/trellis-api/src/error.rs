use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the store, the services, the sync worker
/// and the local API adapters.
///
/// Adapters translate variants into their transport's native codes
/// (HTTP statuses, MQTT command responses); the sync worker classifies
/// them for backoff decisions. `Context` wraps another variant with a
/// human-readable message, building the message chain reported to
/// callers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unknown column '{column}'")]
    InvalidField { column: String },

    #[error("missing id field")]
    MissingId,

    #[error("invalid pagination: page {page}, page size {page_size}")]
    InvalidPagination { page: i64, page_size: i64 },

    #[error("uniqueness violation: {0}")]
    Uniqueness(String),

    #[error("operation timed out")]
    Timeout,

    #[error("transport is not connected")]
    NotConnected,

    #[error("invalid entity type: '{0}'")]
    InvalidEntityType(String),

    #[error("invalid sync action: '{0}'")]
    InvalidAction(String),

    #[error("foreign keys are disabled")]
    ForeignKeysDisabled,

    #[error("server is disabled")]
    ServerDisabled,

    #[error("name '{0}' is already taken")]
    NameAlreadyTaken(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Wraps the error with a contextual message, preserving the root
    /// variant for classification.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any `Context` layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout)
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self.root(), Error::NotConnected)
    }
}

/// Extension adding `.context(...)` to results carrying [`Error`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context(self, f: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_root() {
        let err = Error::not_found("item", "I1")
            .context("failed to update item")
            .context("failed to apply sync entry");
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "failed to apply sync entry: failed to update item: item 'I1' not found"
        );
    }

    #[test]
    fn test_classification_helpers() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::NotConnected.context("publish failed").is_not_connected());
        assert!(!Error::MissingId.is_not_found());
    }
}
