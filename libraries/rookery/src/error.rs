use crate::EntityId;

/// A payload failed the schema check at the store boundary. The offending
/// write is dropped; stale or absent data is preferred over corrupt data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("expected a JSON object, got {found}")]
    NotAnObject { found: &'static str },
    #[error("missing or empty id field")]
    InvalidId,
    #[error("schema check failed: {0}")]
    Schema(String),
}

/// Why a read failed. Cloneable because joined callers all observe the same
/// failure from the shared in-flight future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// 401/403. Surfaced as a flag rather than thrown, so callers can
    /// redirect to login without a try/catch at every call site.
    #[error("unauthorized")]
    Unauthorized,
    #[error("network error: {0}")]
    Network(String),
    /// Requested in a batch but absent from the batch response.
    #[error("entity missing from batch response")]
    MissingFromBatch,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Why a mutation failed. Unlike fetch errors these are re-thrown to the
/// caller after rollback, since the caller chose to mutate and needs to know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    /// The server rejected the mutation; the speculative state was rolled back.
    #[error("server rejected the mutation: {0}")]
    Conflict(String),
    #[error("network error: {0}")]
    Network(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// A transaction tried to patch an entity that isn't in the store.
    /// Programmer error; the whole transaction is abandoned.
    #[error("no entity {kind}/{id} to patch")]
    MissingEntity { kind: String, id: EntityId },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("streaming transport error: {0}")]
    Transport(String),
    #[error("streaming transport is not connected")]
    NotConnected,
}
