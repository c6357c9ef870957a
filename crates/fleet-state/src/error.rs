//! Error types for the entity model and the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

/// Malformed or mismatched entity data.
///
/// Raised when a required metadata field is absent. Discovery data that
/// is missing a field the engine needs must surface, never default.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("{entity}: required metadata field '{field}' is missing")]
    MissingField { entity: String, field: &'static str },

    #[error("{entity}: expected a {expected} entity")]
    WrongType { entity: String, expected: &'static str },

    #[error("pairing broken: {0}")]
    Pairing(String),
}
