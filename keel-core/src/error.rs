//! Error types for KEEL operations

use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: Uuid },

    #[error("Insert failed for {entity_type}: {reason}")]
    InsertFailed { entity_type: String, reason: String },

    #[error("Update failed for {entity_type} with id {id}: {reason}")]
    UpdateFailed {
        entity_type: String,
        id: Uuid,
        reason: String,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed for {entity_type}: {reason}")]
    Serialization { entity_type: String, reason: String },

    #[error("Unknown navigation {navigation} on {entity_type}")]
    UnknownNavigation {
        entity_type: String,
        navigation: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors. Raised before any I/O takes place.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Session state errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Entity must be attached to the session: {entity_type} with id {id} is detached")]
    EntityDetached { entity_type: String, id: Uuid },

    #[error("Repository registered for {entity_type} has an unexpected type")]
    RepositoryTypeMismatch { entity_type: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all KEEL errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KeelError {
    /// Shorthand for a serde failure while moving an entity across the storage boundary.
    pub fn serialization(entity_type: impl Into<String>, err: serde_json::Error) -> Self {
        KeelError::Storage(StorageError::Serialization {
            entity_type: entity_type.into(),
            reason: err.to_string(),
        })
    }
}

/// Result type alias for KEEL operations.
pub type KeelResult<T> = Result<T, KeelError>;

// =============================================================================
// TESTS
// =============================================================================
