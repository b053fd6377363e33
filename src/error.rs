//! Error types for the outreach engine.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Client registration errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Client needs an email address or a chat identity")]
    MissingIdentity,

    #[error("Client field {0} must not be empty")]
    MissingField(&'static str),

    #[error("Client needs at least one product of interest")]
    EmptyProducts,

    #[error("A client with {channel} identity {identity} already exists")]
    DuplicateIdentity { channel: String, identity: String },

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Classification gateway errors.
///
/// These never leave the gateway boundary: the drain loop only sees
/// `ClassificationResult`s, failures included.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Classification timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Unparsable classifier output: {0}")]
    Parse(String),
}

/// Attachment store errors. A missing file is not an error.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Invalid attachment reference: {0}")]
    InvalidReference(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
