//! Error types for the Provenant engine core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, the audit store, and serialization. Interception
//! paths are fail-open and log instead of returning these; the variants here
//! surface only through the startup, query, and export APIs.

use std::path::PathBuf;

/// Top-level error type for the Provenant core library.
#[derive(Debug, thiserror::Error)]
pub enum ProvenantError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audit store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the configuration system. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the SQLite-backed audit store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open audit store at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Audit store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Failed to decode stored record: {message}")]
    Decode { message: String },
}

/// A type alias for results using the top-level `ProvenantError`.
pub type Result<T> = std::result::Result<T, ProvenantError>;
