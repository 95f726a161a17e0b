//! # Core Error Types
//!
//! Centralized error definitions for the spammer.
//! All errors implement `std::error::Error` and `std::fmt::Display`.

use thiserror::Error;

/// Unified error type for core-logic operations.
///
/// Wraps the specific error kinds so callers that do not care about the
/// category can still match on a single type.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Config(ConfigError),

    #[error("Database error: {0}")]
    Database(DatabaseError),

    #[error(transparent)]
    Network(NetworkError),

    #[error(transparent)]
    Pow(PowError),
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<DatabaseError> for CoreError {
    fn from(e: DatabaseError) -> Self {
        CoreError::Database(e)
    }
}

impl From<NetworkError> for CoreError {
    fn from(e: NetworkError) -> Self {
        CoreError::Network(e)
    }
}

impl From<PowError> for CoreError {
    fn from(e: PowError) -> Self {
        CoreError::Pow(e)
    }
}

/// Configuration-related errors. All of these are fatal when a spammer is built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid node URL format: '{url}'")]
    InvalidNodeUrl { url: String },

    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("'{field}' is not valid trytes: '{value}'")]
    InvalidTrytes { field: String, value: String },

    #[error("Unknown tip selection strategy '{name}'")]
    UnknownStrategy { name: String },

    #[error("Unknown proof-of-work implementation '{name}' (available: {available})")]
    UnknownPow { name: String, available: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },

    #[error("Parse error in {path}: {msg}")]
    ParseError { path: String, msg: String },
}

/// Database operation errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Transaction failed: {msg}")]
    TransactionFailed { msg: String },

    #[error("Migration failed: {msg}")]
    MigrationFailed { msg: String },
}

/// Errors talking to a ledger node
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Request to {endpoint} timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64, endpoint: String },

    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("HTTP error {status_code} from {endpoint}: {body}")]
    HttpError {
        status_code: u16,
        endpoint: String,
        body: String,
    },

    #[error("Node {endpoint} rejected '{command}': {message}")]
    NodeError {
        endpoint: String,
        command: String,
        message: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

/// Proof-of-work (nonce search) errors. A failure aborts sealing of one bundle only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PowError {
    #[error("Transaction must be {expected} trytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Transaction contains characters outside the tryte alphabet")]
    InvalidTrytes,

    #[error("Minimum weight magnitude {mwm} is out of range (1..={max})")]
    InvalidMwm { mwm: u32, max: u32 },

    #[error("Nonce space exhausted without meeting weight magnitude {mwm}")]
    Exhausted { mwm: u32 },

    #[error("Nonce search aborted: {reason}")]
    Aborted { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_transparent() {
        let err: CoreError = ConfigError::UnknownStrategy {
            name: "fastest".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Unknown tip selection strategy 'fastest'");
    }

    #[test]
    fn test_database_error_prefix() {
        let err: CoreError = DatabaseError::TransactionFailed {
            msg: "locked".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "Database error: Transaction failed: locked");
    }
}
