//! Credential and login error types.

use thiserror::Error;

/// Credential store errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for credential operations.
pub type CredentialResult<T> = std::result::Result<T, CredentialError>;

/// Interactive login errors.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("failed to start login bridge: {0}")]
    Spawn(std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{input} is not accepted while {state}")]
    InvalidInput { state: String, input: String },

    #[error("login flow has ended")]
    Closed,

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Result type for login operations.
pub type LoginResult<T> = std::result::Result<T, LoginError>;
