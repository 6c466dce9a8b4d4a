//! Error types for Veilroom

use thiserror::Error;

/// Main error type for Veilroom protocol operations
#[derive(Error, Debug)]
pub enum RoomError {
    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Identity-related error (keys, key exchange)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Shared log transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation requires being the room host
    #[error("Not the host: {0}")]
    NotHost(String),

    /// Operation requires a live, connected session
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Referenced peer is not in the room
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type alias using RoomError
pub type RoomResult<T> = Result<T, RoomError>;
