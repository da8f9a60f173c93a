//! Error types for the cryptographic core and the client keystore.

use thiserror::Error;

/// Errors produced by the primitive layer and the envelope codec.
///
/// Receive-side failures deliberately collapse into [`CryptoError::DecryptionFailed`]:
/// callers must not be able to distinguish a bad signature from a KEM or AEAD
/// failure once an envelope has been handed to `open`.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Invalid signature encoding")]
    InvalidSignature,

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("Payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Incomplete envelope: {0} is empty")]
    IncompleteEnvelope(&'static str),
}

/// Errors produced by the client keystore.
#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Session not initialized")]
    SessionNotInitialized,

    #[error("Unlock failed")]
    UnlockFailed,

    #[error("No keystore record for user")]
    NoSuchUser,

    #[error("Stored key-derivation parameters do not match this build: {0}")]
    KdfParameterMismatch(String),

    #[error("Corrupt keystore record: {0}")]
    CorruptRecord(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
