//! QuantumShield cryptographic core.
//!
//! End-to-end encryption building blocks for ephemeral one-to-one messaging:
//!
//! - [`pqc`] — ML-KEM-1024 key encapsulation and Falcon-1024 signatures
//! - [`envelope`] — the per-message KEM + AEAD + signature bundle and its
//!   canonical signing payload
//! - [`keystore`] — password-derived KEK, encrypted-at-rest secret keys, and
//!   the session lifecycle
//! - [`queue`] — optional client-side offline queue for sealed envelopes
//!
//! The relay server lives in the sibling `quantumshield-relay` crate and
//! consumes [`envelope::WireEnvelope`] and the [`pqc`] verification path.

pub mod envelope;
pub mod error;
pub mod keystore;
pub mod pqc;
pub mod queue;
pub mod storage;

pub use envelope::{
    canonical_payload, open, open_file, seal, seal_file, Envelope, FileEnvelope, FileMetadata,
    WireEnvelope, IV_BYTES, MAX_FILE_BYTES, MAX_PLAINTEXT_BYTES, TAG_BYTES,
};
pub use error::{CryptoError, KeystoreError};
pub use keystore::{KeyMaterial, Keystore, PublicKeys, SecretKeys};
pub use pqc::{
    kem_decapsulate, kem_encapsulate, kem_keygen, sig_keygen, sign, verify, KemCiphertext,
    KemPublicKey, KemSecretKey, SigPublicKey, SigSecretKey, Signature,
};
