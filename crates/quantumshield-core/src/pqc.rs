//! Post-quantum primitive adapters.
//!
//! Implements NIST post-quantum standards:
//! - ML-KEM-1024 for key encapsulation (RustCrypto `ml-kem` crate)
//! - Falcon-1024 for digital signatures (`pqcrypto-falcon`)
//!
//! Keys, ciphertexts, and signatures cross this boundary as validated opaque
//! byte strings; the underlying library objects are reconstructed per call and
//! dropped immediately after (pqcrypto secret keys zeroize on drop). Both
//! implementations are constant-time with respect to secret key bits, and
//! ML-KEM decapsulation uses implicit rejection: a syntactically valid but
//! corrupted ciphertext yields a pseudorandom shared secret rather than an
//! observable failure.

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem1024};
use pqcrypto_falcon::falcon1024;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Type aliases for ML-KEM-1024 (NIST Security Level 5)
type MlKemDecapsulationKey = <MlKem1024 as KemCore>::DecapsulationKey;
type MlKemEncapsulationKey = <MlKem1024 as KemCore>::EncapsulationKey;

/// ML-KEM-1024 encapsulation (public) key size in bytes
pub const KEM_PUBLIC_KEY_BYTES: usize = 1568;
/// ML-KEM-1024 decapsulation (secret) key size in bytes
pub const KEM_SECRET_KEY_BYTES: usize = 3168;
/// ML-KEM-1024 ciphertext size in bytes
pub const KEM_CIPHERTEXT_BYTES: usize = 1568;
/// Shared secret size in bytes
pub const SHARED_SECRET_BYTES: usize = 32;
/// Falcon-1024 public key size in bytes
pub const SIG_PUBLIC_KEY_BYTES: usize = 1793;
/// Falcon-1024 secret key size in bytes
pub const SIG_SECRET_KEY_BYTES: usize = 2305;
/// Maximum Falcon-1024 detached signature size in bytes (signatures are variable length)
pub const SIG_MAX_BYTES: usize = 1280;

/// A 32-byte KEM shared secret, zeroized on drop.
pub type SharedSecret = Zeroizing<[u8; SHARED_SECRET_BYTES]>;

fn b64_encode(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
        .map_err(|e| CryptoError::EncodingError(format!("invalid base64: {}", e)))
}

macro_rules! public_bytes_type {
    ($(#[$doc:meta])* $name:ident, $len:expr, $what:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name(Vec<u8>);

        impl $name {
            /// Import from raw bytes, validating the exact length.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
                if bytes.len() != $len {
                    return Err(CryptoError::InvalidKeyFormat(format!(
                        "{}: expected {} bytes, got {}",
                        $what,
                        $len,
                        bytes.len()
                    )));
                }
                Ok(Self(bytes.to_vec()))
            }

            /// Import from a base64 string (standard alphabet).
            pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
                Self::from_bytes(&b64_decode(s)?)
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            #[must_use]
            pub fn to_base64(&self) -> String {
                b64_encode(&self.0)
            }
        }
    };
}

public_bytes_type!(
    /// ML-KEM-1024 encapsulation key (1568 bytes).
    KemPublicKey,
    KEM_PUBLIC_KEY_BYTES,
    "ML-KEM public key"
);

public_bytes_type!(
    /// ML-KEM-1024 ciphertext (1568 bytes).
    KemCiphertext,
    KEM_CIPHERTEXT_BYTES,
    "ML-KEM ciphertext"
);

public_bytes_type!(
    /// Falcon-1024 public key (1793 bytes).
    SigPublicKey,
    SIG_PUBLIC_KEY_BYTES,
    "Falcon public key"
);

/// ML-KEM-1024 decapsulation key (3168 bytes). Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KemSecretKey(Vec<u8>);

/// Falcon-1024 secret key (2305 bytes). Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigSecretKey(Vec<u8>);

macro_rules! secret_key_impl {
    ($name:ident, $len:expr, $what:expr) => {
        impl $name {
            /// Import from raw bytes, validating the exact length.
            pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
                if bytes.len() != $len {
                    return Err(CryptoError::InvalidKeyFormat(format!(
                        "{}: expected {} bytes, got {}",
                        $what,
                        $len,
                        bytes.len()
                    )));
                }
                Ok(Self(bytes.to_vec()))
            }

            pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
                Self::from_bytes(&b64_decode(s)?)
            }

            /// Raw key bytes. SENSITIVE: only for keystore sealing.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Base64 export for keystore sealing, wrapped so the copy is scrubbed.
            #[must_use]
            pub fn to_base64(&self) -> Zeroizing<String> {
                Zeroizing::new(b64_encode(&self.0))
            }
        }
    };
}

secret_key_impl!(KemSecretKey, KEM_SECRET_KEY_BYTES, "ML-KEM secret key");
secret_key_impl!(SigSecretKey, SIG_SECRET_KEY_BYTES, "Falcon secret key");

/// Falcon-1024 detached signature (variable length, at most 1280 bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.is_empty() || bytes.len() > SIG_MAX_BYTES {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&b64_decode(s)?)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_base64(&self) -> String {
        b64_encode(&self.0)
    }
}

/// Generate an ML-KEM-1024 keypair.
#[must_use]
pub fn kem_keygen() -> (KemPublicKey, KemSecretKey) {
    let mut rng = rand::thread_rng();
    let (dk, ek) = MlKem1024::generate(&mut rng);
    let pk = KemPublicKey(AsRef::<[u8]>::as_ref(&ek.as_bytes()).to_vec());
    let sk = KemSecretKey(AsRef::<[u8]>::as_ref(&dk.as_bytes()).to_vec());
    (pk, sk)
}

/// Encapsulate a fresh shared secret to the recipient's public key.
///
/// Returns the 1568-byte ciphertext and the 32-byte shared secret.
pub fn kem_encapsulate(pk: &KemPublicKey) -> Result<(KemCiphertext, SharedSecret), CryptoError> {
    let encoded: Encoded<MlKemEncapsulationKey> = pk
        .as_bytes()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyFormat("ML-KEM public key".to_string()))?;
    let ek = MlKemEncapsulationKey::from_bytes(&encoded);

    let mut rng = rand::thread_rng();
    let (ct, ss) = ek
        .encapsulate(&mut rng)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut secret = Zeroizing::new([0u8; SHARED_SECRET_BYTES]);
    secret.copy_from_slice(AsRef::<[u8]>::as_ref(&ss));
    Ok((
        KemCiphertext(AsRef::<[u8]>::as_ref(&ct).to_vec()),
        secret,
    ))
}

/// Recover the shared secret from a KEM ciphertext.
///
/// A corrupted but well-formed ciphertext does not error here: ML-KEM's
/// implicit rejection yields a pseudorandom secret and the subsequent AEAD
/// open fails instead. Only malformed inputs are reported.
pub fn kem_decapsulate(
    ct: &KemCiphertext,
    sk: &KemSecretKey,
) -> Result<SharedSecret, CryptoError> {
    let encoded: Encoded<MlKemDecapsulationKey> = sk
        .as_bytes()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyFormat("ML-KEM secret key".to_string()))?;
    let dk = MlKemDecapsulationKey::from_bytes(&encoded);

    let ct_arr: Ciphertext<MlKem1024> = ct
        .as_bytes()
        .try_into()
        .map_err(|_| CryptoError::InvalidCiphertext("failed to parse ciphertext bytes".to_string()))?;

    let ss = dk
        .decapsulate(&ct_arr)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let mut secret = Zeroizing::new([0u8; SHARED_SECRET_BYTES]);
    secret.copy_from_slice(AsRef::<[u8]>::as_ref(&ss));
    Ok(secret)
}

/// Generate a Falcon-1024 keypair.
///
/// Uses the OS random number generator (via pqcrypto-falcon).
#[must_use]
pub fn sig_keygen() -> (SigPublicKey, SigSecretKey) {
    let (pk, sk) = falcon1024::keypair();
    (
        SigPublicKey(pk.as_bytes().to_vec()),
        SigSecretKey(sk.as_bytes().to_vec()),
    )
}

/// Sign a message with Falcon-1024, producing a detached signature.
///
/// Falcon signing is randomized: signing the same message twice produces
/// different signatures, all of which verify.
pub fn sign(message: &[u8], sk: &SigSecretKey) -> Result<Signature, CryptoError> {
    let sk = falcon1024::SecretKey::from_bytes(sk.as_bytes())
        .map_err(|_| CryptoError::InvalidKeyFormat("Falcon secret key".to_string()))?;
    let sig = falcon1024::detached_sign(message, &sk);
    Ok(Signature(sig.as_bytes().to_vec()))
}

/// Verify a detached Falcon-1024 signature.
///
/// Returns `false` on any failure, including malformed keys or signatures.
/// No error detail crosses this boundary.
#[must_use]
pub fn verify(message: &[u8], signature: &Signature, pk: &SigPublicKey) -> bool {
    let Ok(pk) = falcon1024::PublicKey::from_bytes(pk.as_bytes()) else {
        return false;
    };
    let Ok(sig) = falcon1024::DetachedSignature::from_bytes(signature.as_bytes()) else {
        return false;
    };
    falcon1024::verify_detached_signature(&sig, message, &pk).is_ok()
}
