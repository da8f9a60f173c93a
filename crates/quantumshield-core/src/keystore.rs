//! Client-side secure keystore.
//!
//! Long-lived secret keys rest encrypted under a key-encrypting key derived
//! from the user's password (PBKDF2-HMAC-SHA256, 600 000 iterations, 16-byte
//! salt, 256-bit output). The derivation parameters are part of the record
//! format and are validated on every read.
//!
//! The unlocked state is an owned session inside the [`Keystore`] handle, not
//! global state: the KEK lives in a zeroize-on-drop buffer, inactivity past
//! 30 minutes clears it together with the session mirror, and every
//! [`Keystore::get_secret_keys`] counts as activity and extends the deadline.
//!
//! The session mirror exists so an unlocked session survives a host reload.
//! Attacker model: anything able to read the mirror's backing storage (for a
//! browser host, tab-local XSS reading session storage) can recover the KEK.
//! That is inherent to reload survival without re-prompting the password.
//!
//! Record families, one set per user:
//! - `secrets_<username>`  — `{kdf, salt, iv, ciphertext}`; ciphertext is
//!   AES-256-GCM over the serialized secret keys, tag appended.
//! - `meta_salt_<username>` — `{salt}` for KEK re-derivation at unlock.
//! - `meta_pubkeys_<username>` — plaintext public keys. Integrity of these is
//!   an accepted gap: they are unsigned at rest.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, KeystoreError};
use crate::pqc::{KemPublicKey, KemSecretKey, SigPublicKey, SigSecretKey};
use crate::storage::KeyValueStore;

/// PBKDF2 iteration count. Fixed by the storage format.
pub const PBKDF2_ITERATIONS: u32 = 600_000;
/// Salt length in bytes. Fixed by the storage format.
pub const SALT_BYTES: usize = 16;
/// Derived KEK length in bytes (AES-256).
pub const KEK_BYTES: usize = 32;
/// Session inactivity timeout.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const KDF_ALGORITHM: &str = "PBKDF2-HMAC-SHA256";

fn b64_encode(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

fn b64_decode(s: &str) -> Result<Vec<u8>, KeystoreError> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
        .map_err(|e| KeystoreError::CorruptRecord(format!("invalid base64: {}", e)))
}

/// Key-derivation parameters embedded in every secrets record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub salt_len: usize,
    pub output_bits: usize,
}

impl KdfParams {
    fn current() -> Self {
        Self {
            algorithm: KDF_ALGORITHM.to_string(),
            iterations: PBKDF2_ITERATIONS,
            salt_len: SALT_BYTES,
            output_bits: KEK_BYTES * 8,
        }
    }

    fn check(&self) -> Result<(), KeystoreError> {
        if *self != Self::current() {
            return Err(KeystoreError::KdfParameterMismatch(format!(
                "stored {}/{} iterations",
                self.algorithm, self.iterations
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SecretsRecord {
    kdf: KdfParams,
    salt: String,
    iv: String,
    ciphertext: String,
}

#[derive(Serialize, Deserialize)]
struct SaltRecord {
    salt: String,
}

#[derive(Serialize, Deserialize)]
struct PubKeysRecord {
    kem_public: String,
    sig_public: String,
}

/// Plaintext layout inside the encrypted blob. Never persisted unencrypted.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct SecretKeysBlob {
    kem_secret: String,
    sig_secret: String,
}

/// Password-derived key-encrypting key. Scrubbed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct Kek([u8; KEK_BYTES]);

impl Kek {
    fn derive(password: &str, salt: &[u8]) -> Self {
        let mut out = [0u8; KEK_BYTES];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
        Self(out)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, KeystoreError> {
        let arr: [u8; KEK_BYTES] = bytes
            .try_into()
            .map_err(|_| KeystoreError::CorruptRecord("mirrored KEK has wrong length".to_string()))?;
        Ok(Self(arr))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

/// Mirrored session entry for reload survival. The KEK in here is sensitive.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MirrorEntry {
    pub username: String,
    pub kek: String,
    #[zeroize(skip)]
    pub saved_at: i64,
}

/// Session-scoped mirror storage. Cleared when the hosting session ends;
/// never durable across host termination.
pub trait SessionMirror: Send + Sync {
    fn save(&self, entry: &MirrorEntry) -> Result<(), KeystoreError>;
    fn load(&self) -> Result<Option<MirrorEntry>, KeystoreError>;
    fn clear(&self) -> Result<(), KeystoreError>;
}

/// In-memory mirror for tests and non-browser hosts.
#[derive(Default)]
pub struct MemoryMirror {
    entry: Mutex<Option<MirrorEntry>>,
}

impl MemoryMirror {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionMirror for MemoryMirror {
    fn save(&self, entry: &MirrorEntry) -> Result<(), KeystoreError> {
        let mut guard = self
            .entry
            .lock()
            .map_err(|_| KeystoreError::Storage("mirror lock poisoned".to_string()))?;
        *guard = Some(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<MirrorEntry>, KeystoreError> {
        let guard = self
            .entry
            .lock()
            .map_err(|_| KeystoreError::Storage("mirror lock poisoned".to_string()))?;
        Ok(guard.clone())
    }

    fn clear(&self) -> Result<(), KeystoreError> {
        let mut guard = self
            .entry
            .lock()
            .map_err(|_| KeystoreError::Storage("mirror lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }
}

struct Session {
    username: String,
    kek: Kek,
    last_activity: Instant,
}

/// Secret keys returned for the duration of a single crypto operation.
pub struct SecretKeys {
    pub kem_sk: KemSecretKey,
    pub sig_sk: SigSecretKey,
}

/// Public keys stored for local signing and display.
pub struct PublicKeys {
    pub kem_pk: KemPublicKey,
    pub sig_pk: SigPublicKey,
}

/// Key material handed over exactly once at registration or login.
pub struct KeyMaterial {
    pub kem_sk: KemSecretKey,
    pub sig_sk: SigSecretKey,
    pub kem_pk: KemPublicKey,
    pub sig_pk: SigPublicKey,
}

/// The client keystore handle. See the module docs for the storage format and
/// session semantics.
pub struct Keystore {
    store: Box<dyn KeyValueStore>,
    mirror: Box<dyn SessionMirror>,
    session: Mutex<Option<Session>>,
    timeout: Duration,
}

impl Keystore {
    pub fn new(store: Box<dyn KeyValueStore>, mirror: Box<dyn SessionMirror>) -> Self {
        Self::with_timeout(store, mirror, SESSION_TIMEOUT)
    }

    /// Like [`Keystore::new`] with a custom inactivity timeout. Test hook.
    pub fn with_timeout(
        store: Box<dyn KeyValueStore>,
        mirror: Box<dyn SessionMirror>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            mirror,
            session: Mutex::new(None),
            timeout,
        }
    }

    fn secrets_key(username: &str) -> String {
        format!("secrets_{username}")
    }

    fn salt_key(username: &str) -> String {
        format!("meta_salt_{username}")
    }

    fn pubkeys_key(username: &str) -> String {
        format!("meta_pubkeys_{username}")
    }

    /// Set up the keystore for a user: fresh salt, derived KEK, secret keys
    /// encrypted at rest, session started, mirror written.
    pub fn initialize(
        &self,
        username: &str,
        password: &str,
        keys: &KeyMaterial,
    ) -> Result<(), KeystoreError> {
        let mut salt = [0u8; SALT_BYTES];
        rand::thread_rng().fill_bytes(&mut salt);
        let kek = Kek::derive(password, &salt);

        let blob = SecretKeysBlob {
            kem_secret: keys.kem_sk.to_base64().to_string(),
            sig_secret: keys.sig_sk.to_base64().to_string(),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&blob)
                .map_err(|e| KeystoreError::Storage(format!("serialize blob: {}", e)))?,
        );

        let mut iv = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = kek
            .cipher()
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let secrets = SecretsRecord {
            kdf: KdfParams::current(),
            salt: b64_encode(&salt),
            iv: b64_encode(&iv),
            ciphertext: b64_encode(&ciphertext),
        };
        self.put_record(&Self::secrets_key(username), &secrets)?;
        self.put_record(
            &Self::salt_key(username),
            &SaltRecord {
                salt: b64_encode(&salt),
            },
        )?;
        self.put_record(
            &Self::pubkeys_key(username),
            &PubKeysRecord {
                kem_public: keys.kem_pk.to_base64(),
                sig_public: keys.sig_pk.to_base64(),
            },
        )?;

        self.start_session(username.to_string(), kek)?;
        tracing::info!(user = %username, "keystore initialized");
        Ok(())
    }

    /// Re-derive the KEK from the stored salt and validate it by decrypting
    /// the at-rest blob. A wrong password fails without touching any record.
    pub fn unlock(&self, username: &str, password: &str) -> Result<(), KeystoreError> {
        let salt_record: SaltRecord = self
            .get_record(&Self::salt_key(username))?
            .ok_or(KeystoreError::NoSuchUser)?;
        let salt = b64_decode(&salt_record.salt)?;
        let kek = Kek::derive(password, &salt);

        // Validation is a full decrypt of the secrets record.
        self.decrypt_blob(username, &kek)
            .map_err(|_| KeystoreError::UnlockFailed)?;

        self.start_session(username.to_string(), kek)?;
        tracing::debug!(user = %username, "keystore unlocked");
        Ok(())
    }

    /// Decrypted secret keys for one crypto operation.
    ///
    /// Counts as activity. If the in-memory session is gone, restoration from
    /// the session mirror is attempted before failing with
    /// [`KeystoreError::SessionNotInitialized`].
    pub fn get_secret_keys(&self) -> Result<SecretKeys, KeystoreError> {
        let mut guard = self.lock_session()?;
        self.expire_if_idle(&mut guard)?;

        if guard.is_none() {
            *guard = self.restore_from_mirror()?;
        }
        let session = guard.as_mut().ok_or(KeystoreError::SessionNotInitialized)?;

        session.last_activity = Instant::now();
        self.mirror.save(&MirrorEntry {
            username: session.username.clone(),
            kek: b64_encode(&session.kek.0),
            saved_at: chrono::Utc::now().timestamp(),
        })?;

        self.decrypt_blob(&session.username, &session.kek)
    }

    /// Stored public keys for `username`.
    pub fn get_public_keys(&self, username: &str) -> Result<PublicKeys, KeystoreError> {
        let record: PubKeysRecord = self
            .get_record(&Self::pubkeys_key(username))?
            .ok_or(KeystoreError::NoSuchUser)?;
        Ok(PublicKeys {
            kem_pk: KemPublicKey::from_base64(&record.kem_public)?,
            sig_pk: SigPublicKey::from_base64(&record.sig_public)?,
        })
    }

    /// Drop the in-memory KEK and wipe the mirror. Idempotent.
    pub fn clear_session(&self) -> Result<(), KeystoreError> {
        let mut guard = self.lock_session()?;
        *guard = None;
        self.mirror.clear()
    }

    /// Whether an unexpired session is currently held in memory.
    pub fn is_unlocked(&self) -> bool {
        let Ok(mut guard) = self.lock_session() else {
            return false;
        };
        let _ = self.expire_if_idle(&mut guard);
        guard.is_some()
    }

    fn lock_session(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Option<Session>>, KeystoreError> {
        self.session
            .lock()
            .map_err(|_| KeystoreError::Storage("session lock poisoned".to_string()))
    }

    /// Expiry clears the KEK and the mirror together.
    fn expire_if_idle(
        &self,
        guard: &mut Option<Session>,
    ) -> Result<(), KeystoreError> {
        if let Some(session) = guard.as_ref() {
            if session.last_activity.elapsed() > self.timeout {
                tracing::debug!(user = %session.username, "session expired after inactivity");
                *guard = None;
                self.mirror.clear()?;
            }
        }
        Ok(())
    }

    fn start_session(&self, username: String, kek: Kek) -> Result<(), KeystoreError> {
        self.mirror.save(&MirrorEntry {
            username: username.clone(),
            kek: b64_encode(&kek.0),
            saved_at: chrono::Utc::now().timestamp(),
        })?;
        let mut guard = self.lock_session()?;
        *guard = Some(Session {
            username,
            kek,
            last_activity: Instant::now(),
        });
        Ok(())
    }

    fn restore_from_mirror(&self) -> Result<Option<Session>, KeystoreError> {
        let Some(entry) = self.mirror.load()? else {
            return Ok(None);
        };

        let age = chrono::Utc::now().timestamp() - entry.saved_at;
        if age < 0 || age as u64 > self.timeout.as_secs() {
            self.mirror.clear()?;
            return Ok(None);
        }
        // The mirrored identity must still have keystore records.
        if self.store.get(&Self::secrets_key(&entry.username))?.is_none() {
            self.mirror.clear()?;
            return Ok(None);
        }

        let kek = Kek::from_bytes(&b64_decode(&entry.kek)?)?;
        tracing::debug!(user = %entry.username, "session restored from mirror");
        Ok(Some(Session {
            username: entry.username.clone(),
            kek,
            last_activity: Instant::now(),
        }))
    }

    fn decrypt_blob(&self, username: &str, kek: &Kek) -> Result<SecretKeys, KeystoreError> {
        let record: SecretsRecord = self
            .get_record(&Self::secrets_key(username))?
            .ok_or(KeystoreError::NoSuchUser)?;
        record.kdf.check()?;

        let iv = b64_decode(&record.iv)?;
        let ciphertext = b64_decode(&record.ciphertext)?;
        if iv.len() != 12 {
            return Err(KeystoreError::CorruptRecord("iv length".to_string()));
        }

        let plaintext = Zeroizing::new(
            kek.cipher()
                .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
                .map_err(|_| CryptoError::DecryptionFailed)?,
        );
        let blob: SecretKeysBlob = serde_json::from_slice(&plaintext)
            .map_err(|_| KeystoreError::CorruptRecord("secret blob layout".to_string()))?;

        Ok(SecretKeys {
            kem_sk: KemSecretKey::from_base64(&blob.kem_secret)?,
            sig_sk: SigSecretKey::from_base64(&blob.sig_secret)?,
        })
    }

    fn get_record<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, KeystoreError> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KeystoreError::CorruptRecord(format!("{key}: {e}")))
    }

    fn put_record<T: Serialize>(&self, key: &str, value: &T) -> Result<(), KeystoreError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| KeystoreError::Storage(format!("serialize {key}: {e}")))?;
        self.store.put(key, &raw)
    }
}
