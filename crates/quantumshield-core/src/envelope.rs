//! Envelope codec: the per-message KEM + AEAD + signature bundle.
//!
//! A sealed envelope is `(kem_ct, iv, ciphertext, tag, sig)` where the KEM
//! shared secret is used directly as the AES-256-GCM key and the signature
//! covers the canonical signing payload — the byte-exact JSON
//! `{"c":"<b64 ciphertext>","i":"<b64 iv>","t":"<b64 tag>"}` with keys in
//! that order and no whitespace. The canonicalization is load-bearing for
//! cross-runtime compatibility; any change is a wire break. The KEM
//! ciphertext is intentionally outside the signed payload: the current wire
//! format must be matched bit-exactly.
//!
//! The receive path verifies the signature over the reconstructed payload
//! BEFORE any decapsulation attempt, and every receive-side failure collapses
//! into a single generic outcome.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::pqc::{
    self, KemCiphertext, KemPublicKey, KemSecretKey, Signature, SigPublicKey, SigSecretKey,
    KEM_CIPHERTEXT_BYTES, SIG_MAX_BYTES,
};

/// AES-256-GCM nonce size in bytes
pub const IV_BYTES: usize = 12;
/// AES-256-GCM authentication tag size in bytes (128-bit tags)
pub const TAG_BYTES: usize = 16;
/// Maximum plaintext a message envelope may carry
pub const MAX_PLAINTEXT_BYTES: usize = 10 * 1024 * 1024;
/// Maximum raw file size a file envelope may carry
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

fn b64_encode(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

fn b64_decode(s: &str) -> Result<Vec<u8>, CryptoError> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
        .map_err(|e| CryptoError::EncodingError(format!("invalid base64: {}", e)))
}

/// Exact decoded size of a standard-alphabet base64 string, without decoding.
///
/// Lets the relay bound payloads cheaply; malformed input is caught later by
/// the real decoder, so a best-effort figure for odd lengths is acceptable.
#[must_use]
pub fn base64_decoded_len(s: &str) -> usize {
    if s.is_empty() {
        return 0;
    }
    let padding = s.bytes().rev().take_while(|&b| b == b'=').count();
    (s.len() / 4) * 3 - padding.min(2)
}

/// Build the canonical signing payload from already-encoded wire fields.
///
/// Byte-exact: keys `c`, `i`, `t` in that order, no whitespace. Both sides of
/// the protocol — and the relay, which reconstructs it rather than trusting
/// any client-supplied string — must produce identical bytes.
#[must_use]
pub fn canonical_payload(ciphertext_b64: &str, iv_b64: &str, tag_b64: &str) -> Vec<u8> {
    format!(
        "{{\"c\":\"{}\",\"i\":\"{}\",\"t\":\"{}\"}}",
        ciphertext_b64, iv_b64, tag_b64
    )
    .into_bytes()
}

/// The full cryptographic record sent per message.
///
/// All fields are required; partial envelopes are unrepresentable. Construct
/// through [`seal`] or [`WireEnvelope::decode`].
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kem_ct: KemCiphertext,
    pub iv: [u8; IV_BYTES],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_BYTES],
    pub sig: Signature,
}

impl Envelope {
    /// Canonical signing payload for this envelope, re-derived from its fields.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        canonical_payload(
            &b64_encode(&self.ciphertext),
            &b64_encode(&self.iv),
            &b64_encode(&self.tag),
        )
    }
}

/// File metadata travelling alongside a file envelope.
///
/// NOT covered by the signature; treat as untrusted display hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
}

/// A sealed file transfer: the same construction as a message envelope with
/// plaintext = base64(file bytes), plus unauthenticated metadata.
#[derive(Debug, Clone)]
pub struct FileEnvelope {
    pub envelope: Envelope,
    pub metadata: FileMetadata,
}

fn seal_bytes(
    plaintext: &[u8],
    recipient_kem_pk: &KemPublicKey,
    sender_sig_sk: &SigSecretKey,
) -> Result<Envelope, CryptoError> {
    let (kem_ct, shared_secret) = pqc::kem_encapsulate(recipient_kem_pk)?;

    let mut iv = [0u8; IV_BYTES];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(shared_secret.as_ref()));
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buf)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut tag_arr = [0u8; TAG_BYTES];
    tag_arr.copy_from_slice(&tag);

    let payload = canonical_payload(&b64_encode(&buf), &b64_encode(&iv), &b64_encode(&tag_arr));
    let sig = pqc::sign(&payload, sender_sig_sk)?;

    Ok(Envelope {
        kem_ct,
        iv,
        ciphertext: buf,
        tag: tag_arr,
        sig,
    })
}

/// Seal a message envelope for the recipient, signed by the sender.
pub fn seal(
    plaintext: &[u8],
    recipient_kem_pk: &KemPublicKey,
    sender_sig_sk: &SigSecretKey,
) -> Result<Envelope, CryptoError> {
    if plaintext.len() > MAX_PLAINTEXT_BYTES {
        return Err(CryptoError::PayloadTooLarge {
            size: plaintext.len(),
            limit: MAX_PLAINTEXT_BYTES,
        });
    }
    seal_bytes(plaintext, recipient_kem_pk, sender_sig_sk)
}

/// Open a message envelope.
///
/// Pipeline order is fixed: signature over the reconstructed canonical
/// payload first (fail-closed, no decapsulation oracle on malformed
/// ciphertexts), then decapsulation, then AEAD. Every failure maps to the
/// same generic [`CryptoError::DecryptionFailed`].
pub fn open(
    envelope: &Envelope,
    recipient_kem_sk: &KemSecretKey,
    sender_sig_pk: &SigPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let payload = envelope.signing_payload();
    if !pqc::verify(&payload, &envelope.sig, sender_sig_pk) {
        return Err(CryptoError::DecryptionFailed);
    }

    let shared_secret = pqc::kem_decapsulate(&envelope.kem_ct, recipient_kem_sk)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(shared_secret.as_ref()));
    let mut buf = envelope.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&envelope.iv),
            b"",
            &mut buf,
            Tag::from_slice(&envelope.tag),
        )
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(buf)
}

/// Seal a file envelope. The AEAD plaintext is `base64(file_bytes)`.
pub fn seal_file(
    file_bytes: &[u8],
    file_name: &str,
    file_type: &str,
    recipient_kem_pk: &KemPublicKey,
    sender_sig_sk: &SigSecretKey,
) -> Result<FileEnvelope, CryptoError> {
    if file_bytes.len() > MAX_FILE_BYTES {
        return Err(CryptoError::PayloadTooLarge {
            size: file_bytes.len(),
            limit: MAX_FILE_BYTES,
        });
    }
    let encoded = b64_encode(file_bytes);
    let envelope = seal_bytes(encoded.as_bytes(), recipient_kem_pk, sender_sig_sk)?;
    Ok(FileEnvelope {
        envelope,
        metadata: FileMetadata {
            file_name: file_name.to_string(),
            file_size: file_bytes.len() as u64,
            file_type: file_type.to_string(),
        },
    })
}

/// Open a file envelope, returning the raw file bytes.
pub fn open_file(
    file_envelope: &FileEnvelope,
    recipient_kem_sk: &KemSecretKey,
    sender_sig_pk: &SigPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    let inner = open(&file_envelope.envelope, recipient_kem_sk, sender_sig_pk)?;
    let text = std::str::from_utf8(&inner).map_err(|_| CryptoError::DecryptionFailed)?;
    b64_decode(text).map_err(|_| CryptoError::DecryptionFailed)
}

/// Wire form of an envelope: all fields base64, names fixed by the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub kem_ciphertext: String,
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
    pub signature: String,
}

impl WireEnvelope {
    #[must_use]
    pub fn encode(envelope: &Envelope) -> Self {
        Self {
            kem_ciphertext: b64_encode(envelope.kem_ct.as_bytes()),
            iv: b64_encode(&envelope.iv),
            ciphertext: b64_encode(&envelope.ciphertext),
            auth_tag: b64_encode(&envelope.tag),
            signature: envelope.sig.to_base64(),
        }
    }

    /// Parse and validate the wire fields into a typed envelope.
    ///
    /// Enforces exact sizes for iv (12), tag (16), and KEM ciphertext (1568),
    /// and the 1280-byte signature bound.
    pub fn decode(&self) -> Result<Envelope, CryptoError> {
        if !self.is_complete() {
            return Err(CryptoError::IncompleteEnvelope(self.first_empty_field()));
        }

        let iv_bytes = b64_decode(&self.iv)?;
        let iv: [u8; IV_BYTES] = iv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::EncodingError(format!("iv must be {} bytes", IV_BYTES)))?;

        let tag_bytes = b64_decode(&self.auth_tag)?;
        let tag: [u8; TAG_BYTES] = tag_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::EncodingError(format!("tag must be {} bytes", TAG_BYTES)))?;

        let kem_ct = KemCiphertext::from_bytes(&b64_decode(&self.kem_ciphertext)?)?;
        let sig = Signature::from_bytes(&b64_decode(&self.signature)?)?;
        let ciphertext = b64_decode(&self.ciphertext)?;

        Ok(Envelope {
            kem_ct,
            iv,
            ciphertext,
            tag,
            sig,
        })
    }

    /// True when every field is non-empty. Encryption is mandatory; the relay
    /// rejects partial bundles outright.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.kem_ciphertext.is_empty()
            && !self.iv.is_empty()
            && !self.ciphertext.is_empty()
            && !self.auth_tag.is_empty()
            && !self.signature.is_empty()
    }

    fn first_empty_field(&self) -> &'static str {
        if self.kem_ciphertext.is_empty() {
            "kem_ciphertext"
        } else if self.iv.is_empty() {
            "iv"
        } else if self.ciphertext.is_empty() {
            "ciphertext"
        } else if self.auth_tag.is_empty() {
            "auth_tag"
        } else {
            "signature"
        }
    }

    /// Canonical signing payload reconstructed from the received wire fields.
    ///
    /// The relay calls this instead of trusting any client-supplied payload
    /// string.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        canonical_payload(&self.ciphertext, &self.iv, &self.auth_tag)
    }

    /// Decoded ciphertext size, computed without allocating.
    #[must_use]
    pub fn ciphertext_decoded_len(&self) -> usize {
        base64_decoded_len(&self.ciphertext)
    }

    /// Upper bounds on encoded field sizes a relay should sanity-check before
    /// doing any crypto work.
    pub fn check_field_bounds(&self) -> Result<(), CryptoError> {
        // base64 expands 3 bytes to 4 characters
        let kem_ct_max = KEM_CIPHERTEXT_BYTES.div_ceil(3) * 4;
        let sig_max = SIG_MAX_BYTES.div_ceil(3) * 4;
        if self.kem_ciphertext.len() > kem_ct_max {
            return Err(CryptoError::InvalidCiphertext(
                "oversized KEM ciphertext".to_string(),
            ));
        }
        if self.signature.len() > sig_max {
            return Err(CryptoError::InvalidSignature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pqc::{kem_keygen, sig_keygen};

    #[test]
    fn canonical_payload_is_byte_exact() {
        let payload = canonical_payload("Y3Q=", "aXY=", "dGFn");
        assert_eq!(
            payload,
            br#"{"c":"Y3Q=","i":"aXY=","t":"dGFn"}"#.to_vec()
        );
    }

    #[test]
    fn seal_open_roundtrip() {
        let (kem_pk, kem_sk) = kem_keygen();
        let (sig_pk, sig_sk) = sig_keygen();

        let envelope = seal(b"hello", &kem_pk, &sig_sk).unwrap();
        assert_eq!(envelope.iv.len(), IV_BYTES);
        assert_eq!(envelope.tag.len(), TAG_BYTES);
        assert_eq!(envelope.kem_ct.as_bytes().len(), KEM_CIPHERTEXT_BYTES);

        let plaintext = open(&envelope, &kem_sk, &sig_pk).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn flipping_any_field_bit_fails_decrypt() {
        let (kem_pk, kem_sk) = kem_keygen();
        let (sig_pk, sig_sk) = sig_keygen();
        let envelope = seal(b"tamper target", &kem_pk, &sig_sk).unwrap();

        // ciphertext
        let mut e = envelope.clone();
        e.ciphertext[0] ^= 0x01;
        assert!(matches!(
            open(&e, &kem_sk, &sig_pk),
            Err(CryptoError::DecryptionFailed)
        ));

        // tag
        let mut e = envelope.clone();
        e.tag[0] ^= 0x01;
        assert!(matches!(
            open(&e, &kem_sk, &sig_pk),
            Err(CryptoError::DecryptionFailed)
        ));

        // iv
        let mut e = envelope.clone();
        e.iv[0] ^= 0x01;
        assert!(matches!(
            open(&e, &kem_sk, &sig_pk),
            Err(CryptoError::DecryptionFailed)
        ));

        // kem ciphertext: signature still verifies, AEAD fails on the wrong secret
        let mut e = envelope.clone();
        let mut ct = e.kem_ct.as_bytes().to_vec();
        ct[0] ^= 0x01;
        e.kem_ct = KemCiphertext::from_bytes(&ct).unwrap();
        assert!(matches!(
            open(&e, &kem_sk, &sig_pk),
            Err(CryptoError::DecryptionFailed)
        ));

        // signature
        let mut e = envelope.clone();
        let mut sig = e.sig.as_bytes().to_vec();
        let last = sig.len() - 1;
        sig[last] ^= 0x01;
        e.sig = Signature::from_bytes(&sig).unwrap();
        assert!(matches!(
            open(&e, &kem_sk, &sig_pk),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_sender_key_fails_before_decapsulation() {
        let (kem_pk, kem_sk) = kem_keygen();
        let (_, sig_sk) = sig_keygen();
        let (other_sig_pk, _) = sig_keygen();

        let envelope = seal(b"msg", &kem_pk, &sig_sk).unwrap();
        assert!(matches!(
            open(&envelope, &kem_sk, &other_sig_pk),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn plaintext_boundary_at_ten_mebibytes() {
        let (kem_pk, kem_sk) = kem_keygen();
        let (sig_pk, sig_sk) = sig_keygen();

        let exactly = vec![0x5au8; MAX_PLAINTEXT_BYTES];
        let envelope = seal(&exactly, &kem_pk, &sig_sk).unwrap();
        assert_eq!(open(&envelope, &kem_sk, &sig_pk).unwrap(), exactly);

        let over = vec![0x5au8; MAX_PLAINTEXT_BYTES + 1];
        assert!(matches!(
            seal(&over, &kem_pk, &sig_sk),
            Err(CryptoError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn file_roundtrip_preserves_bytes_and_metadata() {
        let (kem_pk, kem_sk) = kem_keygen();
        let (sig_pk, sig_sk) = sig_keygen();

        let file = vec![0u8, 1, 2, 254, 255];
        let sealed = seal_file(&file, "report.pdf", "application/pdf", &kem_pk, &sig_sk).unwrap();
        assert_eq!(sealed.metadata.file_size, file.len() as u64);
        assert_eq!(sealed.metadata.file_name, "report.pdf");

        let restored = open_file(&sealed, &kem_sk, &sig_pk).unwrap();
        assert_eq!(restored, file);
    }

    #[test]
    fn oversized_file_is_rejected() {
        let (kem_pk, _) = kem_keygen();
        let (_, sig_sk) = sig_keygen();
        let over = vec![0u8; MAX_FILE_BYTES + 1];
        assert!(matches!(
            seal_file(&over, "big.bin", "application/octet-stream", &kem_pk, &sig_sk),
            Err(CryptoError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn wire_roundtrip_and_relay_payload_agree() {
        let (kem_pk, kem_sk) = kem_keygen();
        let (sig_pk, sig_sk) = sig_keygen();

        let envelope = seal(b"over the wire", &kem_pk, &sig_sk).unwrap();
        let wire = WireEnvelope::encode(&envelope);

        // The relay-side reconstruction must equal the sender-side payload.
        assert_eq!(wire.signing_payload(), envelope.signing_payload());

        let decoded = wire.decode().unwrap();
        assert_eq!(open(&decoded, &kem_sk, &sig_pk).unwrap(), b"over the wire");
    }

    #[test]
    fn incomplete_wire_envelope_is_rejected() {
        let (kem_pk, _) = kem_keygen();
        let (_, sig_sk) = sig_keygen();
        let mut wire = WireEnvelope::encode(&seal(b"x", &kem_pk, &sig_sk).unwrap());
        wire.auth_tag = String::new();

        assert!(!wire.is_complete());
        assert!(matches!(
            wire.decode(),
            Err(CryptoError::IncompleteEnvelope("auth_tag"))
        ));
    }

    #[test]
    fn wire_rejects_wrong_iv_length() {
        let (kem_pk, _) = kem_keygen();
        let (_, sig_sk) = sig_keygen();
        let mut wire = WireEnvelope::encode(&seal(b"x", &kem_pk, &sig_sk).unwrap());
        wire.iv = b64_encode(&[0u8; 11]);
        assert!(wire.decode().is_err());
    }

    #[test]
    fn decoded_len_is_exact_for_padded_base64() {
        for n in [0usize, 1, 2, 3, 4, 30, 31, 32, 33] {
            let encoded = b64_encode(&vec![0u8; n]);
            assert_eq!(base64_decoded_len(&encoded), n, "length {}", n);
        }
    }
}
