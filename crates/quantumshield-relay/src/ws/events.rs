//! WebSocket event shapes.
//!
//! Field names here are the wire protocol — they must match the client
//! byte-for-byte and are not free to change.

use serde::{Deserialize, Serialize};

use quantumshield_core::envelope::WireEnvelope;

use crate::directory::UserId;
use crate::friends::RequestId;

/// Client → server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage {
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(flatten)]
        envelope: WireEnvelope,
    },
    SendFile {
        sender_id: UserId,
        receiver_id: UserId,
        file_name: String,
        file_size: u64,
        file_type: String,
        /// AEAD ciphertext of base64(file bytes)
        file_data: String,
        kem_ciphertext: String,
        iv: String,
        auth_tag: String,
        signature: String,
    },
    Ping,
}

/// Server → client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        sender_id: UserId,
        receiver_id: UserId,
        #[serde(flatten)]
        envelope: WireEnvelope,
        timestamp: String,
        id: String,
    },
    MessageSent {
        success: bool,
        message_id: String,
    },
    MessageError {
        error: String,
    },
    ReceiveFile {
        sender_id: UserId,
        receiver_id: UserId,
        file_name: String,
        file_size: u64,
        file_type: String,
        file_data: String,
        kem_ciphertext: String,
        iv: String,
        auth_tag: String,
        signature: String,
        file_id: String,
        timestamp: String,
    },
    FileDelivered {
        success: bool,
        file_id: String,
    },
    FileError {
        error: String,
    },
    FriendRequestReceived {
        id: RequestId,
        sender_id: UserId,
        username: String,
        created_at: String,
    },
    Pong {
        timestamp: String,
    },
}

/// View of a file event as a plain envelope, for signature verification.
/// The AEAD ciphertext travels in `file_data` on the wire.
#[must_use]
pub fn file_fields_as_envelope(
    file_data: &str,
    kem_ciphertext: &str,
    iv: &str,
    auth_tag: &str,
    signature: &str,
) -> WireEnvelope {
    WireEnvelope {
        kem_ciphertext: kem_ciphertext.to_string(),
        iv: iv.to_string(),
        ciphertext: file_data.to_string(),
        auth_tag: auth_tag.to_string(),
        signature: signature.to_string(),
    }
}
