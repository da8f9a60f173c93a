//! The relay protocol engine.
//!
//! Authenticated event bus over per-user rooms. For every `send_message` /
//! `send_file` event the checks run in a fixed order, failing on the first
//! violation with a distinct error code:
//!
//! 1. `sender_id` matches the authenticated connection (`unauthorized_sender`)
//! 2. every envelope field present (`incomplete_envelope`)
//! 3. payload within the hard size cap (`payload_too_large`)
//! 4. friendship exists (`not_friend`)
//! 5. the sender's signature verifies over the canonical payload the relay
//!    reconstructs itself (`bad_signature`) — no client-supplied payload
//!    string is trusted
//! 6. the receiver's room has a live member, else `recipient_offline`
//!
//! Delivery is strictly real time: nothing is ever persisted, and the ack is
//! emitted only when at least one live socket took the event.

use std::sync::Arc;

use actix_ws::{Message, MessageStream, Session};
use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quantumshield_core::envelope::WireEnvelope;
use quantumshield_core::pqc::{self, Signature};

use crate::directory::{UserDirectory, UserId};
use crate::error::RelayError;
use crate::friends::{FriendRequest, FriendStore};
use crate::rate_limit::RateLimits;
use crate::ws::events::{file_fields_as_envelope, ClientEvent, ServerEvent};
use crate::ws::rooms::RoomRegistry;
use crate::ws::types::{Connection, ConnectionMetadata, EventSink};

/// Hard caps on decoded payload sizes, from the relay config.
#[derive(Debug, Clone, Copy)]
pub struct PayloadCaps {
    pub max_message_ciphertext_bytes: usize,
    pub max_file_data_bytes: usize,
}

pub struct RelayService {
    directory: Arc<dyn UserDirectory>,
    friends: Arc<dyn FriendStore>,
    rooms: Arc<RoomRegistry>,
    limits: Arc<RateLimits>,
    caps: PayloadCaps,
}

impl RelayService {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        friends: Arc<dyn FriendStore>,
        rooms: Arc<RoomRegistry>,
        limits: Arc<RateLimits>,
        caps: PayloadCaps,
    ) -> Self {
        Self {
            directory,
            friends,
            rooms,
            limits,
            caps,
        }
    }

    #[must_use]
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Drive one authenticated connection to completion.
    ///
    /// Registers the connection in its user's room, processes events in
    /// arrival order (which fixes the per-connection delivery order), and
    /// removes the connection on any exit path.
    pub async fn handle_connection(
        self: Arc<Self>,
        session: Session,
        mut msg_stream: MessageStream,
        metadata: ConnectionMetadata,
    ) {
        let user_id = metadata.user_id;
        let connection = Arc::new(Connection::new(session.clone(), metadata.clone()));
        let conn_id = connection.id;
        self.rooms
            .join(user_id, conn_id, Arc::clone(&connection) as Arc<dyn EventSink>);

        info!(%conn_id, user_id, user = %metadata.username, "websocket connection established");

        let mut control = session;
        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => self.process_event(user_id, event).await,
                        Err(e) => {
                            debug!(%conn_id, "unparseable event: {e}");
                            ServerEvent::MessageError {
                                error: RelayError::BadRequest(String::new()).code().to_string(),
                            }
                        }
                    };
                    if connection.send_event(&reply).await.is_err() {
                        break;
                    }
                }
                Message::Ping(bytes) => {
                    if control.pong(&bytes).await.is_err() {
                        break;
                    }
                }
                Message::Close(reason) => {
                    debug!(%conn_id, ?reason, "connection closing");
                    break;
                }
                _ => {}
            }
        }

        self.rooms.leave(conn_id);
        info!(%conn_id, user_id, "websocket connection closed");
    }

    /// Dispatch one client event and produce the reply for the origin
    /// connection. Failures map to the error event matching the event family.
    pub async fn process_event(&self, conn_user: UserId, event: ClientEvent) -> ServerEvent {
        match event {
            ClientEvent::SendMessage {
                sender_id,
                receiver_id,
                envelope,
            } => self
                .send_message(conn_user, sender_id, receiver_id, envelope)
                .await
                .unwrap_or_else(|e| {
                    warn!(conn_user, code = e.code(), "send_message rejected");
                    ServerEvent::MessageError {
                        error: e.code().to_string(),
                    }
                }),
            ClientEvent::SendFile {
                sender_id,
                receiver_id,
                file_name,
                file_size,
                file_type,
                file_data,
                kem_ciphertext,
                iv,
                auth_tag,
                signature,
            } => self
                .send_file(
                    conn_user,
                    sender_id,
                    receiver_id,
                    file_name,
                    file_size,
                    file_type,
                    file_data,
                    kem_ciphertext,
                    iv,
                    auth_tag,
                    signature,
                )
                .await
                .unwrap_or_else(|e| {
                    warn!(conn_user, code = e.code(), "send_file rejected");
                    ServerEvent::FileError {
                        error: e.code().to_string(),
                    }
                }),
            ClientEvent::Ping => ServerEvent::Pong {
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        }
    }

    async fn send_message(
        &self,
        conn_user: UserId,
        sender_id: UserId,
        receiver_id: UserId,
        envelope: WireEnvelope,
    ) -> Result<ServerEvent, RelayError> {
        self.limits.events.check(conn_user)?;

        if sender_id != conn_user {
            return Err(RelayError::UnauthorizedSender);
        }
        if !envelope.is_complete() {
            return Err(RelayError::IncompleteEnvelope);
        }
        if envelope.check_field_bounds().is_err()
            || envelope.ciphertext_decoded_len() > self.caps.max_message_ciphertext_bytes
        {
            return Err(RelayError::PayloadTooLarge);
        }

        self.authorize_and_verify(sender_id, receiver_id, &envelope)
            .await?;

        let message_id = Uuid::new_v4().to_string();
        let delivered = self
            .rooms
            .emit_to_user(
                receiver_id,
                &ServerEvent::ReceiveMessage {
                    sender_id,
                    receiver_id,
                    envelope,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    id: message_id.clone(),
                },
            )
            .await;
        if delivered == 0 {
            // Ephemeral-only: the envelope is dropped, never stored.
            return Err(RelayError::RecipientOffline);
        }

        debug!(sender_id, receiver_id, %message_id, delivered, "message relayed");
        Ok(ServerEvent::MessageSent {
            success: true,
            message_id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_file(
        &self,
        conn_user: UserId,
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
    ) -> Result<ServerEvent, RelayError> {
        self.limits.events.check(conn_user)?;

        if sender_id != conn_user {
            return Err(RelayError::UnauthorizedSender);
        }
        let envelope =
            file_fields_as_envelope(&file_data, &kem_ciphertext, &iv, &auth_tag, &signature);
        if !envelope.is_complete() {
            return Err(RelayError::IncompleteEnvelope);
        }
        if envelope.check_field_bounds().is_err()
            || envelope.ciphertext_decoded_len() > self.caps.max_file_data_bytes
        {
            return Err(RelayError::PayloadTooLarge);
        }

        self.authorize_and_verify(sender_id, receiver_id, &envelope)
            .await?;

        let file_id = Uuid::new_v4().to_string();
        let delivered = self
            .rooms
            .emit_to_user(
                receiver_id,
                &ServerEvent::ReceiveFile {
                    sender_id,
                    receiver_id,
                    file_name,
                    file_size,
                    file_type,
                    file_data,
                    kem_ciphertext,
                    iv,
                    auth_tag,
                    signature,
                    file_id: file_id.clone(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                },
            )
            .await;
        if delivered == 0 {
            return Err(RelayError::RecipientOffline);
        }

        debug!(sender_id, receiver_id, %file_id, delivered, "file relayed");
        Ok(ServerEvent::FileDelivered {
            success: true,
            file_id,
        })
    }

    /// Friendship check, then signature verification over the canonical
    /// payload reconstructed from the received wire fields. Order is fixed;
    /// nothing may be emitted before both pass.
    async fn authorize_and_verify(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        envelope: &WireEnvelope,
    ) -> Result<(), RelayError> {
        if !self.friends.are_friends(sender_id, receiver_id).await? {
            return Err(RelayError::NotFriend);
        }

        let sender = self
            .directory
            .get_user(sender_id)
            .await?
            .ok_or_else(|| RelayError::Internal("sender missing from user store".to_string()))?;
        let sig =
            Signature::from_base64(&envelope.signature).map_err(|_| RelayError::BadSignature)?;
        if !pqc::verify(&envelope.signing_payload(), &sig, &sender.sig_public_key) {
            return Err(RelayError::BadSignature);
        }
        Ok(())
    }

    /// Push a friend-request notification into the receiver's room. This is
    /// informational only — the HTTP surface is authoritative — so delivery
    /// failures are ignored.
    pub async fn notify_friend_request(&self, request: &FriendRequest, sender_username: &str) {
        let delivered = self
            .rooms
            .emit_to_user(
                request.receiver_id,
                &ServerEvent::FriendRequestReceived {
                    id: request.id,
                    sender_id: request.sender_id,
                    username: sender_username.to_string(),
                    created_at: request.created_at.to_rfc3339(),
                },
            )
            .await;
        debug!(
            receiver_id = request.receiver_id,
            delivered, "friend request notification"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, UserRecord};
    use crate::friends::MemoryFriendStore;
    use async_trait::async_trait;
    use quantumshield_core::envelope::seal;
    use quantumshield_core::pqc::{kem_keygen, sig_keygen, SigSecretKey};
    use std::sync::Mutex;

    struct CapturingSink {
        events: Mutex<Vec<serde_json::Value>>,
    }

    impl CapturingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<serde_json::Value> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for CapturingSink {
        async fn send_json(&self, payload: String) -> Result<(), ()> {
            let value = serde_json::from_str(&payload).map_err(|_| ())?;
            self.events.lock().unwrap().push(value);
            Ok(())
        }
    }

    struct Fixture {
        service: RelayService,
        alice_sig_sk: SigSecretKey,
        bob_kem_pk: quantumshield_core::pqc::KemPublicKey,
    }

    /// Alice = 10, Bob = 11, already friends.
    async fn fixture() -> Fixture {
        let directory = Arc::new(MemoryDirectory::new());
        let (alice_kem_pk, _alice_kem_sk) = kem_keygen();
        let (alice_sig_pk, alice_sig_sk) = sig_keygen();
        let (bob_kem_pk, _) = kem_keygen();
        let (bob_sig_pk, _) = sig_keygen();
        directory
            .register(UserRecord {
                user_id: 10,
                username: "alice".to_string(),
                kem_public_key: alice_kem_pk,
                sig_public_key: alice_sig_pk,
            })
            .unwrap();
        directory
            .register(UserRecord {
                user_id: 11,
                username: "bob".to_string(),
                kem_public_key: bob_kem_pk.clone(),
                sig_public_key: bob_sig_pk,
            })
            .unwrap();

        let friends = Arc::new(MemoryFriendStore::new());
        let request = friends.create_request(10, 11).await.unwrap();
        friends.accept(request.id, 11).await.unwrap();

        let service = RelayService::new(
            directory,
            friends,
            Arc::new(RoomRegistry::new()),
            Arc::new(RateLimits::new(120, 10, 20)),
            PayloadCaps {
                max_message_ciphertext_bytes: 10 * 1024 * 1024,
                max_file_data_bytes: 13_981_016,
            },
        );
        Fixture {
            service,
            alice_sig_sk,
            bob_kem_pk,
        }
    }

    fn sealed_wire(fx: &Fixture, plaintext: &[u8]) -> WireEnvelope {
        WireEnvelope::encode(&seal(plaintext, &fx.bob_kem_pk, &fx.alice_sig_sk).unwrap())
    }

    #[tokio::test]
    async fn forged_sender_id_is_rejected() {
        let fx = fixture().await;
        let wire = sealed_wire(&fx, b"hi");
        // Alice's connection claims to be Bob
        let reply = fx
            .service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 11,
                    receiver_id: 10,
                    envelope: wire,
                },
            )
            .await;
        match reply {
            ServerEvent::MessageError { error } => assert_eq!(error, "unauthorized_sender"),
            other => panic!("expected message_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_envelope_field_is_rejected_before_any_crypto() {
        let fx = fixture().await;
        let mut wire = sealed_wire(&fx, b"hi");
        wire.ciphertext = String::new();
        let reply = fx
            .service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 10,
                    receiver_id: 11,
                    envelope: wire,
                },
            )
            .await;
        match reply {
            ServerEvent::MessageError { error } => assert_eq!(error, "incomplete_envelope"),
            other => panic!("expected message_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_friends_cannot_relay() {
        let fx = fixture().await;
        fx.service.friends.remove_friend(10, 11).await.unwrap();
        let wire = sealed_wire(&fx, b"hi");
        let reply = fx
            .service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 10,
                    receiver_id: 11,
                    envelope: wire,
                },
            )
            .await;
        match reply {
            ServerEvent::MessageError { error } => assert_eq!(error, "not_friend"),
            other => panic!("expected message_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sending_to_yourself_fails_the_friendship_check() {
        let fx = fixture().await;
        let wire = sealed_wire(&fx, b"hi");
        let reply = fx
            .service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 10,
                    receiver_id: 10,
                    envelope: wire,
                },
            )
            .await;
        match reply {
            ServerEvent::MessageError { error } => assert_eq!(error, "not_friend"),
            other => panic!("expected message_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_recipient_yields_recipient_offline_and_no_storage() {
        let fx = fixture().await;
        let wire = sealed_wire(&fx, b"hi");
        let reply = fx
            .service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 10,
                    receiver_id: 11,
                    envelope: wire,
                },
            )
            .await;
        match reply {
            ServerEvent::MessageError { error } => assert_eq!(error, "recipient_offline"),
            other => panic!("expected message_error, got {other:?}"),
        }

        // Bob connecting later sees nothing: the relay kept no copy.
        let bob = CapturingSink::new();
        fx.service
            .rooms
            .join(11, crate::ws::types::ConnectionId::new(), bob.clone());
        assert!(bob.received().is_empty());
    }

    #[tokio::test]
    async fn event_rate_limit_applies_per_user() {
        let directory = Arc::new(MemoryDirectory::new());
        let friends = Arc::new(MemoryFriendStore::new());
        let service = RelayService::new(
            directory,
            friends,
            Arc::new(RoomRegistry::new()),
            Arc::new(RateLimits::new(1, 10, 20)),
            PayloadCaps {
                max_message_ciphertext_bytes: 1024,
                max_file_data_bytes: 1024,
            },
        );

        let envelope = WireEnvelope {
            kem_ciphertext: "a2Vt".to_string(),
            iv: "aXY=".to_string(),
            ciphertext: "Y3Q=".to_string(),
            auth_tag: "dGFn".to_string(),
            signature: "c2ln".to_string(),
        };
        // the single token: fails later in the pipeline but consumes the slot
        let _ = service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 10,
                    receiver_id: 11,
                    envelope: envelope.clone(),
                },
            )
            .await;
        let reply = service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 10,
                    receiver_id: 11,
                    envelope,
                },
            )
            .await;
        match reply {
            ServerEvent::MessageError { error } => assert_eq!(error, "rate_limited"),
            other => panic!("expected message_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let fx = fixture().await;
        match fx.service.process_event(10, ClientEvent::Ping).await {
            ServerEvent::Pong { timestamp } => assert!(!timestamp.is_empty()),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_delivers_and_acks() {
        let fx = fixture().await;
        let bob = CapturingSink::new();
        fx.service
            .rooms
            .join(11, crate::ws::types::ConnectionId::new(), bob.clone());

        let wire = sealed_wire(&fx, b"hello");
        let reply = fx
            .service
            .process_event(
                10,
                ClientEvent::SendMessage {
                    sender_id: 10,
                    receiver_id: 11,
                    envelope: wire,
                },
            )
            .await;
        match reply {
            ServerEvent::MessageSent {
                success,
                message_id,
            } => {
                assert!(success);
                assert!(!message_id.is_empty());
            }
            other => panic!("expected message_sent, got {other:?}"),
        }

        let events = bob.received();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "receive_message");
        assert_eq!(events[0]["sender_id"], 10);
    }
}
