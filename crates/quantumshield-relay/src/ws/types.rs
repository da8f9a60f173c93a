//! WebSocket connection types.

use std::sync::Arc;

use actix_ws::Session;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::directory::UserId;

/// Unique identifier for a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity and provenance of an authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub user_id: UserId,
    pub username: String,
    pub remote_addr: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
}

/// Anything events can be emitted into. Production connections wrap an
/// actix-ws session; tests substitute capturing sinks.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one serialized event. Errors mean the peer is gone.
    async fn send_json(&self, payload: String) -> Result<(), ()>;
}

/// A live WebSocket connection.
pub struct Connection {
    pub id: ConnectionId,
    pub metadata: ConnectionMetadata,
    session: Arc<RwLock<Session>>,
}

impl Connection {
    #[must_use]
    pub fn new(session: Session, metadata: ConnectionMetadata) -> Self {
        Self {
            id: ConnectionId::new(),
            metadata,
            session: Arc::new(RwLock::new(session)),
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), actix_ws::Closed> {
        let mut session = self.session.write().await;
        session.text(text.into()).await
    }

    pub async fn send_event<T: Serialize>(&self, event: &T) -> Result<(), ()> {
        let json = serde_json::to_string(event).map_err(|_| ())?;
        self.send_text(json).await.map_err(|_| ())
    }

    pub async fn close(&self) -> Result<(), actix_ws::Closed> {
        let session = self.session.write().await;
        session.clone().close(None).await
    }
}

#[async_trait]
impl EventSink for Connection {
    async fn send_json(&self, payload: String) -> Result<(), ()> {
        self.send_text(payload).await.map_err(|_| ())
    }
}
