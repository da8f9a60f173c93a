//! Per-user rooms.
//!
//! One logical room per user id; all of that user's live connections are
//! members (multi-device). Membership reflects live connections only — a
//! disconnect removes the connection and nothing else. Emitting into a room
//! is fire-and-forget: the caller learns how many sockets took the event at
//! the moment of emission, and dead sockets found along the way are evicted.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::directory::UserId;
use crate::ws::types::{ConnectionId, EventSink};

struct Member {
    user_id: UserId,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
pub struct RoomRegistry {
    members: DashMap<ConnectionId, Member>,
    rooms: DashMap<UserId, HashSet<ConnectionId>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to `room(user_id)`. Duplicate connections for the
    /// same user are expected (multi-device) and each joins the same room.
    pub fn join(&self, user_id: UserId, conn_id: ConnectionId, sink: Arc<dyn EventSink>) {
        self.members.insert(conn_id, Member { user_id, sink });
        self.rooms.entry(user_id).or_default().insert(conn_id);
        debug!(%conn_id, user_id, "connection joined room");
    }

    /// Remove a connection. The room survives as long as it has members.
    pub fn leave(&self, conn_id: ConnectionId) {
        if let Some((_, member)) = self.members.remove(&conn_id) {
            let mut empty = false;
            if let Some(mut room) = self.rooms.get_mut(&member.user_id) {
                room.remove(&conn_id);
                empty = room.is_empty();
            }
            if empty {
                self.rooms.remove_if(&member.user_id, |_, room| room.is_empty());
            }
            debug!(%conn_id, user_id = member.user_id, "connection left room");
        }
    }

    /// Whether the user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.rooms
            .get(&user_id)
            .map(|room| !room.is_empty())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    /// Emit an event to every live connection of `user_id`.
    ///
    /// Returns the number of sockets that accepted the event. Sockets that
    /// fail mid-emit are evicted; delivery is best-effort by design.
    pub async fn emit_to_user<T: Serialize>(&self, user_id: UserId, event: &T) -> usize {
        let Ok(payload) = serde_json::to_string(event) else {
            warn!(user_id, "failed to serialize event for emission");
            return 0;
        };

        // Collect sinks up front so no map guard is held across an await.
        let targets: Vec<(ConnectionId, Arc<dyn EventSink>)> = self
            .rooms
            .get(&user_id)
            .map(|room| {
                room.iter()
                    .filter_map(|conn_id| {
                        self.members
                            .get(conn_id)
                            .map(|m| (*conn_id, Arc::clone(&m.sink)))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn_id, sink) in targets {
            match sink.send_json(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(()) => {
                    warn!(%conn_id, user_id, "dropping dead connection during emit");
                    dead.push(conn_id);
                }
            }
        }
        for conn_id in dead {
            self.leave(conn_id);
        }
        delivered
    }
}
