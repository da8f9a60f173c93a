//! Friendship state machine backing the relay ACL.
//!
//! A friend request `(s → r)` moves `none → pending → accepted | rejected`
//! and never transitions again. Friendships are unordered pairs stored
//! canonically as `(min, max)` with at most one row per pair; accepting a
//! request creates the friendship in the same transaction as the status
//! change. Rejection is not a block: a rejected or removed pair may be
//! re-requested later.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::directory::UserId;
use crate::error::RelayError;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct FriendRequest {
    pub id: RequestId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// Canonical friendship row: `user_a < user_b` always.
#[derive(Debug, Clone, Serialize)]
pub struct Friendship {
    pub user_a: UserId,
    pub user_b: UserId,
    pub created_at: DateTime<Utc>,
}

/// Canonical form of an unordered pair.
#[must_use]
pub fn canonical_pair(u: UserId, v: UserId) -> (UserId, UserId) {
    (u.min(v), u.max(v))
}

#[async_trait]
pub trait FriendStore: Send + Sync {
    async fn create_request(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<FriendRequest, RelayError>;

    /// Accept a pending request addressed to `caller`. Atomic with the
    /// friendship creation: on a uniqueness race the accept fails cleanly and
    /// the request stays pending.
    async fn accept(&self, request_id: RequestId, caller: UserId)
        -> Result<FriendRequest, RelayError>;

    async fn reject(&self, request_id: RequestId, caller: UserId)
        -> Result<FriendRequest, RelayError>;

    async fn remove_friend(&self, a: UserId, b: UserId) -> Result<(), RelayError>;

    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, RelayError>;

    async fn pending_for(&self, receiver_id: UserId) -> Result<Vec<FriendRequest>, RelayError>;

    async fn friends_of(&self, user_id: UserId) -> Result<Vec<Friendship>, RelayError>;
}

#[derive(Default)]
struct Tables {
    next_id: RequestId,
    requests: HashMap<RequestId, FriendRequest>,
    friendships: HashMap<(UserId, UserId), Friendship>,
}

/// In-memory friend store. One mutex over both tables makes every
/// multi-record transition (accept = insert friendship + update request) a
/// single transaction.
#[derive(Default)]
pub struct MemoryFriendStore {
    tables: Mutex<Tables>,
}

impl MemoryFriendStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FriendStore for MemoryFriendStore {
    async fn create_request(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<FriendRequest, RelayError> {
        if sender_id == receiver_id {
            return Err(RelayError::BadRequest(
                "cannot send a friend request to yourself".to_string(),
            ));
        }

        let mut tables = self.tables.lock().await;
        if tables
            .friendships
            .contains_key(&canonical_pair(sender_id, receiver_id))
        {
            return Err(RelayError::BadRequest("already friends".to_string()));
        }
        let duplicate = tables.requests.values().any(|r| {
            r.status == RequestStatus::Pending
                && canonical_pair(r.sender_id, r.receiver_id)
                    == canonical_pair(sender_id, receiver_id)
        });
        if duplicate {
            return Err(RelayError::BadRequest(
                "a pending request already exists".to_string(),
            ));
        }

        tables.next_id += 1;
        let request = FriendRequest {
            id: tables.next_id,
            sender_id,
            receiver_id,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
        };
        tables.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn accept(
        &self,
        request_id: RequestId,
        caller: UserId,
    ) -> Result<FriendRequest, RelayError> {
        let mut tables = self.tables.lock().await;

        let request = tables
            .requests
            .get(&request_id)
            .filter(|r| r.receiver_id == caller)
            .cloned()
            .ok_or_else(|| RelayError::NotFound("no such friend request".to_string()))?;
        if request.status != RequestStatus::Pending {
            return Err(RelayError::BadRequest("request is not pending".to_string()));
        }

        let pair = canonical_pair(request.sender_id, request.receiver_id);
        if tables.friendships.contains_key(&pair) {
            // lost the uniqueness race; leave the request pending
            return Err(RelayError::Conflict("friendship already exists".to_string()));
        }
        tables.friendships.insert(
            pair,
            Friendship {
                user_a: pair.0,
                user_b: pair.1,
                created_at: Utc::now(),
            },
        );
        let updated = {
            let entry = tables
                .requests
                .get_mut(&request_id)
                .ok_or_else(|| RelayError::Internal("request vanished mid-accept".to_string()))?;
            entry.status = RequestStatus::Accepted;
            entry.responded_at = Some(Utc::now());
            entry.clone()
        };
        Ok(updated)
    }

    async fn reject(
        &self,
        request_id: RequestId,
        caller: UserId,
    ) -> Result<FriendRequest, RelayError> {
        let mut tables = self.tables.lock().await;
        let request = tables
            .requests
            .get_mut(&request_id)
            .filter(|r| r.receiver_id == caller)
            .ok_or_else(|| RelayError::NotFound("no such friend request".to_string()))?;
        if request.status != RequestStatus::Pending {
            return Err(RelayError::BadRequest("request is not pending".to_string()));
        }
        request.status = RequestStatus::Rejected;
        request.responded_at = Some(Utc::now());
        Ok(request.clone())
    }

    async fn remove_friend(&self, a: UserId, b: UserId) -> Result<(), RelayError> {
        let mut tables = self.tables.lock().await;
        tables
            .friendships
            .remove(&canonical_pair(a, b))
            .map(|_| ())
            .ok_or_else(|| RelayError::NotFound("no such friendship".to_string()))
    }

    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, RelayError> {
        let tables = self.tables.lock().await;
        Ok(tables.friendships.contains_key(&canonical_pair(a, b)))
    }

    async fn pending_for(&self, receiver_id: UserId) -> Result<Vec<FriendRequest>, RelayError> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<FriendRequest> = tables
            .requests
            .values()
            .filter(|r| r.receiver_id == receiver_id && r.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.id);
        Ok(pending)
    }

    async fn friends_of(&self, user_id: UserId) -> Result<Vec<Friendship>, RelayError> {
        let tables = self.tables.lock().await;
        let mut friends: Vec<Friendship> = tables
            .friendships
            .values()
            .filter(|f| f.user_a == user_id || f.user_b == user_id)
            .cloned()
            .collect();
        friends.sort_by_key(|f| (f.user_a, f.user_b));
        Ok(friends)
    }
}
