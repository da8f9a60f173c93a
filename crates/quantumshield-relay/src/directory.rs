//! Read-only projection of the external user store.
//!
//! The relay only ever needs `(user_id, username, public keys)`; registration
//! and durable storage live elsewhere. The tuple is immutable
//! post-registration, which is what lets the relay cache-free look up the
//! sender's signature key on every event.

use async_trait::async_trait;
use dashmap::DashMap;

use quantumshield_core::pqc::{KemPublicKey, SigPublicKey};

use crate::error::RelayError;

/// Opaque user identifier assigned by the external store.
pub type UserId = u64;

/// One user as the relay sees it.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: String,
    pub kem_public_key: KemPublicKey,
    pub sig_public_key: SigPublicKey,
}

/// Lookup interface over the external user store.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>, RelayError>;
    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, RelayError>;
}

/// In-memory directory used by tests and dev seeding.
#[derive(Default)]
pub struct MemoryDirectory {
    users: DashMap<UserId, UserRecord>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user projection. Key lengths were validated when the
    /// `KemPublicKey`/`SigPublicKey` values were constructed.
    pub fn register(&self, record: UserRecord) -> Result<(), RelayError> {
        if self
            .users
            .iter()
            .any(|u| u.username == record.username && u.user_id != record.user_id)
        {
            return Err(RelayError::Conflict(format!(
                "username {:?} already registered",
                record.username
            )));
        }
        self.users.insert(record.user_id, record);
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>, RelayError> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, RelayError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.username == username)
            .map(|u| u.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quantumshield_core::pqc::{kem_keygen, sig_keygen};

    fn record(user_id: UserId, username: &str) -> UserRecord {
        let (kem_pk, _) = kem_keygen();
        let (sig_pk, _) = sig_keygen();
        UserRecord {
            user_id,
            username: username.to_string(),
            kem_public_key: kem_pk,
            sig_public_key: sig_pk,
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let dir = MemoryDirectory::new();
        dir.register(record(10, "alice")).unwrap();

        let user = dir.get_user(10).await.unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert!(dir.get_user(99).await.unwrap().is_none());

        let by_name = dir.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(by_name.user_id, 10);
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected() {
        let dir = MemoryDirectory::new();
        dir.register(record(10, "alice")).unwrap();
        assert!(dir.register(record(11, "alice")).is_err());
        // re-registering the same user is idempotent
        dir.register(record(10, "alice")).unwrap();
    }
}
