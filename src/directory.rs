use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{info, warn};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::task;
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::models::UserProfile;
use crate::storage::Storage;

/// User directory collaborator.
pub trait UserDirectory: Send + Sync {
    fn resolve_user(&self, id: &Uuid) -> ChatResult<UserProfile>;

    /// Candidate recipients for `user`'s contact picker.
    fn list_contacts(&self, user: &Uuid) -> ChatResult<Vec<UserProfile>>;
}

/// Runs a synchronous directory call on the blocking pool.
pub async fn lookup<D, T, F>(directory: &Arc<D>, f: F) -> ChatResult<T>
where
    D: ?Sized + Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&D) -> ChatResult<T> + Send + 'static,
{
    let directory = Arc::clone(directory);
    task::spawn_blocking(move || f(directory.as_ref())).await?
}

/// Directory kept in the `users` table of the chat database.
///
/// Each registered user holds one login token. Only its SHA-256 digest is
/// stored; the token itself is handed out once, at registration.
pub struct SqliteDirectory {
    storage: Mutex<Storage>,
    rng: SystemRandom,
}

impl SqliteDirectory {
    pub fn new(db_path: &str) -> ChatResult<Self> {
        Ok(SqliteDirectory {
            storage: Mutex::new(Storage::new(db_path)?),
            rng: SystemRandom::new(),
        })
    }

    pub fn register(&self, username: &str, display_name: &str, email: &str) -> ChatResult<UserProfile> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ChatError::Validation("username is empty".into()));
        }
        let user = UserProfile {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: if display_name.trim().is_empty() {
                username.to_string()
            } else {
                display_name.trim().to_string()
            },
            email: email.trim().to_string(),
        };
        self.with_storage(|storage| Ok(storage.save_user(&user)?))?;
        Ok(user)
    }

    pub fn find_by_username(&self, username: &str) -> ChatResult<UserProfile> {
        self.with_storage(|storage| match storage.get_user_by_username(username) {
            Ok(user) => Ok(user),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(ChatError::NotFound(format!("user {}", username)))
            }
            Err(e) => Err(e.into()),
        })
    }

    /// Replaces `user_id`'s login token and returns the new one.
    pub fn issue_token(&self, user_id: &Uuid) -> ChatResult<String> {
        let mut raw = [0u8; 32];
        self.rng
            .fill(&mut raw)
            .map_err(|_| ChatError::Task("failed to generate login token".into()))?;
        let token = URL_SAFE_NO_PAD.encode(raw);
        let hash = token_hash(&token);
        self.with_storage(|storage| Ok(storage.save_credential(user_id, &hash)?))?;
        Ok(token)
    }

    /// Signs in `username` with a token from [`issue_token`](Self::issue_token).
    /// An unknown user and a wrong token both fail as `Unauthenticated`.
    pub fn authenticate(&self, username: &str, token: &str) -> ChatResult<UserProfile> {
        let user = match self.find_by_username(username) {
            Ok(user) => user,
            Err(ChatError::NotFound(_)) => {
                warn!("Login for unknown user {}", username);
                return Err(ChatError::Unauthenticated);
            }
            Err(e) => return Err(e),
        };
        let stored = self.with_storage(|storage| Ok(storage.credential_hash(&user.id)?))?;
        if stored.as_deref() != Some(token_hash(token).as_str()) {
            warn!("Rejected login for {}", username);
            return Err(ChatError::Unauthenticated);
        }
        info!("Authenticated {}", username);
        Ok(user)
    }

    fn with_storage<T>(&self, f: impl FnOnce(&Storage) -> ChatResult<T>) -> ChatResult<T> {
        let storage = self
            .storage
            .lock()
            .map_err(|_| ChatError::Task("directory lock poisoned".into()))?;
        f(&storage)
    }
}

fn token_hash(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest(&SHA256, token.as_bytes()))
}

impl UserDirectory for SqliteDirectory {
    fn resolve_user(&self, id: &Uuid) -> ChatResult<UserProfile> {
        self.with_storage(|storage| {
            storage
                .get_user(id)?
                .ok_or_else(|| ChatError::NotFound(format!("user {}", id)))
        })
    }

    fn list_contacts(&self, user: &Uuid) -> ChatResult<Vec<UserProfile>> {
        self.with_storage(|storage| Ok(storage.list_users_except(user)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let directory = SqliteDirectory::new(":memory:").unwrap();
        let alice = directory.register("alice", "Alice A.", "alice@example.com").unwrap();
        let bob = directory.register(" bob ", "", "").unwrap();

        assert_eq!(bob.username, "bob");
        assert_eq!(bob.display_name, "bob");
        assert_eq!(directory.resolve_user(&alice.id).unwrap(), alice);
        assert_eq!(directory.find_by_username("bob").unwrap().id, bob.id);
        assert_eq!(directory.list_contacts(&alice.id).unwrap(), vec![bob]);
    }

    #[test]
    fn test_unknown_user() {
        let directory = SqliteDirectory::new(":memory:").unwrap();
        assert!(matches!(
            directory.resolve_user(&Uuid::new_v4()),
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            directory.find_by_username("ghost"),
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            directory.register("", "", ""),
            Err(ChatError::Validation(_))
        ));
    }

    #[test]
    fn test_login_requires_issued_token() {
        let directory = SqliteDirectory::new(":memory:").unwrap();
        let alice = directory.register("alice", "", "").unwrap();
        assert!(matches!(
            directory.authenticate("alice", "guess"),
            Err(ChatError::Unauthenticated)
        ));

        let first = directory.issue_token(&alice.id).unwrap();
        assert_eq!(directory.authenticate("alice", &first).unwrap(), alice);

        let second = directory.issue_token(&alice.id).unwrap();
        assert_ne!(first, second);
        assert!(matches!(
            directory.authenticate("alice", &first),
            Err(ChatError::Unauthenticated)
        ));
        assert!(matches!(
            directory.authenticate("mallory", &second),
            Err(ChatError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_lookup_runs_off_the_runtime() {
        let directory = Arc::new(SqliteDirectory::new(":memory:").unwrap());
        let alice = directory.register("alice", "", "").unwrap();
        let shared: Arc<dyn UserDirectory> = directory;
        let id = alice.id;
        let resolved = lookup(&shared, move |d| d.resolve_user(&id)).await.unwrap();
        assert_eq!(resolved, alice);
    }
}
