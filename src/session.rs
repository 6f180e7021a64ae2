use std::sync::RwLock;

use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

/// Session collaborator: who is signed in on this client, if anyone.
pub trait Session: Send + Sync {
    fn current_user_id(&self) -> Option<Uuid>;
}

/// Resolves the current user or fails the operation.
pub fn require_user(session: &dyn Session) -> ChatResult<Uuid> {
    session.current_user_id().ok_or(ChatError::Unauthenticated)
}

/// Session state owned by one connection.
#[derive(Default)]
pub struct ConnectionSession {
    user_id: RwLock<Option<Uuid>>,
}

impl ConnectionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: Uuid) -> Self {
        ConnectionSession {
            user_id: RwLock::new(Some(user_id)),
        }
    }

    pub fn sign_in(&self, user_id: Uuid) {
        if let Ok(mut current) = self.user_id.write() {
            *current = Some(user_id);
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut current) = self.user_id.write() {
            *current = None;
        }
    }
}

impl Session for ConnectionSession {
    fn current_user_id(&self) -> Option<Uuid> {
        self.user_id.read().ok().and_then(|id| *id)
    }
}
