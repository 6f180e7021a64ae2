use thiserror::Error;

/// Errors surfaced by the messaging core.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed send request (empty text, missing attachment for a file kind)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Attachment content type is not on the allow-list
    #[error("attachment type not allowed: {0}")]
    InvalidType(String),

    /// Attachment is above the size ceiling
    #[error("attachment too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    /// Blob upload failed; no message was created
    #[error("storage error: {0}")]
    Storage(String),

    /// Push subscription dropped; the unread poll takes over
    #[error("delivery channel error: {0}")]
    DeliveryChannel(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A blocking database or directory task panicked or its lock was poisoned
    #[error("background task failed: {0}")]
    Task(String),
}

impl ChatError {
    /// Whether the error should be shown to the user as a failure.
    ///
    /// A dropped push subscription is healed by the periodic unread poll, so
    /// at most a transient "reconnecting" state is shown for it.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, ChatError::DeliveryChannel(_))
    }

    /// Short machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::InvalidType(_) => "INVALID_TYPE",
            ChatError::TooLarge { .. } => "TOO_LARGE",
            ChatError::Storage(_) => "STORAGE_ERROR",
            ChatError::DeliveryChannel(_) => "DELIVERY_CHANNEL_ERROR",
            ChatError::Unauthenticated => "UNAUTHENTICATED",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Database(_) => "DATABASE_ERROR",
            ChatError::Task(_) => "TASK_ERROR",
        }
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        ChatError::Task(err.to_string())
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_errors_are_not_user_facing() {
        assert!(!ChatError::DeliveryChannel("dropped".into()).is_user_facing());
        assert!(ChatError::Unauthenticated.is_user_facing());
        assert!(ChatError::TooLarge { size: 2, limit: 1 }.is_user_facing());
    }

    #[test]
    fn test_codes() {
        assert_eq!(ChatError::Validation("x".into()).code(), "VALIDATION_ERROR");
        assert_eq!(
            ChatError::TooLarge { size: 11, limit: 10 }.to_string(),
            "attachment too large: 11 bytes (limit 10)"
        );
    }
}
