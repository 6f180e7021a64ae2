use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregator::UnreadAggregator;
use crate::delivery::InsertEvent;
use crate::directory::{lookup, UserDirectory};
use crate::error::ChatResult;
use crate::models::{Message, MessageKind, UnreadIndex};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const PREVIEW_CHARS: usize = 50;

/// What the client is showing when an event arrives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewContext {
    pub open_counterparty: Option<Uuid>,
    pub foregrounded: bool,
}

impl ViewContext {
    /// True when a message from `sender_id` is already visible inline.
    pub fn shows(&self, sender_id: Uuid) -> bool {
        self.foregrounded && self.open_counterparty == Some(sender_id)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub preview: String,
    pub unread_from_sender: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub alert: Option<Alert>,
    pub unread: UnreadIndex,
}

/// Turns pushed inserts into alerts and unread refreshes.
#[derive(Clone)]
pub struct NotificationDispatcher {
    aggregator: UnreadAggregator,
    directory: Arc<dyn UserDirectory>,
    poll_interval: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        aggregator: UnreadAggregator,
        directory: Arc<dyn UserDirectory>,
        poll_interval: Duration,
    ) -> Self {
        NotificationDispatcher {
            aggregator,
            directory,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Handles one pushed insert for `current_user`. Events addressed to
    /// someone else yield `None`. The unread index is always refreshed.
    pub async fn on_insert(
        &self,
        event: &InsertEvent,
        current_user: Uuid,
        view: &ViewContext,
    ) -> ChatResult<Option<Dispatch>> {
        let message = &event.message;
        if message.receiver_id != current_user {
            debug!(
                "Ignoring insert {} addressed to {}",
                message.id, message.receiver_id
            );
            return Ok(None);
        }

        let unread = self.aggregator.refresh(current_user).await?;
        let alert = if view.shows(message.sender_id) {
            debug!("Suppressing alert for {}: conversation open", message.id);
            None
        } else {
            Some(Alert {
                message_id: message.id,
                sender_id: message.sender_id,
                sender_name: self.sender_name(message.sender_id).await,
                preview: preview(message),
                unread_from_sender: unread.from_sender(&message.sender_id),
            })
        };
        Ok(Some(Dispatch { alert, unread }))
    }

    /// The periodic backstop for missed pushes.
    pub async fn poll(&self, current_user: Uuid) -> ChatResult<UnreadIndex> {
        self.aggregator.refresh(current_user).await
    }

    async fn sender_name(&self, sender_id: Uuid) -> String {
        match lookup(&self.directory, move |d| d.resolve_user(&sender_id)).await {
            Ok(user) => user.display_name,
            Err(e) => {
                warn!("Could not resolve sender {}: {}", sender_id, e);
                "Unknown sender".to_string()
            }
        }
    }
}

/// First 50 characters of a text body, or "Sent a {kind}" for files.
pub fn preview(message: &Message) -> String {
    match message.kind {
        MessageKind::Text => {
            let mut chars = message.body.chars();
            let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
            if chars.next().is_some() {
                format!("{}…", head)
            } else {
                head
            }
        }
        kind => format!("Sent a {}", kind),
    }
}
