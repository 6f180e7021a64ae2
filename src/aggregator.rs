use log::debug;
use uuid::Uuid;

use crate::error::ChatResult;
use crate::message_log::MessageLog;
use crate::models::UnreadIndex;

/// Read-only view over the log that derives unread counts.
///
/// Every refresh recomputes the whole index. A refresh racing a
/// `mark_read` can report a count that is one cycle stale; the next refresh
/// corrects it.
#[derive(Clone)]
pub struct UnreadAggregator {
    log: MessageLog,
}

impl UnreadAggregator {
    pub fn new(log: MessageLog) -> Self {
        UnreadAggregator { log }
    }

    pub async fn refresh(&self, receiver_id: Uuid) -> ChatResult<UnreadIndex> {
        let by_sender = self.log.unread_by_sender(receiver_id).await?;
        let index = UnreadIndex { by_sender };
        debug!("Unread for {}: {} total", receiver_id, index.total());
        Ok(index)
    }
}
