use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::debug;
use tokio::task;
use uuid::Uuid;

use crate::delivery::DeliveryHub;
use crate::error::{ChatError, ChatResult};
use crate::models::{Attachment, ConversationSummary, Message, MessageKind};
use crate::storage::Storage;

type SharedStorage = Arc<Mutex<Storage>>;

/// Append-only message log; the single writer of record.
///
/// Appends are serialized: the timestamp, the insert and the publish on the
/// delivery hub happen under one ordering lock, so each receiver's feed sees
/// events in the order the rows were written. Reads and read-marking do not
/// take that lock. All SQLite work runs on the blocking pool.
#[derive(Clone)]
pub struct MessageLog {
    writer: SharedStorage,
    reader: SharedStorage,
    append_order: Arc<tokio::sync::Mutex<()>>,
    hub: DeliveryHub,
}

impl MessageLog {
    /// A log over a single connection used for reads and writes.
    pub fn new(storage: Storage, hub: DeliveryHub) -> Self {
        let shared = Arc::new(Mutex::new(storage));
        MessageLog {
            writer: Arc::clone(&shared),
            reader: shared,
            append_order: Arc::new(tokio::sync::Mutex::new(())),
            hub,
        }
    }

    /// Opens `db_path` with a writer connection and a separate reader
    /// connection. An in-memory database is private to its connection, so
    /// it gets a single one.
    pub fn open(db_path: &str, hub: DeliveryHub) -> ChatResult<Self> {
        let writer = Storage::new(db_path)?;
        if db_path == ":memory:" {
            return Ok(Self::new(writer, hub));
        }
        let reader = Storage::new(db_path)?;
        Ok(MessageLog {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            append_order: Arc::new(tokio::sync::Mutex::new(())),
            hub,
        })
    }

    pub fn hub(&self) -> &DeliveryHub {
        &self.hub
    }

    pub async fn append(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        kind: MessageKind,
        body: &str,
        attachment: Option<Attachment>,
    ) -> ChatResult<Message> {
        check_shape(kind, body, attachment.as_ref())?;

        let _order = self.append_order.lock().await;
        let body = body.to_string();
        let message = blocking(&self.writer, move |storage| {
            let message = Message {
                id: Uuid::new_v4(),
                sender_id,
                receiver_id,
                body,
                kind,
                attachment,
                created_at: storage.next_timestamp(Utc::now()),
                read: false,
            };
            storage.insert_message(&message)?;
            Ok(message)
        })
        .await?;
        let delivered = self.hub.publish(&message).await;
        debug!(
            "Appended {} message {} from {} to {} ({} live connections)",
            kind, message.id, sender_id, receiver_id, delivered
        );
        Ok(message)
    }

    pub async fn transcript(&self, user_a: Uuid, user_b: Uuid) -> ChatResult<Vec<Message>> {
        blocking(&self.reader, move |storage| Ok(storage.transcript(&user_a, &user_b)?)).await
    }

    pub async fn mark_read(&self, sender_id: Uuid, receiver_id: Uuid) -> ChatResult<usize> {
        let changed = blocking(&self.writer, move |storage| {
            Ok(storage.mark_read(&sender_id, &receiver_id)?)
        })
        .await?;
        if changed > 0 {
            debug!("Marked {} messages from {} to {} read", changed, sender_id, receiver_id);
        }
        Ok(changed)
    }

    /// Marks read only what was created at or before `through`; messages
    /// appended later keep their unread flag.
    pub async fn mark_read_through(
        &self,
        sender_id: Uuid,
        receiver_id: Uuid,
        through: DateTime<Utc>,
    ) -> ChatResult<usize> {
        blocking(&self.writer, move |storage| {
            Ok(storage.mark_read_through(&sender_id, &receiver_id, through)?)
        })
        .await
    }

    pub async fn mark_message_read(&self, message_id: Uuid, receiver_id: Uuid) -> ChatResult<bool> {
        blocking(&self.writer, move |storage| {
            Ok(storage.mark_message_read(&message_id, &receiver_id)?)
        })
        .await
    }

    pub async fn count_unread(&self, receiver_id: Uuid, sender_id: Option<Uuid>) -> ChatResult<u64> {
        blocking(&self.reader, move |storage| {
            Ok(storage.count_unread(&receiver_id, sender_id.as_ref())?)
        })
        .await
    }

    pub async fn unread_by_sender(&self, receiver_id: Uuid) -> ChatResult<BTreeMap<Uuid, u64>> {
        blocking(&self.reader, move |storage| Ok(storage.unread_by_sender(&receiver_id)?)).await
    }

    pub async fn conversations(&self, user: Uuid) -> ChatResult<Vec<ConversationSummary>> {
        blocking(&self.reader, move |storage| Ok(storage.conversations(&user)?)).await
    }
}

async fn blocking<T, F>(storage: &SharedStorage, f: F) -> ChatResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Storage) -> ChatResult<T> + Send + 'static,
{
    let storage = Arc::clone(storage);
    task::spawn_blocking(move || {
        let mut storage = storage
            .lock()
            .map_err(|_| ChatError::Task("storage lock poisoned".into()))?;
        f(&mut *storage)
    })
    .await?
}

fn check_shape(kind: MessageKind, body: &str, attachment: Option<&Attachment>) -> ChatResult<()> {
    match (kind, attachment) {
        (MessageKind::Text, None) if body.trim().is_empty() => {
            Err(ChatError::Validation("text message body is empty".into()))
        }
        (MessageKind::Text, None) => Ok(()),
        (MessageKind::Text, Some(_)) => Err(ChatError::Validation(
            "text messages cannot carry an attachment".into(),
        )),
        (kind, None) => Err(ChatError::Validation(format!(
            "{} message is missing its attachment",
            kind
        ))),
        (_, Some(_)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_log() -> MessageLog {
        MessageLog::new(Storage::new(":memory:").unwrap(), DeliveryHub::new(16))
    }

    fn attachment() -> Attachment {
        Attachment {
            url: "http://files/a.png".to_string(),
            name: "a.png".to_string(),
            size_bytes: 10,
        }
    }

    #[tokio::test]
    async fn test_append_rejects_empty_text() {
        let log = setup_log();
        let result = log
            .append(Uuid::new_v4(), Uuid::new_v4(), MessageKind::Text, "  ", None)
            .await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn test_append_requires_attachment_for_files() {
        let log = setup_log();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let missing = log.append(a, b, MessageKind::Image, "a.png", None).await;
        assert!(matches!(missing, Err(ChatError::Validation(_))));
        let extra = log
            .append(a, b, MessageKind::Text, "hi", Some(attachment()))
            .await;
        assert!(matches!(extra, Err(ChatError::Validation(_))));
        assert!(log.transcript(a, b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_publishes_to_receiver() {
        let log = setup_log();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sub = log.hub().subscribe(b).await;
        let sent = log
            .append(a, b, MessageKind::Image, "a.png", Some(attachment()))
            .await
            .unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.message, sent);
        assert!(!event.message.read);
    }

    #[tokio::test]
    async fn test_mark_read_twice_matches_once() {
        let log = setup_log();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        for body in ["1", "2", "3"] {
            log.append(x, y, MessageKind::Text, body, None).await.unwrap();
        }
        assert_eq!(log.mark_read(x, y).await.unwrap(), 3);
        let after_once = log.transcript(x, y).await.unwrap();
        assert_eq!(log.mark_read(x, y).await.unwrap(), 0);
        assert_eq!(log.transcript(x, y).await.unwrap(), after_once);
        assert_eq!(log.count_unread(y, Some(x)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_through_spares_later_messages() {
        let log = setup_log();
        let (x, me) = (Uuid::new_v4(), Uuid::new_v4());
        log.append(x, me, MessageKind::Text, "seen", None).await.unwrap();
        let loaded = log.transcript(me, x).await.unwrap();
        log.append(x, me, MessageKind::Text, "raced", None).await.unwrap();

        let through = loaded.last().unwrap().created_at;
        assert_eq!(log.mark_read_through(x, me, through).await.unwrap(), 1);
        assert_eq!(log.count_unread(me, Some(x)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reads_do_not_wait_for_appends() {
        let log = setup_log();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        log.append(x, y, MessageKind::Text, "hi", None).await.unwrap();

        let _held = log.append_order.lock().await;
        let read = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            (
                log.transcript(x, y).await.unwrap().len(),
                log.count_unread(y, None).await.unwrap(),
                log.mark_read(x, y).await.unwrap(),
            )
        })
        .await
        .unwrap();
        assert_eq!(read, (1, 1, 1));
    }

    #[tokio::test]
    async fn test_file_database_uses_separate_reader() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chat.db");
        let log = MessageLog::open(path.to_str().unwrap(), DeliveryHub::new(4)).unwrap();
        assert!(!Arc::ptr_eq(&log.writer, &log.reader));

        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let sent = log.append(x, y, MessageKind::Text, "persisted", None).await.unwrap();
        assert_eq!(log.transcript(x, y).await.unwrap(), vec![sent]);
        assert_eq!(log.count_unread(y, Some(x)).await.unwrap(), 1);

        let reopened = MessageLog::open(path.to_str().unwrap(), DeliveryHub::new(4)).unwrap();
        let later = reopened.append(x, y, MessageKind::Text, "after restart", None).await.unwrap();
        let transcript = reopened.transcript(x, y).await.unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[1].id, later.id);
    }
}
