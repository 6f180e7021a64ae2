use std::collections::HashSet;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatResult;
use crate::markup::{render_text, Span};
use crate::message_log::MessageLog;
use crate::models::{Message, MessageKind};

/// A message as the open conversation shows it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RenderedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub spans: Vec<Span>,
}

impl From<Message> for RenderedMessage {
    fn from(message: Message) -> Self {
        let spans = match message.kind {
            MessageKind::Text => render_text(&message.body),
            _ => Vec::new(),
        };
        RenderedMessage { message, spans }
    }
}

/// Identifies one `open` request. Results carrying an older generation are
/// discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenTicket {
    pub user_id: Uuid,
    pub counterparty_id: Uuid,
    generation: u64,
}

#[derive(Debug)]
pub struct LoadedTranscript {
    ticket: OpenTicket,
    messages: Vec<Message>,
}

struct OpenConversation {
    counterparty_id: Uuid,
    transcript: Vec<RenderedMessage>,
    seen: HashSet<Uuid>,
}

/// Owns the selected counterparty and its materialized transcript.
///
/// Opening goes through three steps so the load can run off the actor:
/// [`begin_open`](Self::begin_open) picks the counterparty,
/// [`load`](Self::load) reads the transcript and marks it read, and
/// [`finish_open`](Self::finish_open) installs it if nothing newer was
/// opened meanwhile.
pub struct ConversationReader {
    log: MessageLog,
    generation: u64,
    pending: Option<OpenTicket>,
    buffered: Vec<Message>,
    open: Option<OpenConversation>,
}

impl ConversationReader {
    pub fn new(log: MessageLog) -> Self {
        ConversationReader {
            log,
            generation: 0,
            pending: None,
            buffered: Vec::new(),
            open: None,
        }
    }

    /// Counterparty of the conversation on screen, or being opened.
    pub fn counterparty(&self) -> Option<Uuid> {
        self.pending
            .map(|t| t.counterparty_id)
            .or_else(|| self.open.as_ref().map(|o| o.counterparty_id))
    }

    pub fn transcript(&self) -> &[RenderedMessage] {
        self.open
            .as_ref()
            .map(|o| o.transcript.as_slice())
            .unwrap_or_default()
    }

    pub fn begin_open(&mut self, user_id: Uuid, counterparty_id: Uuid) -> OpenTicket {
        self.generation += 1;
        let ticket = OpenTicket {
            user_id,
            counterparty_id,
            generation: self.generation,
        };
        self.pending = Some(ticket);
        self.buffered.clear();
        self.open = None;
        ticket
    }

    /// Reads the transcript, then marks the counterparty's messages in it
    /// read.
    pub async fn load(log: MessageLog, ticket: OpenTicket) -> ChatResult<LoadedTranscript> {
        let messages = log.transcript(ticket.user_id, ticket.counterparty_id).await?;
        Self::mark_loaded_read(&log, ticket, messages).await
    }

    /// Only rows up to the newest loaded one are flagged. A message appended
    /// after the transcript was read stays unread until it is shown.
    async fn mark_loaded_read(
        log: &MessageLog,
        ticket: OpenTicket,
        mut messages: Vec<Message>,
    ) -> ChatResult<LoadedTranscript> {
        let changed = match messages.last() {
            Some(newest) => {
                log.mark_read_through(ticket.counterparty_id, ticket.user_id, newest.created_at)
                    .await?
            }
            None => 0,
        };
        for message in &mut messages {
            if message.sender_id == ticket.counterparty_id {
                message.read = true;
            }
        }
        debug!(
            "Loaded {} messages with {} ({} marked read)",
            messages.len(),
            ticket.counterparty_id,
            changed
        );
        Ok(LoadedTranscript { ticket, messages })
    }

    /// Installs a loaded transcript. Returns false when the result is stale.
    pub fn finish_open(&mut self, loaded: LoadedTranscript) -> bool {
        if self.pending != Some(loaded.ticket) {
            debug!(
                "Discarding stale transcript for {}",
                loaded.ticket.counterparty_id
            );
            return false;
        }
        self.pending = None;

        let mut seen = HashSet::new();
        let mut transcript = Vec::with_capacity(loaded.messages.len());
        let arrived = std::mem::take(&mut self.buffered);
        for message in loaded.messages.into_iter().chain(arrived) {
            if seen.insert(message.id) {
                transcript.push(RenderedMessage::from(message));
            }
        }
        info!(
            "Opened conversation with {} ({} messages)",
            loaded.ticket.counterparty_id,
            transcript.len()
        );
        self.open = Some(OpenConversation {
            counterparty_id: loaded.ticket.counterparty_id,
            transcript,
            seen,
        });
        true
    }

    /// Convenience for callers that do not need to run the load elsewhere.
    pub async fn open(&mut self, user_id: Uuid, counterparty_id: Uuid) -> ChatResult<&[RenderedMessage]> {
        let ticket = self.begin_open(user_id, counterparty_id);
        let loaded = Self::load(self.log.clone(), ticket).await?;
        self.finish_open(loaded);
        Ok(self.transcript())
    }

    pub fn close(&mut self) {
        self.generation += 1;
        self.pending = None;
        self.buffered.clear();
        self.open = None;
    }

    /// Takes a pushed or just-sent message. Messages of the open pair are
    /// appended in arrival order without touching what is already shown;
    /// duplicates are ignored. When `foregrounded`, a message from the
    /// counterparty is marked read on arrival.
    pub async fn receive(
        &mut self,
        user_id: Uuid,
        mut message: Message,
        foregrounded: bool,
    ) -> ChatResult<Option<RenderedMessage>> {
        let Some(counterparty_id) = self.counterparty() else {
            return Ok(None);
        };
        if !message.is_between(user_id, counterparty_id) {
            return Ok(None);
        }
        if foregrounded && message.sender_id == counterparty_id && !message.read {
            self.log.mark_message_read(message.id, user_id).await?;
            message.read = true;
        }

        match self.open.as_mut() {
            Some(open) if open.counterparty_id == counterparty_id => {
                if !open.seen.insert(message.id) {
                    return Ok(None);
                }
                let rendered = RenderedMessage::from(message);
                open.transcript.push(rendered.clone());
                Ok(Some(rendered))
            }
            _ => {
                if !self.buffered.iter().any(|m| m.id == message.id) {
                    self.buffered.push(message);
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryHub;
    use crate::storage::Storage;

    fn setup_log() -> MessageLog {
        let storage = Storage::new(":memory:").unwrap();
        MessageLog::new(storage, DeliveryHub::new(16))
    }

    async fn send(log: &MessageLog, from: Uuid, to: Uuid, body: &str) -> Message {
        log.append(from, to, MessageKind::Text, body, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_marks_counterparty_messages_read() {
        let log = setup_log();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        send(&log, y, x, "mine").await;
        for body in ["1", "2", "3"] {
            send(&log, x, y, body).await;
        }

        let mut reader = ConversationReader::new(log.clone());
        let transcript = reader.open(y, x).await.unwrap();
        assert_eq!(transcript.len(), 4);
        assert!(transcript
            .iter()
            .filter(|m| m.message.sender_id == x)
            .all(|m| m.message.read));
        assert_eq!(log.count_unread(y, Some(x)).await.unwrap(), 0);
        // what y sent to x stays unread for x
        assert_eq!(log.count_unread(x, Some(y)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_receive_appends_without_resorting() {
        let log = setup_log();
        let (x, y, z) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        send(&log, x, y, "before").await;
        let mut reader = ConversationReader::new(log.clone());
        reader.open(y, x).await.unwrap();

        let late = send(&log, x, y, "late").await;
        let early = Message {
            created_at: late.created_at - chrono::Duration::seconds(60),
            id: Uuid::new_v4(),
            ..late.clone()
        };
        assert!(reader.receive(y, late.clone(), false).await.unwrap().is_some());
        assert!(reader.receive(y, early.clone(), false).await.unwrap().is_some());
        // redelivery is ignored
        assert!(reader.receive(y, late.clone(), false).await.unwrap().is_none());
        // other conversations are ignored
        let other = send(&log, z, y, "elsewhere").await;
        assert!(reader.receive(y, other, true).await.unwrap().is_none());

        let ids: Vec<Uuid> = reader.transcript().iter().map(|m| m.message.id).collect();
        assert_eq!(ids[1..], [late.id, early.id]);
        assert_eq!(log.count_unread(y, Some(x)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_foreground_receive_marks_read() {
        let log = setup_log();
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        let mut reader = ConversationReader::new(log.clone());
        reader.open(y, x).await.unwrap();

        let incoming = send(&log, x, y, "hey").await;
        let rendered = reader.receive(y, incoming, true).await.unwrap().unwrap();
        assert!(rendered.message.read);
        assert_eq!(log.count_unread(y, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_load_is_discarded() {
        let log = setup_log();
        let (me, x, z) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        send(&log, x, me, "from x").await;
        send(&log, z, me, "from z").await;

        let mut reader = ConversationReader::new(log.clone());
        let first = reader.begin_open(me, x);
        let second = reader.begin_open(me, z);
        let stale = ConversationReader::load(log.clone(), first).await.unwrap();
        let fresh = ConversationReader::load(log.clone(), second).await.unwrap();

        assert!(!reader.finish_open(stale));
        assert!(reader.finish_open(fresh));
        assert_eq!(reader.counterparty(), Some(z));
        assert_eq!(reader.transcript()[0].message.body, "from z");
        // the cancelled load's mark_read still landed
        assert_eq!(log.count_unread(me, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_messages_during_load_are_kept_once() {
        let log = setup_log();
        let (me, x) = (Uuid::new_v4(), Uuid::new_v4());
        let mut reader = ConversationReader::new(log.clone());
        let ticket = reader.begin_open(me, x);

        let during = send(&log, x, me, "during").await;
        reader.receive(me, during.clone(), false).await.unwrap();
        let loaded = ConversationReader::load(log.clone(), ticket).await.unwrap();
        assert!(reader.finish_open(loaded));

        let bodies: Vec<&str> = reader
            .transcript()
            .iter()
            .map(|m| m.message.body.as_str())
            .collect();
        assert_eq!(bodies, vec!["during"]);
    }

    #[tokio::test]
    async fn test_message_appended_mid_load_stays_unread() {
        let log = setup_log();
        let (me, x) = (Uuid::new_v4(), Uuid::new_v4());
        send(&log, x, me, "old").await;

        let mut reader = ConversationReader::new(log.clone());
        let ticket = reader.begin_open(me, x);
        let snapshot = log.transcript(me, x).await.unwrap();
        // lands between the transcript read and the read-marking; its push is lost
        let raced = send(&log, x, me, "raced").await;
        let loaded = ConversationReader::mark_loaded_read(&log, ticket, snapshot)
            .await
            .unwrap();
        assert!(reader.finish_open(loaded));

        assert!(reader.transcript().iter().all(|m| m.message.id != raced.id));
        assert_eq!(log.count_unread(me, Some(x)).await.unwrap(), 1);

        // reopening picks it up
        let bodies: Vec<String> = reader
            .open(me, x)
            .await
            .unwrap()
            .iter()
            .map(|m| m.message.body.clone())
            .collect();
        assert_eq!(bodies, vec!["old", "raced"]);
        assert_eq!(log.count_unread(me, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_drops_conversation() {
        let log = setup_log();
        let (me, x) = (Uuid::new_v4(), Uuid::new_v4());
        let mut reader = ConversationReader::new(log.clone());
        reader.open(me, x).await.unwrap();
        reader.close();
        assert_eq!(reader.counterparty(), None);
        assert!(reader.transcript().is_empty());
        let msg = send(&log, x, me, "later").await;
        assert!(reader.receive(me, msg, true).await.unwrap().is_none());
        assert_eq!(log.count_unread(me, None).await.unwrap(), 1);
    }

    #[test]
    fn test_rendered_message_spans() {
        let message = Message {
            id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            body: "**hi**".to_string(),
            kind: MessageKind::Text,
            attachment: None,
            created_at: chrono::Utc::now(),
            read: false,
        };
        let rendered = RenderedMessage::from(message);
        assert_eq!(rendered.spans, vec![Span::Bold { text: "hi".into() }]);
    }
}
