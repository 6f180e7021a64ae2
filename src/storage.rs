use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use uuid::Uuid;

use crate::models::{Attachment, ConversationSummary, Message, MessageKind, UserProfile};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, kind, body, attachment_url, \
     attachment_name, attachment_size, created_at, is_read";

/// SQLite persistence for users and the append-only message table.
pub struct Storage {
    conn: Connection,
    last_created_at: i64,
}

impl Storage {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // readers on a second connection must not wait behind the writer
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                user_id TEXT PRIMARY KEY REFERENCES users(id),
                token_hash TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                attachment_url TEXT,
                attachment_name TEXT,
                attachment_size INTEGER,
                created_at INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                CHECK ((kind = 'text') = (attachment_url IS NULL))
            );

            CREATE INDEX IF NOT EXISTS idx_messages_unread
                ON messages(receiver_id, is_read);
            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender_id, receiver_id, created_at);",
        )?;
        let last_created_at: i64 =
            conn.query_row("SELECT COALESCE(MAX(created_at), 0) FROM messages", [], |row| {
                row.get(0)
            })?;
        Ok(Storage {
            conn,
            last_created_at,
        })
    }

    pub fn save_user(&self, user: &UserProfile) -> Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, username, display_name, email) VALUES (?1, ?2, ?3, ?4)",
            (
                &user.id.to_string(),
                &user.username,
                &user.display_name,
                &user.email,
            ),
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &Uuid) -> Result<Option<UserProfile>> {
        self.conn
            .query_row(
                "SELECT id, username, display_name, email FROM users WHERE id = ?1",
                [id.to_string()],
                user_from_row,
            )
            .optional()
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<UserProfile> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, username, display_name, email FROM users WHERE username = ?1")?;
        stmt.query_row([username], user_from_row)
    }

    pub fn save_credential(&self, user_id: &Uuid, token_hash: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO credentials (user_id, token_hash) VALUES (?1, ?2)",
            [user_id.to_string(), token_hash.to_string()],
        )?;
        Ok(())
    }

    pub fn credential_hash(&self, user_id: &Uuid) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT token_hash FROM credentials WHERE user_id = ?1",
                [user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
    }

    /// Every user other than `id`, by username.
    pub fn list_users_except(&self, id: &Uuid) -> Result<Vec<UserProfile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, username, display_name, email FROM users
             WHERE id != ?1 ORDER BY username",
        )?;
        let rows = stmt.query_map([id.to_string()], user_from_row)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Server-assigned creation time. Strictly increasing across calls so
    /// that `(created_at, id)` order matches append order.
    pub fn next_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let micros = now.timestamp_micros().max(self.last_created_at + 1);
        self.last_created_at = micros;
        micros_to_datetime(micros)
    }

    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let (url, name, size) = match &message.attachment {
            Some(a) => (Some(&a.url), Some(&a.name), Some(a.size_bytes as i64)),
            None => (None, None, None),
        };
        self.conn.execute(
            "INSERT INTO messages
             (id, sender_id, receiver_id, kind, body, attachment_url, attachment_name,
              attachment_size, created_at, is_read)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id.to_string(),
                message.sender_id.to_string(),
                message.receiver_id.to_string(),
                message.kind.as_str(),
                message.body,
                url,
                name,
                size,
                message.created_at.timestamp_micros(),
                message.read as i32,
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: &Uuid) -> Result<Option<Message>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                [id.to_string()],
                message_from_row,
            )
            .optional()
    }

    /// All messages between `a` and `b` in either direction, oldest first.
    pub fn transcript(&self, a: &Uuid, b: &Uuid) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, id ASC",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map([a.to_string(), b.to_string()], message_from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Flags every unread message from `sender_id` to `receiver_id` as read.
    /// Returns the number of rows that changed.
    pub fn mark_read(&self, sender_id: &Uuid, receiver_id: &Uuid) -> Result<usize> {
        self.conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
            [sender_id.to_string(), receiver_id.to_string()],
        )
    }

    /// Like [`mark_read`](Self::mark_read), limited to messages created at or
    /// before `through`.
    pub fn mark_read_through(
        &self,
        sender_id: &Uuid,
        receiver_id: &Uuid,
        through: DateTime<Utc>,
    ) -> Result<usize> {
        self.conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE sender_id = ?1 AND receiver_id = ?2 AND is_read = 0 AND created_at <= ?3",
            params![
                sender_id.to_string(),
                receiver_id.to_string(),
                through.timestamp_micros()
            ],
        )
    }

    /// Flags a single message as read. Only the receiver may do so.
    pub fn mark_message_read(&self, id: &Uuid, receiver_id: &Uuid) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE messages SET is_read = 1
             WHERE id = ?1 AND receiver_id = ?2 AND is_read = 0",
            [id.to_string(), receiver_id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn count_unread(&self, receiver_id: &Uuid, sender_id: Option<&Uuid>) -> Result<u64> {
        let count: i64 = match sender_id {
            Some(sender) => self.conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND is_read = 0",
                [receiver_id.to_string(), sender.to_string()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
                [receiver_id.to_string()],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }

    pub fn unread_by_sender(&self, receiver_id: &Uuid) -> Result<BTreeMap<Uuid, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT sender_id, COUNT(*) FROM messages
             WHERE receiver_id = ?1 AND is_read = 0
             GROUP BY sender_id",
        )?;
        let rows = stmt.query_map([receiver_id.to_string()], |row| {
            Ok((uuid_column(row, 0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let (sender, count) = row?;
            counts.insert(sender, count);
        }
        Ok(counts)
    }

    /// One entry per counterparty of `user`, most recent conversation first.
    pub fn conversations(&self, user: &Uuid) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE sender_id = ?1 OR receiver_id = ?1
             ORDER BY created_at DESC, id DESC",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map([user.to_string()], message_from_row)?;

        let mut summaries: Vec<ConversationSummary> = Vec::new();
        for row in rows {
            let message = row?;
            let counterparty_id = message.counterparty(*user);
            if summaries.iter().any(|s| s.counterparty_id == counterparty_id) {
                continue;
            }
            summaries.push(ConversationSummary {
                counterparty_id,
                last_message: message,
                unread_count: 0,
            });
        }
        let unread = self.unread_by_sender(user)?;
        for summary in &mut summaries {
            summary.unread_count = unread.get(&summary.counterparty_id).copied().unwrap_or(0);
        }
        Ok(summaries)
    }
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default()
}

fn uuid_column(row: &Row<'_>, idx: usize) -> Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn user_from_row(row: &Row<'_>) -> Result<UserProfile> {
    Ok(UserProfile {
        id: uuid_column(row, 0)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        email: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> Result<Message> {
    let kind: String = row.get(3)?;
    let kind = kind.parse::<MessageKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })?;
    let attachment = match row.get::<_, Option<String>>(5)? {
        Some(url) => Some(Attachment {
            url,
            name: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            size_bytes: row.get::<_, Option<i64>>(7)?.unwrap_or(0) as u64,
        }),
        None => None,
    };
    Ok(Message {
        id: uuid_column(row, 0)?,
        sender_id: uuid_column(row, 1)?,
        receiver_id: uuid_column(row, 2)?,
        kind,
        body: row.get(4)?,
        attachment,
        created_at: micros_to_datetime(row.get(8)?),
        read: row.get::<_, i32>(9)? != 0,
    })
}
