//! SQLite-backed implementation of every repository trait.

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{ChatRepository, MessageRepository, RepoError, SyncRepository, UserRepository};
use crate::db::models::{
    ChannelSyncState, Chat, ChatKind, Message, NewMessage, SyncState, User,
};
use crate::db::DbPool;

const MESSAGE_COLUMNS: &str = "id, message_id, chat_id, sender_id, message_type, content, \
     reply_to, pts, is_read, created_at, edited_at";

const CHAT_COLUMNS: &str = "id, kind, title, created_by, created_at";

const USER_COLUMNS: &str = "id, username, last_seen, typing_indicators_enabled, \
     read_receipts_enabled, voice_messages_enabled, created_at";

/// Repository facade over the shared SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Connection) -> Result<T, RepoError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| RepoError::Poisoned)?;
            f(&mut conn)
        })
        .await?
    }

    /// Create a user with every privacy flag enabled.
    /// Account management lives outside this server; this exists for seeding.
    pub async fn create_user(&self, username: &str) -> Result<User, RepoError> {
        let username = username.to_string();
        self.blocking(move |conn| {
            let now = chrono::Utc::now().timestamp();
            conn.execute(
                "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
                params![username, now],
            )
            .map_err(map_unique)?;
            let id = conn.last_insert_rowid();
            let user = conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )?;
            Ok(user)
        })
        .await
    }

    /// Update a user's privacy preferences.
    pub async fn set_privacy(
        &self,
        user_id: i64,
        typing_indicators: bool,
        read_receipts: bool,
        voice_messages: bool,
    ) -> Result<(), RepoError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE users SET typing_indicators_enabled = ?2, read_receipts_enabled = ?3,
                        voice_messages_enabled = ?4
                 WHERE id = ?1",
                params![user_id, typing_indicators, read_receipts, voice_messages],
            )?;
            if changed == 0 {
                return Err(RepoError::NotFound);
            }
            Ok(())
        })
        .await
    }

    /// Soft-delete a message; deleted rows are skipped by the difference queries.
    pub async fn soft_delete_message(&self, id: i64) -> Result<(), RepoError> {
        self.blocking(move |conn| {
            conn.execute("UPDATE messages SET deleted = 1 WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }
}

/// Map a UNIQUE constraint failure to `RepoError::Duplicate`.
fn map_unique(err: rusqlite::Error) -> RepoError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            RepoError::Duplicate
        }
        _ => RepoError::Database(err),
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        message_id: row.get(1)?,
        chat_id: row.get(2)?,
        sender_id: row.get(3)?,
        message_type: row.get(4)?,
        content: row.get(5)?,
        reply_to: row.get(6)?,
        pts: row.get(7)?,
        is_read: row.get::<_, i64>(8)? != 0,
        created_at: row.get(9)?,
        edited_at: row.get(10)?,
    })
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    let kind: String = row.get(1)?;
    Ok(Chat {
        id: row.get(0)?,
        kind: ChatKind::parse(&kind).unwrap_or(ChatKind::Group),
        title: row.get(2)?,
        created_by: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        last_seen: row.get(2)?,
        typing_indicators_enabled: row.get::<_, i64>(3)? != 0,
        read_receipts_enabled: row.get::<_, i64>(4)? != 0,
        voice_messages_enabled: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

fn load_message(conn: &Connection, id: i64) -> Result<Option<Message>, RepoError> {
    Ok(conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id],
            message_from_row,
        )
        .optional()?)
}

fn load_chat(conn: &Connection, id: i64) -> Result<Option<Chat>, RepoError> {
    Ok(conn
        .query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            params![id],
            chat_from_row,
        )
        .optional()?)
}

#[async_trait]
impl MessageRepository for SqliteStore {
    async fn create(&self, message: NewMessage) -> Result<Message, RepoError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            // Counter bump and insert commit together; a duplicate rolls both back.
            let pts: i64 = tx.query_row(
                "UPDATE pts_counter SET value = value + 1 WHERE id = 1 RETURNING value",
                [],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages (message_id, chat_id, sender_id, message_type, content,
                                       reply_to, pts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.message_id,
                    message.chat_id,
                    message.sender_id,
                    message.message_type,
                    message.content,
                    message.reply_to,
                    pts,
                    message.created_at,
                ],
            )
            .map_err(map_unique)?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            Ok(Message {
                id,
                message_id: message.message_id,
                chat_id: message.chat_id,
                sender_id: message.sender_id,
                message_type: message.message_type,
                content: message.content,
                reply_to: message.reply_to,
                pts,
                is_read: false,
                created_at: message.created_at,
                edited_at: None,
            })
        })
        .await
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Message>, RepoError> {
        self.blocking(move |conn| load_message(conn, id)).await
    }

    async fn get_by_uuid(&self, message_id: &str) -> Result<Option<Message>, RepoError> {
        let message_id = message_id.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE message_id = ?1 AND deleted = 0"
                    ),
                    params![message_id],
                    message_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn update_content(
        &self,
        id: i64,
        content: &str,
        edited_at: i64,
    ) -> Result<Message, RepoError> {
        let content = content.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1 AND deleted = 0",
                params![id, content, edited_at],
            )?;
            if changed == 0 {
                return Err(RepoError::NotFound);
            }
            load_message(conn, id)?.ok_or(RepoError::NotFound)
        })
        .await
    }

    async fn mark_read_up_to(
        &self,
        chat_id: i64,
        reader_id: i64,
        up_to_pts: i64,
    ) -> Result<usize, RepoError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE chat_id = ?1 AND sender_id != ?2 AND pts <= ?3
                   AND is_read = 0 AND deleted = 0",
                params![chat_id, reader_id, up_to_pts],
            )?;
            Ok(changed)
        })
        .await
    }
}

#[async_trait]
impl ChatRepository for SqliteStore {
    async fn is_member(&self, chat_id: i64, user_id: i64) -> Result<bool, RepoError> {
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn get_members(&self, chat_id: i64) -> Result<Vec<i64>, RepoError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM chat_members WHERE chat_id = ?1 ORDER BY joined_at, user_id",
            )?;
            let members = stmt
                .query_map(params![chat_id], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(members)
        })
        .await
    }

    async fn get_or_create_private_chat(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<(Chat, bool), RepoError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            let existing = tx
                .query_row(
                    "SELECT c.id, c.kind, c.title, c.created_by, c.created_at
                     FROM chats c
                     JOIN chat_members a ON a.chat_id = c.id AND a.user_id = ?1
                     JOIN chat_members b ON b.chat_id = c.id AND b.user_id = ?2
                     WHERE c.kind = 'private'
                     ORDER BY c.id
                     LIMIT 1",
                    params![user_a, user_b],
                    chat_from_row,
                )
                .optional()?;
            if let Some(chat) = existing {
                return Ok((chat, false));
            }

            let now = chrono::Utc::now().timestamp();
            tx.execute(
                "INSERT INTO chats (kind, created_by, created_at) VALUES ('private', ?1, ?2)",
                params![user_a, now],
            )?;
            let chat_id = tx.last_insert_rowid();
            for user_id in [user_a, user_b] {
                tx.execute(
                    "INSERT OR IGNORE INTO chat_members (chat_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    params![chat_id, user_id, now],
                )?;
            }
            let chat = load_chat(&tx, chat_id)?.ok_or(RepoError::NotFound)?;
            tx.commit()?;
            Ok((chat, true))
        })
        .await
    }

    async fn get_by_id(&self, chat_id: i64) -> Result<Option<Chat>, RepoError> {
        self.blocking(move |conn| load_chat(conn, chat_id)).await
    }

    async fn create(
        &self,
        kind: ChatKind,
        title: Option<String>,
        created_by: i64,
    ) -> Result<Chat, RepoError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let now = chrono::Utc::now().timestamp();
            tx.execute(
                "INSERT INTO chats (kind, title, created_by, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![kind.as_str(), title, created_by, now],
            )?;
            let chat_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO chat_members (chat_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                params![chat_id, created_by, now],
            )?;
            let chat = load_chat(&tx, chat_id)?.ok_or(RepoError::NotFound)?;
            tx.commit()?;
            Ok(chat)
        })
        .await
    }

    async fn add_member(&self, chat_id: i64, user_id: i64) -> Result<(), RepoError> {
        self.blocking(move |conn| {
            let now = chrono::Utc::now().timestamp();
            conn.execute(
                "INSERT OR IGNORE INTO chat_members (chat_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![chat_id, user_id, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn chat_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>, RepoError> {
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT chat_id FROM chat_members WHERE user_id = ?1 ORDER BY chat_id")?;
            let ids = stmt
                .query_map(params![user_id], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl UserRepository for SqliteStore {
    async fn get_by_id(&self, user_id: i64) -> Result<Option<User>, RepoError> {
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                    params![user_id],
                    user_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn update_last_seen(&self, user_id: i64, at: i64) -> Result<(), RepoError> {
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE users SET last_seen = ?2 WHERE id = ?1",
                params![user_id, at],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SyncRepository for SqliteStore {
    async fn get_state(&self, user_id: i64) -> Result<Option<SyncState>, RepoError> {
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT pts, date FROM sync_states WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        Ok(SyncState {
                            pts: row.get(0)?,
                            date: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn advance_state(&self, user_id: i64, pts: i64, date: i64) -> Result<SyncState, RepoError> {
        self.blocking(move |conn| {
            // SET expressions see the pre-update row, so the CASE compares against the old pts
            let state = conn.query_row(
                "INSERT INTO sync_states (user_id, pts, date) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                     pts = MAX(pts, excluded.pts),
                     date = CASE WHEN excluded.pts > pts THEN excluded.date ELSE date END
                 RETURNING pts, date",
                params![user_id, pts, date],
                |row| {
                    Ok(SyncState {
                        pts: row.get(0)?,
                        date: row.get(1)?,
                    })
                },
            )?;
            Ok(state)
        })
        .await
    }

    async fn get_channel_state(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<ChannelSyncState>, RepoError> {
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT pts, date FROM channel_sync_states WHERE user_id = ?1 AND chat_id = ?2",
                    params![user_id, chat_id],
                    |row| {
                        Ok(ChannelSyncState {
                            user_id,
                            chat_id,
                            pts: row.get(0)?,
                            date: row.get(1)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn advance_channel_state(
        &self,
        user_id: i64,
        chat_id: i64,
        pts: i64,
        date: i64,
    ) -> Result<ChannelSyncState, RepoError> {
        self.blocking(move |conn| {
            let state = conn.query_row(
                "INSERT INTO channel_sync_states (user_id, chat_id, pts, date) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, chat_id) DO UPDATE SET
                     pts = MAX(pts, excluded.pts),
                     date = CASE WHEN excluded.pts > pts THEN excluded.date ELSE date END
                 RETURNING pts, date",
                params![user_id, chat_id, pts, date],
                |row| {
                    Ok(ChannelSyncState {
                        user_id,
                        chat_id,
                        pts: row.get(0)?,
                        date: row.get(1)?,
                    })
                },
            )?;
            Ok(state)
        })
        .await
    }

    async fn messages_since(
        &self,
        chat_ids: &[i64],
        from_pts: i64,
        limit: usize,
    ) -> Result<Vec<Message>, RepoError> {
        if chat_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let chat_ids = chat_ids.to_vec();
        self.blocking(move |conn| {
            let placeholders = vec!["?"; chat_ids.len()].join(", ");
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE deleted = 0 AND pts > ? AND chat_id IN ({placeholders})
                 ORDER BY pts ASC
                 LIMIT ?"
            );

            let mut values: Vec<Value> = Vec::with_capacity(chat_ids.len() + 2);
            values.push(Value::Integer(from_pts));
            values.extend(chat_ids.iter().map(|id| Value::Integer(*id)));
            values.push(Value::Integer(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let messages = stmt
                .query_map(params_from_iter(values), message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    async fn max_pts(&self) -> Result<i64, RepoError> {
        self.blocking(|conn| {
            let value: i64 = conn.query_row(
                "SELECT value FROM pts_counter WHERE id = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(value)
        })
        .await
    }

    async fn max_chat_pts(&self, chat_id: i64) -> Result<i64, RepoError> {
        self.blocking(move |conn| {
            let value: i64 = conn.query_row(
                "SELECT COALESCE(MAX(pts), 0) FROM messages WHERE chat_id = ?1 AND deleted = 0",
                params![chat_id],
                |row| row.get(0),
            )?;
            Ok(value)
        })
        .await
    }
}
