use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::{MessageId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A durably stored message (transaction).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: MessageId,
    pub offline_id: String,
    pub author_id: UserId,
    pub room: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// A client-authored message awaiting persistence. `offline_id` is unique
/// only within the author's local queue; `created_at` defaults to server now
/// when the client did not record an authorship time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewMessage {
    pub offline_id: String,
    pub author_id: UserId,
    pub room: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// The message (transaction) log. Idempotency key: `(author_id, offline_id)`
/// — resubmitting a message already stored for that author never creates a
/// duplicate.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist one message. Resubmitting an already-stored `(author,
    /// offline_id)` pair returns the original row unchanged.
    #[instrument(skip(self, msg), fields(author_id = %msg.author_id, offline_id = %msg.offline_id))]
    pub fn insert(&self, msg: &NewMessage) -> Result<MessageRow, StoreError> {
        self.db.with_conn(|conn| {
            let id = MessageId::new();
            let created_at = msg
                .created_at
                .clone()
                .unwrap_or_else(|| Utc::now().to_rfc3339());
            let payload = serde_json::to_string(&msg.payload)?;

            let inserted = conn.execute(
                "INSERT INTO messages (id, offline_id, author_id, room, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (author_id, offline_id) DO NOTHING",
                rusqlite::params![
                    id.as_str(),
                    msg.offline_id,
                    msg.author_id.as_str(),
                    msg.room,
                    payload,
                    created_at,
                ],
            )?;

            if inserted == 0 {
                return fetch_by_offline_id(conn, &msg.author_id, &msg.offline_id);
            }

            Ok(MessageRow {
                id,
                offline_id: msg.offline_id.clone(),
                author_id: msg.author_id.clone(),
                room: msg.room.clone(),
                payload: msg.payload.clone(),
                created_at,
            })
        })
    }

    /// Persist a batch in one durable operation. Returns the `offline_id` of
    /// every message now durably stored — freshly inserted or already present
    /// — in input-survivor order, so retried batches converge. A record that
    /// fails to persist is skipped from the acks and left for the client to
    /// retry.
    #[instrument(skip(self, msgs), fields(count = msgs.len()))]
    pub fn insert_batch(&self, msgs: &[NewMessage]) -> Result<Vec<String>, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut acked = Vec::with_capacity(msgs.len());

            for msg in msgs {
                let payload = match serde_json::to_string(&msg.payload) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(
                            offline_id = %msg.offline_id,
                            error = %e,
                            "message payload not serializable, left for retry"
                        );
                        continue;
                    }
                };
                let id = MessageId::new();
                let created_at = msg
                    .created_at
                    .clone()
                    .unwrap_or_else(|| Utc::now().to_rfc3339());

                match tx.execute(
                    "INSERT INTO messages (id, offline_id, author_id, room, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (author_id, offline_id) DO NOTHING",
                    rusqlite::params![
                        id.as_str(),
                        msg.offline_id,
                        msg.author_id.as_str(),
                        msg.room,
                        payload,
                        created_at,
                    ],
                ) {
                    Ok(_) => acked.push(msg.offline_id.clone()),
                    Err(e) => {
                        tracing::warn!(
                            offline_id = %msg.offline_id,
                            error = %e,
                            "message not persisted, left for retry"
                        );
                    }
                }
            }

            tx.commit()?;
            Ok(acked)
        })
    }

    /// List stored messages, newest first. Equal timestamps break ties on the
    /// id, which is time-ordered, so pages stay stable.
    #[instrument(skip(self))]
    pub fn list(
        &self,
        room: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let (sql, params) = match room {
                Some(r) => (
                    "SELECT id, offline_id, author_id, room, payload, created_at
                     FROM messages WHERE room = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                    vec![r.to_string(), limit.to_string(), offset.to_string()],
                ),
                None => (
                    "SELECT id, offline_id, author_id, room, payload, created_at
                     FROM messages
                     ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                    vec![limit.to_string(), offset.to_string()],
                ),
            };

            let mut stmt = conn.prepare(sql)?;
            let params_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
            let mut rows = stmt.query(params_refs.as_slice())?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn fetch_by_offline_id(
    conn: &rusqlite::Connection,
    author_id: &UserId,
    offline_id: &str,
) -> Result<MessageRow, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, offline_id, author_id, room, payload, created_at
         FROM messages WHERE author_id = ?1 AND offline_id = ?2",
    )?;
    let mut rows = stmt.query([author_id.as_str(), offline_id])?;
    match rows.next()? {
        Some(row) => row_to_message(row),
        None => Err(StoreError::NotFound(format!(
            "message {offline_id} for {author_id}"
        ))),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRow, StoreError> {
    let raw_payload: String = row_helpers::get(row, 4, "messages", "payload")?;
    Ok(MessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        offline_id: row_helpers::get(row, 1, "messages", "offline_id")?,
        author_id: UserId::from_raw(row_helpers::get::<String>(row, 2, "messages", "author_id")?),
        room: row_helpers::get(row, 3, "messages", "room")?,
        payload: row_helpers::parse_json(&raw_payload, "messages", "payload")?,
        created_at: row_helpers::get(row, 5, "messages", "created_at")?,
    })
}
