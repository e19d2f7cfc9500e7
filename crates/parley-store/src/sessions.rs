use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::{SessionToken, UserId};
use parley_core::presence::{UserSummary, DEFAULT_THUMBNAIL};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Every session starts here; the original client joins it on login.
pub const DEFAULT_ROOM: &str = "Lobby";

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: SessionToken,
    pub user_id: UserId,
    pub room: String,
    pub created_at: String,
    pub updated_at: String,
}

/// The session registry: maps opaque tokens to the identity and current room
/// of a connected user. A user may hold several concurrent sessions.
pub struct SessionRepo {
    db: Database,
    capacity: usize,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_capacity(db: Database, capacity: usize) -> Self {
        Self { db, capacity }
    }

    /// Create a session for a user. The new session lands in the default room.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn create(&self, user_id: &UserId) -> Result<SessionRow, StoreError> {
        let id = SessionToken::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            let live: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            if live as usize >= self.capacity {
                return Err(StoreError::Capacity(format!(
                    "session limit {} reached",
                    self.capacity
                )));
            }

            conn.execute(
                "INSERT INTO sessions (id, user_id, room, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id.as_str(), user_id.as_str(), DEFAULT_ROOM, now, now],
            )?;

            Ok(SessionRow {
                id: id.clone(),
                user_id: user_id.clone(),
                room: DEFAULT_ROOM.to_string(),
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Resolve a token to its session.
    #[instrument(skip(self), fields(session = %token))]
    pub fn lookup(&self, token: &SessionToken) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, room, created_at, updated_at FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([token.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {token}"))),
            }
        })
    }

    /// Move a session to `room`. Update and read-back happen under the single
    /// connection lock, so membership snapshots never see a half-applied move.
    #[instrument(skip(self), fields(session = %token))]
    pub fn set_room(&self, token: &SessionToken, room: &str) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| {
            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE sessions SET room = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![room, now, token.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {token}")));
            }

            let mut stmt = conn.prepare(
                "SELECT id, user_id, room, created_at, updated_at FROM sessions WHERE id = ?1",
            )?;
            let mut rows = stmt.query([token.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row),
                None => Err(StoreError::NotFound(format!("session {token}"))),
            }
        })
    }

    /// Remove a session. Removing a non-existent session is not an error.
    #[instrument(skip(self), fields(session = %token))]
    pub fn destroy(&self, token: &SessionToken) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", [token.as_str()])?;
            Ok(())
        })
    }

    /// Membership snapshot: one summary per distinct user with a live session
    /// in `room`. Users the identity service has not populated degrade to a
    /// placeholder summary.
    #[instrument(skip(self))]
    pub fn members_of(&self, room: &str) -> Result<Vec<UserSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT s.user_id, u.display_name, u.thumbnail
                 FROM sessions s LEFT JOIN users u ON u.id = s.user_id
                 WHERE s.room = ?1
                 ORDER BY s.user_id",
            )?;
            let mut rows = stmt.query([room])?;
            let mut members = Vec::new();
            while let Some(row) = rows.next()? {
                let user_id: String = row_helpers::get(row, 0, "sessions", "user_id")?;
                let display_name: Option<String> =
                    row_helpers::get_opt(row, 1, "users", "display_name")?;
                let thumbnail: Option<String> = row_helpers::get_opt(row, 2, "users", "thumbnail")?;
                members.push(UserSummary {
                    display_name: display_name.unwrap_or_else(|| user_id.clone()),
                    thumbnail: thumbnail.unwrap_or_else(|| DEFAULT_THUMBNAIL.to_string()),
                    id: UserId::from_raw(user_id),
                });
            }
            Ok(members)
        })
    }

    /// Live session count.
    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    Ok(SessionRow {
        id: SessionToken::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, "sessions", "user_id")?),
        room: row_helpers::get(row, 2, "sessions", "room")?,
        created_at: row_helpers::get(row, 3, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 4, "sessions", "updated_at")?,
    })
}
