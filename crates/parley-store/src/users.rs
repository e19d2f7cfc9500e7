use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use parley_core::ids::UserId;
use parley_core::presence::{UserSummary, DEFAULT_THUMBNAIL};

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub display_name: String,
    pub thumbnail: String,
    pub created_at: String,
}

/// Identity boundary: the external identity/profile service populates this
/// table; the registry only reads summaries from it.
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or refresh a user's profile slice.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn upsert(
        &self,
        id: &UserId,
        display_name: &str,
        thumbnail: Option<&str>,
    ) -> Result<UserRow, StoreError> {
        let thumbnail = thumbnail.unwrap_or(DEFAULT_THUMBNAIL);
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, display_name, thumbnail, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET
                    display_name = excluded.display_name,
                    thumbnail = excluded.thumbnail",
                rusqlite::params![id.as_str(), display_name, thumbnail, now],
            )?;

            conn.query_row(
                "SELECT id, display_name, thumbnail, created_at FROM users WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok(UserRow {
                        id: UserId::from_raw(row.get::<_, String>(0)?),
                        display_name: row.get(1)?,
                        thumbnail: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .map_err(|e| StoreError::Database(e.to_string()))
        })
    }

    /// Summary for presence events and membership lists.
    #[instrument(skip(self), fields(user_id = %id))]
    pub fn get_summary(&self, id: &UserId) -> Result<UserSummary, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, display_name, thumbnail FROM users WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok(UserSummary {
                        id: UserId::from_raw(row.get::<_, String>(0)?),
                        display_name: row.get(1)?,
                        thumbnail: row.get(2)?,
                    })
                },
            )
            .map_err(|_| StoreError::NotFound(format!("user {id}")))
        })
    }
}
