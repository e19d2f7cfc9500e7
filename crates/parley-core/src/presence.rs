use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Shown for users the identity service has not (yet) populated.
pub const DEFAULT_THUMBNAIL: &str = "/assets/pics/_profile.png";

/// Public profile slice attached to presence events and membership lists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub display_name: String,
    pub thumbnail: String,
}

impl UserSummary {
    /// Fallback summary when no user row exists for `id`.
    pub fn placeholder(id: UserId) -> Self {
        let display_name = id.as_str().to_owned();
        Self {
            id,
            display_name,
            thumbnail: DEFAULT_THUMBNAIL.to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Joined,
    Left,
}

/// Membership-change notification delivered to a room's subscribers.
/// Ephemeral: never persisted, at-most-once, best-effort.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "presence")]
pub struct PresenceEvent {
    pub action: PresenceAction,
    pub room: String,
    pub user: UserSummary,
}

impl PresenceEvent {
    pub fn joined(room: impl Into<String>, user: UserSummary) -> Self {
        Self {
            action: PresenceAction::Joined,
            room: room.into(),
            user,
        }
    }

    pub fn left(room: impl Into<String>, user: UserSummary) -> Self {
        Self {
            action: PresenceAction::Left,
            room: room.into(),
            user,
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }
}
