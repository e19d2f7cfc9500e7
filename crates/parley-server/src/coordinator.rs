use tracing::instrument;

use parley_core::errors::ChatError;
use parley_core::ids::{SessionToken, UserId};
use parley_core::presence::{PresenceEvent, UserSummary};
use parley_store::sessions::{SessionRepo, SessionRow};
use parley_store::users::UserRepo;
use parley_store::{Database, StoreError};

use crate::presence::PresenceBroadcaster;

/// Result of a room switch: the updated session and the target room's
/// membership snapshot ("who's here").
#[derive(Clone, Debug)]
pub struct SwitchOutcome {
    pub session: SessionRow,
    pub members: Vec<UserSummary>,
}

/// Orchestrates a session's move between rooms: durable registry update
/// first, then one addressed presence publish per affected room. The
/// previous room is always derived from the registry lookup, never from
/// request parameters.
pub struct RoomCoordinator {
    sessions: SessionRepo,
    users: UserRepo,
    presence: PresenceBroadcaster,
}

impl RoomCoordinator {
    pub fn new(db: Database, presence: PresenceBroadcaster) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            users: UserRepo::new(db),
            presence,
        }
    }

    /// Switch the session behind `token` to `target_room`.
    ///
    /// Malformed or unknown tokens fail with `InvalidSession` before any
    /// durable state or broadcast is touched. Switching to the room the
    /// session is already in succeeds without firing presence events.
    #[instrument(skip(self), fields(room = %target_room))]
    pub fn switch_room(
        &self,
        token: &str,
        target_room: &str,
    ) -> Result<SwitchOutcome, ChatError> {
        if !SessionToken::is_valid_format(token) {
            return Err(ChatError::InvalidSession);
        }
        let token = SessionToken::from_raw(token);

        let session = self.sessions.lookup(&token).map_err(|e| match e {
            StoreError::NotFound(_) => ChatError::InvalidSession,
            other => ChatError::from(other),
        })?;
        let previous_room = session.room;

        // Durable first: if this fails, nothing is published.
        let session = self.sessions.set_room(&token, target_room)?;
        let members = self.sessions.members_of(target_room)?;

        if previous_room != target_room {
            let user = self.user_summary(&session.user_id)?;
            self.presence
                .publish(PresenceEvent::left(previous_room.as_str(), user.clone()));
            self.presence
                .publish(PresenceEvent::joined(target_room, user));
        }

        Ok(SwitchOutcome { session, members })
    }

    fn user_summary(&self, user_id: &UserId) -> Result<UserSummary, ChatError> {
        match self.users.get_summary(user_id) {
            Ok(summary) => Ok(summary),
            Err(StoreError::NotFound(_)) => Ok(UserSummary::placeholder(user_id.clone())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::presence::PresenceAction;
    use parley_store::sessions::DEFAULT_ROOM;

    fn setup() -> (Database, PresenceBroadcaster, RoomCoordinator, SessionRow) {
        let db = Database::in_memory().unwrap();
        let users = UserRepo::new(db.clone());
        let ada = users.upsert(&UserId::from_raw("user_ada"), "Ada", None).unwrap();
        let session = SessionRepo::new(db.clone()).create(&ada.id).unwrap();

        let presence = PresenceBroadcaster::new(16);
        let coordinator = RoomCoordinator::new(db.clone(), presence.clone());
        (db, presence, coordinator, session)
    }

    #[test]
    fn switch_moves_session_and_membership() {
        let (db, _presence, coordinator, session) = setup();

        let outcome = coordinator.switch_room(session.id.as_str(), "general").unwrap();
        assert_eq!(outcome.session.room, "general");
        assert_eq!(outcome.members.len(), 1);
        assert_eq!(outcome.members[0].display_name, "Ada");

        // Snapshot of the previous room no longer includes the session
        let sessions = SessionRepo::new(db);
        assert!(sessions.members_of(DEFAULT_ROOM).unwrap().is_empty());
    }

    #[test]
    fn switch_publishes_left_then_joined() {
        let (_db, presence, coordinator, session) = setup();
        let mut rx = presence.subscribe_events();

        coordinator.switch_room(session.id.as_str(), "general").unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.action, PresenceAction::Left);
        assert_eq!(first.room(), DEFAULT_ROOM);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.action, PresenceAction::Joined);
        assert_eq!(second.room(), "general");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn same_room_switch_succeeds_without_events() {
        let (_db, presence, coordinator, session) = setup();
        let mut rx = presence.subscribe_events();

        let outcome = coordinator.switch_room(session.id.as_str(), DEFAULT_ROOM).unwrap();
        assert_eq!(outcome.session.room, DEFAULT_ROOM);
        assert_eq!(outcome.members.len(), 1);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_token_rejected_before_any_side_effect() {
        let (db, presence, coordinator, session) = setup();
        let mut rx = presence.subscribe_events();

        let result = coordinator.switch_room("not-a-token", "general");
        assert!(matches!(result, Err(ChatError::InvalidSession)));

        assert!(rx.try_recv().is_err());
        let fetched = SessionRepo::new(db).lookup(&session.id).unwrap();
        assert_eq!(fetched.room, DEFAULT_ROOM);
    }

    #[test]
    fn unknown_token_rejected_without_events() {
        let (_db, presence, coordinator, _session) = setup();
        let mut rx = presence.subscribe_events();

        let ghost = SessionToken::new();
        let result = coordinator.switch_room(ghost.as_str(), "general");
        assert!(matches!(result, Err(ChatError::InvalidSession)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_switchers_both_land_in_target_snapshot() {
        let (db, _presence, coordinator, s1) = setup();
        let users = UserRepo::new(db.clone());
        let bob = users.upsert(&UserId::from_raw("user_bob"), "Bob", None).unwrap();
        let s2 = SessionRepo::new(db.clone()).create(&bob.id).unwrap();

        coordinator.switch_room(s1.id.as_str(), "general").unwrap();
        let outcome = coordinator.switch_room(s2.id.as_str(), "general").unwrap();

        assert_eq!(outcome.members.len(), 2);
        // Nobody is left behind in the lobby
        assert!(SessionRepo::new(db).members_of(DEFAULT_ROOM).unwrap().is_empty());
    }

    #[test]
    fn unknown_user_degrades_to_placeholder_summary() {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone())
            .create(&UserId::from_raw("user_ghost"))
            .unwrap();

        let presence = PresenceBroadcaster::new(16);
        let mut rx = presence.subscribe_events();
        let coordinator = RoomCoordinator::new(db, presence);

        coordinator.switch_room(session.id.as_str(), "general").unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.user.display_name, "user_ghost");
    }
}
