/// Durable storage for sessions and the settings singleton.
///
/// The lifecycle engine only talks to the traits below; `JsonFileStore` is
/// the bundled implementation (in-memory, optionally persisted to disk).
mod file;
mod fs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::sessions::model::{Session, SessionStatus, Settings};

pub use file::{JsonFileStore, STORE_VERSION};
pub use fs::atomic_write;

/// Filter for `SessionStore::list`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionQuery {
    pub status: Option<SessionStatus>,
    pub ends_at_or_before: Option<DateTime<Utc>>,
}

impl SessionQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: Option<SessionStatus>) -> Self {
        Self {
            status,
            ends_at_or_before: None,
        }
    }

    /// RUNNING sessions whose countdown reached zero at `now`
    pub fn due_at(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(SessionStatus::Running),
            ends_at_or_before: Some(now),
        }
    }

    pub fn matches(&self, session: &Session) -> bool {
        self.status.is_none_or(|status| session.status == status)
            && self
                .ends_at_or_before
                .is_none_or(|limit| session.end_time <= limit)
    }
}

/// Guard evaluated atomically with an `update_if` write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Precondition {
    pub status: Option<SessionStatus>,
    pub revision: Option<u64>,
}

impl Precondition {
    /// No guard at all
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            revision: None,
        }
    }

    /// Guard on both the status and the exact revision that was read
    pub fn observed(session: &Session) -> Self {
        Self {
            status: Some(session.status),
            revision: Some(session.revision),
        }
    }

    pub fn holds_for(&self, session: &Session) -> bool {
        self.status.is_none_or(|status| session.status == status)
            && self.revision.is_none_or(|revision| session.revision == revision)
    }
}

/// Field changes applied by `update_if`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionChanges {
    pub child_name: Option<String>,
    pub notes: Option<Option<String>>,
    pub duration_minutes: Option<u32>,
    pub end_time: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<Option<i64>>,
    pub status: Option<SessionStatus>,
    pub confirmed_exit_by: Option<String>,
}

impl SessionChanges {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(self, session: &mut Session) {
        if let Some(child_name) = self.child_name {
            session.child_name = child_name;
        }
        if let Some(notes) = self.notes {
            session.notes = notes;
        }
        if let Some(duration) = self.duration_minutes {
            session.duration_minutes = duration;
        }
        if let Some(end_time) = self.end_time {
            session.end_time = end_time;
        }
        if let Some(remaining) = self.remaining_seconds {
            session.remaining_seconds = remaining;
        }
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(actor) = self.confirmed_exit_by {
            session.confirmed_exit_by = Some(actor);
        }
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Precondition held; carries the committed record
    Applied(Session),
    /// Precondition failed; carries the record as currently stored
    Rejected(Session),
    Missing,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: Session) -> StoreResult<Session>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Session>>;

    /// Matching sessions ordered by status, then end time ascending
    async fn list(&self, query: SessionQuery) -> StoreResult<Vec<Session>>;

    /// Compare the stored record against `precondition` and write `changes`
    /// in one atomic step
    async fn update_if(
        &self,
        id: Uuid,
        precondition: Precondition,
        changes: SessionChanges,
    ) -> StoreResult<UpdateOutcome>;

    async fn remove(&self, id: Uuid) -> StoreResult<Option<Session>>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn settings(&self) -> StoreResult<Settings>;

    async fn save_settings(&self, settings: Settings) -> StoreResult<Settings>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_at(end_secs: i64, status: SessionStatus) -> Session {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut session = Session::start("Leo".to_string(), 10, None, "admin".to_string(), start);
        session.end_time = DateTime::from_timestamp(1_700_000_000 + end_secs, 0).unwrap();
        session.status = status;
        session
    }

    #[test]
    fn test_due_query_matches_only_running_past_end() {
        let now = DateTime::from_timestamp(1_700_000_100, 0).unwrap();
        let query = SessionQuery::due_at(now);

        assert!(query.matches(&session_at(100, SessionStatus::Running)));
        assert!(query.matches(&session_at(50, SessionStatus::Running)));
        assert!(!query.matches(&session_at(101, SessionStatus::Running)));
        assert!(!query.matches(&session_at(50, SessionStatus::Paused)));
    }

    #[test]
    fn test_precondition_checks_status_and_revision() {
        let mut session = session_at(100, SessionStatus::Running);
        let guard = Precondition::observed(&session);
        assert!(guard.holds_for(&session));

        session.revision += 1;
        assert!(!guard.holds_for(&session));
        assert!(Precondition::status(SessionStatus::Running).holds_for(&session));
        assert!(Precondition::any().holds_for(&session));
    }

    #[test]
    fn test_changes_apply_only_set_fields() {
        let mut session = session_at(100, SessionStatus::Running);
        let original_end = session.end_time;

        SessionChanges {
            status: Some(SessionStatus::Paused),
            remaining_seconds: Some(Some(42)),
            ..Default::default()
        }
        .apply_to(&mut session);

        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.remaining_seconds, Some(42));
        assert_eq!(session.end_time, original_end);
        assert_eq!(session.child_name, "Leo");
    }

    #[test]
    fn test_empty_changes() {
        assert!(SessionChanges::default().is_empty());
        assert!(
            !SessionChanges {
                notes: Some(None),
                ..Default::default()
            }
            .is_empty()
        );
    }
}
