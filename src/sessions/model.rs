use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default session length used when no Settings record exists yet
pub const DEFAULT_DURATION_MINUTES: u32 = 15;

/// Lifecycle status of a session.
///
/// Declaration order is the listing order (RUNNING first, terminal states
/// last), so the derived `Ord` is what `list` sorts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Paused,
    ExpiredWaitingConfirm,
    ConfirmedExit,
    Cancelled,
}

/// Operations that move a session between statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Pause,
    Resume,
    Expire,
    ConfirmExit,
    Cancel,
}

impl Transition {
    pub fn name(self) -> &'static str {
        match self {
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Expire => "expire",
            Transition::ConfirmExit => "confirm exit",
            Transition::Cancel => "cancel",
        }
    }
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 5] = [
        SessionStatus::Running,
        SessionStatus::Paused,
        SessionStatus::ExpiredWaitingConfirm,
        SessionStatus::ConfirmedExit,
        SessionStatus::Cancelled,
    ];

    /// The single transition table. Returns the target status, or `None`
    /// when the transition is illegal from `self`.
    pub fn apply(self, transition: Transition) -> Option<SessionStatus> {
        use SessionStatus::*;
        use Transition::*;

        match (self, transition) {
            (Running, Pause) => Some(Paused),
            (Paused, Resume) => Some(Running),
            (Running, Expire) => Some(ExpiredWaitingConfirm),
            (Running | Paused | ExpiredWaitingConfirm, ConfirmExit) => Some(ConfirmedExit),
            (Running | Paused | ExpiredWaitingConfirm, Cancel) => Some(Cancelled),
            _ => None,
        }
    }

    /// Terminal for the countdown; the record may still be deleted
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::ConfirmedExit | SessionStatus::Cancelled)
    }

    /// Position in the forward-only ordering. RUNNING and PAUSED share a
    /// rank because they are the only pair allowed to move back and forth.
    pub fn rank(self) -> u8 {
        match self {
            SessionStatus::Running | SessionStatus::Paused => 0,
            SessionStatus::ExpiredWaitingConfirm => 1,
            SessionStatus::ConfirmedExit | SessionStatus::Cancelled => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "RUNNING",
            SessionStatus::Paused => "PAUSED",
            SessionStatus::ExpiredWaitingConfirm => "EXPIRED_WAITING_CONFIRM",
            SessionStatus::ConfirmedExit => "CONFIRMED_EXIT",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("Unknown session status: {}", s))
    }
}

/// A timed child session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub child_name: String,
    pub duration_minutes: u32,
    pub start_time: DateTime<Utc>,
    /// Authoritative in every status except PAUSED
    pub end_time: DateTime<Utc>,
    /// Frozen countdown, only set while PAUSED
    pub remaining_seconds: Option<i64>,
    pub status: SessionStatus,
    pub notes: Option<String>,
    pub created_by: String,
    pub confirmed_exit_by: Option<String>,
    /// Bumped by the store on every committed write
    #[serde(default = "initial_revision")]
    pub revision: u64,
}

fn initial_revision() -> u64 {
    1
}

impl Session {
    /// Build a fresh RUNNING session starting at `now`
    pub fn start(
        child_name: String,
        duration_minutes: u32,
        notes: Option<String>,
        created_by: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            child_name,
            duration_minutes,
            start_time: now,
            end_time: now + minutes(duration_minutes),
            remaining_seconds: None,
            status: SessionStatus::Running,
            notes,
            created_by,
            confirmed_exit_by: None,
            revision: initial_revision(),
        }
    }

    /// Whole seconds left on the countdown as seen at `now`.
    ///
    /// While PAUSED this is the frozen value; in terminal states it is 0.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> i64 {
        match self.status {
            SessionStatus::Paused => self.remaining_seconds.unwrap_or(0).max(0),
            SessionStatus::Running => seconds_until(self.end_time, now),
            _ => 0,
        }
    }

    /// Holds when exactly one of end_time / remaining_seconds is authoritative
    pub fn authority_is_consistent(&self) -> bool {
        match self.status {
            SessionStatus::Paused => self.remaining_seconds.is_some_and(|r| r >= 0),
            _ => self.remaining_seconds.is_none(),
        }
    }

    /// Whether the sweeper should expire this session at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Running && self.end_time <= now
    }
}

/// `max(0, ceil((end - now) / 1s))`
pub fn seconds_until(end: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (end - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis + 999) / 1000
    }
}

pub fn minutes(count: u32) -> Duration {
    Duration::minutes(i64::from(count))
}

/// Singleton settings record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub default_duration_minutes: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_duration_minutes: DEFAULT_DURATION_MINUTES,
        }
    }
}
