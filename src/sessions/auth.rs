use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sessions::model::Session;

/// Role assigned by the external authentication layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Employee,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "employee" => Ok(Role::Employee),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => f.write_str("ADMIN"),
            Role::Employee => f.write_str("EMPLOYEE"),
        }
    }
}

/// Identity of whoever is asking for an operation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    pub fn employee(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Employee,
        }
    }
}

/// Operations subject to the authorization hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ListSessions,
    CreateSession,
    UpdateSession,
    PauseSession,
    ResumeSession,
    ConfirmExit,
    CancelSession,
    DeleteSession,
    ReadSettings,
    UpdateSettings,
}

impl Action {
    pub fn name(self) -> &'static str {
        match self {
            Action::ListSessions => "list sessions",
            Action::CreateSession => "create sessions",
            Action::UpdateSession => "update sessions",
            Action::PauseSession => "pause sessions",
            Action::ResumeSession => "resume sessions",
            Action::ConfirmExit => "confirm exits",
            Action::CancelSession => "cancel sessions",
            Action::DeleteSession => "delete sessions",
            Action::ReadSettings => "read settings",
            Action::UpdateSettings => "update settings",
        }
    }
}

/// Authorization predicate supplied by the embedding application.
///
/// `session` is the record being acted on (when one exists), which lets a
/// policy check ownership through `Session::created_by`.
pub trait AccessPolicy: Send + Sync {
    fn permits(&self, actor: &Actor, action: Action, session: Option<&Session>) -> bool;
}

/// Admins may do everything; employees may watch sessions and confirm exits
#[derive(Debug, Default, Clone, Copy)]
pub struct RolePolicy;

impl AccessPolicy for RolePolicy {
    fn permits(&self, actor: &Actor, action: Action, _session: Option<&Session>) -> bool {
        match actor.role {
            Role::Admin => true,
            Role::Employee => matches!(action, Action::ListSessions | Action::ConfirmExit),
        }
    }
}

/// Permits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn permits(&self, _actor: &Actor, _action: Action, _session: Option<&Session>) -> bool {
        true
    }
}
