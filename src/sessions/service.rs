use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastHub, SessionEvent, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::error::{SessionError, SessionResult, StoreError};
use crate::sessions::audit::{AuditAction, AuditEntry, AuditSink, TracingAudit};
use crate::sessions::auth::{AccessPolicy, Action, Actor, RolePolicy};
use crate::sessions::model::{minutes, seconds_until, Session, SessionStatus, Settings, Transition};
use crate::store::{
    Precondition, SessionChanges, SessionQuery, SessionStore, SettingsStore, UpdateOutcome,
};

/// Rejected conditional writes tolerated before giving up with a conflict
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Input for `SessionService::create`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewSession {
    pub child_name: String,
    /// Absent or non-positive means "use the configured default"
    pub duration_minutes: Option<i64>,
    pub notes: Option<String>,
}

/// Input for `SessionService::update`; `None` fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub child_name: Option<String>,
    pub notes: Option<String>,
    pub duration_minutes: Option<i64>,
}

/// What an operation decided after looking at the stored record
enum Decision {
    Apply(SessionChanges),
    Unchanged,
}

enum Committed {
    Written(Session),
    Unchanged(Session),
}

/// One async lock per session with a write in flight.
///
/// A lane is held from the store write until the matching event has been
/// published, so events for one session leave the hub in commit order.
/// Entries are weak and pruned once no operation holds them.
#[derive(Default)]
struct SessionLanes {
    lanes: Mutex<HashMap<Uuid, Weak<AsyncMutex<()>>>>,
}

impl SessionLanes {
    async fn enter(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            lanes.retain(|_, lane| lane.strong_count() > 0);
            match lanes.get(&id).and_then(Weak::upgrade) {
                Some(lane) => lane,
                None => {
                    let lane = Arc::new(AsyncMutex::new(()));
                    lanes.insert(id, Arc::downgrade(&lane));
                    lane
                }
            }
        };
        lane.lock_owned().await
    }

    fn len(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lane| lane.strong_count() > 0)
            .count()
    }
}

/// The session lifecycle engine.
///
/// Every status-dependent write goes through `SessionStore::update_if`
/// guarded by the status and revision that were read, so concurrent
/// operators and the sweeper can never overwrite each other's transition.
/// Each committed change is published on the hub and recorded in the audit
/// sink before the next write to the same session can start.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    settings: Arc<dyn SettingsStore>,
    hub: BroadcastHub,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn AccessPolicy>,
    audit: Arc<dyn AuditSink>,
    lanes: SessionLanes,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        settings: Arc<dyn SettingsStore>,
        hub: BroadcastHub,
    ) -> Self {
        Self {
            store,
            settings,
            hub,
            clock: Arc::new(SystemClock),
            policy: Arc::new(RolePolicy),
            audit: Arc::new(TracingAudit),
            lanes: SessionLanes::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }

    /// Register an observer for every future state change
    pub fn subscribe(&self, actor: &Actor) -> SessionResult<Subscription> {
        self.authorize(actor, Action::ListSessions, None)?;
        Ok(self.hub.subscribe())
    }

    /// Sessions with a write currently in flight
    pub fn sessions_in_flight(&self) -> usize {
        self.lanes.len()
    }

    /// Authoritative server time
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Sessions ordered by status, then end time
    pub async fn list(
        &self,
        actor: &Actor,
        status: Option<SessionStatus>,
    ) -> SessionResult<Vec<Session>> {
        self.authorize(actor, Action::ListSessions, None)?;
        Ok(self.store.list(SessionQuery::with_status(status)).await?)
    }

    pub async fn create(&self, request: NewSession, actor: &Actor) -> SessionResult<Session> {
        self.authorize(actor, Action::CreateSession, None)?;

        let child_name = request.child_name.trim().to_string();
        if child_name.is_empty() {
            return Err(SessionError::Validation("childName is required".to_string()));
        }

        let duration_minutes = match request.duration_minutes.filter(|d| *d > 0) {
            Some(requested) => u32::try_from(requested).map_err(|_| {
                SessionError::Validation(format!("durationMinutes too large: {}", requested))
            })?,
            None => self.settings.settings().await?.default_duration_minutes,
        };

        let session = Session::start(
            child_name,
            duration_minutes,
            non_empty(request.notes),
            actor.id.clone(),
            self.clock.now(),
        );
        let _lane = self.lanes.enter(session.id).await;
        let created = self.store.insert(session).await?;

        info!(
            "Session {} started for {} ({} min, ends {})",
            created.id,
            created.child_name,
            created.duration_minutes,
            created.end_time.format("%H:%M:%S")
        );
        self.record(AuditAction::SessionCreated, Some(actor), &created, None);
        self.hub.publish(SessionEvent::Created(created.clone()));
        Ok(created)
    }

    /// Change name, notes or nominal length.
    ///
    /// A new duration re-anchors `end_time` to `start_time`, not to now. On a
    /// PAUSED session the frozen `remaining_seconds` is left as it is and
    /// still governs the next resume.
    pub async fn update(
        &self,
        id: Uuid,
        patch: SessionPatch,
        actor: &Actor,
    ) -> SessionResult<Session> {
        let child_name = match patch.child_name {
            Some(name) if name.trim().is_empty() => {
                return Err(SessionError::Validation("childName cannot be blank".to_string()));
            }
            Some(name) => Some(name.trim().to_string()),
            None => None,
        };

        let duration_minutes = match patch.duration_minutes {
            Some(d) if d <= 0 => {
                return Err(SessionError::Validation(format!(
                    "durationMinutes must be positive, got {}",
                    d
                )));
            }
            Some(d) => Some(u32::try_from(d).map_err(|_| {
                SessionError::Validation(format!("durationMinutes too large: {}", d))
            })?),
            None => None,
        };

        let notes = patch.notes.map(|n| non_empty(Some(n)));

        let _lane = self.lanes.enter(id).await;
        let committed = self
            .commit(id, actor, Action::UpdateSession, |current, _now| {
                let mut changes = SessionChanges {
                    child_name: child_name.clone(),
                    notes: notes.clone(),
                    ..Default::default()
                };

                if let Some(duration) = duration_minutes {
                    if current.status == SessionStatus::Paused {
                        warn!(
                            "Session {} is paused; new duration moves end time but the frozen \
                             remaining time ({}s) still applies on resume",
                            current.id,
                            current.remaining_seconds.unwrap_or(0)
                        );
                    }
                    changes.duration_minutes = Some(duration);
                    changes.end_time = Some(current.start_time + minutes(duration));
                }

                Ok(if changes.is_empty() {
                    Decision::Unchanged
                } else {
                    Decision::Apply(changes)
                })
            })
            .await?;

        match committed {
            Committed::Written(updated) => {
                info!("Session {} updated", updated.id);
                let payload = serde_json::json!({
                    "childName": updated.child_name,
                    "notes": updated.notes,
                    "durationMinutes": updated.duration_minutes,
                    "endTime": updated.end_time,
                });
                self.record(AuditAction::SessionUpdated, Some(actor), &updated, Some(payload));
                self.hub.publish(SessionEvent::Updated(updated.clone()));
                Ok(updated)
            }
            Committed::Unchanged(current) => Ok(current),
        }
    }

    /// Freeze the countdown. Only legal while RUNNING.
    pub async fn pause(&self, id: Uuid, actor: &Actor) -> SessionResult<Session> {
        let _lane = self.lanes.enter(id).await;
        let committed = self
            .commit(id, actor, Action::PauseSession, |current, now| {
                let status = target(current, Transition::Pause)?;
                Ok(Decision::Apply(SessionChanges {
                    status: Some(status),
                    remaining_seconds: Some(Some(seconds_until(current.end_time, now))),
                    ..Default::default()
                }))
            })
            .await?;

        let paused = written(committed);
        info!(
            "Session {} paused with {}s remaining",
            paused.id,
            paused.remaining_seconds.unwrap_or(0)
        );
        self.record(AuditAction::SessionPaused, Some(actor), &paused, None);
        self.hub.publish(SessionEvent::Updated(paused.clone()));
        Ok(paused)
    }

    /// Restart a paused countdown from its frozen value
    pub async fn resume(&self, id: Uuid, actor: &Actor) -> SessionResult<Session> {
        let _lane = self.lanes.enter(id).await;
        let committed = self
            .commit(id, actor, Action::ResumeSession, |current, now| {
                let status = target(current, Transition::Resume)?;
                let remaining = match current.remaining_seconds {
                    Some(remaining) if remaining >= 0 => remaining,
                    _ => return Err(invalid(current, Transition::Resume)),
                };
                Ok(Decision::Apply(SessionChanges {
                    status: Some(status),
                    end_time: Some(now + Duration::seconds(remaining)),
                    remaining_seconds: Some(None),
                    ..Default::default()
                }))
            })
            .await?;

        let resumed = written(committed);
        info!(
            "Session {} resumed, now ends {}",
            resumed.id,
            resumed.end_time.format("%H:%M:%S")
        );
        self.record(AuditAction::SessionResumed, Some(actor), &resumed, None);
        self.hub.publish(SessionEvent::Updated(resumed.clone()));
        Ok(resumed)
    }

    /// Sweeper-only: mark a due RUNNING session as waiting for exit
    /// confirmation.
    ///
    /// Returns `Ok(None)` when the session is gone, no longer RUNNING, not
    /// yet due, or changed between the read and the write. None of those are
    /// errors; the next sweep re-evaluates it.
    pub async fn expire(&self, id: Uuid) -> SessionResult<Option<Session>> {
        let _lane = self.lanes.enter(id).await;
        let Some(current) = self.store.get(id).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        if !current.is_due(now) {
            return Ok(None);
        }
        let Some(status) = current.status.apply(Transition::Expire) else {
            return Ok(None);
        };

        let changes = SessionChanges {
            status: Some(status),
            ..Default::default()
        };

        match self
            .store
            .update_if(id, Precondition::observed(&current), changes)
            .await?
        {
            UpdateOutcome::Applied(expired) => {
                info!("Session {} for {} expired", expired.id, expired.child_name);
                self.record(AuditAction::SessionExpired, None, &expired, None);
                self.hub.publish(SessionEvent::StatusChanged(expired.clone()));
                Ok(Some(expired))
            }
            UpdateOutcome::Rejected(latest) => {
                debug!(
                    "Skipping expiry of session {}: changed concurrently (now {})",
                    id, latest.status
                );
                Ok(None)
            }
            UpdateOutcome::Missing => Ok(None),
        }
    }

    /// Record that the child physically left. Idempotent once confirmed.
    pub async fn confirm_exit(&self, id: Uuid, actor: &Actor) -> SessionResult<Session> {
        let actor_id = actor.id.clone();
        let _lane = self.lanes.enter(id).await;
        let committed = self
            .commit(id, actor, Action::ConfirmExit, |current, now| {
                if current.status == SessionStatus::ConfirmedExit {
                    return Ok(Decision::Unchanged);
                }
                let status = target(current, Transition::ConfirmExit)?;
                let mut changes = leave_countdown(current, status, now);
                changes.confirmed_exit_by = Some(actor_id.clone());
                Ok(Decision::Apply(changes))
            })
            .await?;

        match committed {
            Committed::Written(confirmed) => {
                info!("Session {} exit confirmed by {}", confirmed.id, actor.id);
                self.record(AuditAction::SessionConfirmedExit, Some(actor), &confirmed, None);
                self.hub
                    .publish(SessionEvent::StatusChanged(confirmed.clone()));
                Ok(confirmed)
            }
            Committed::Unchanged(current) => {
                debug!("Session {} exit already confirmed", current.id);
                Ok(current)
            }
        }
    }

    /// Abandon a session that has not finished
    pub async fn cancel(&self, id: Uuid, actor: &Actor) -> SessionResult<Session> {
        let _lane = self.lanes.enter(id).await;
        let committed = self
            .commit(id, actor, Action::CancelSession, |current, now| {
                let status = target(current, Transition::Cancel)?;
                Ok(Decision::Apply(leave_countdown(current, status, now)))
            })
            .await?;

        let cancelled = written(committed);
        info!("Session {} cancelled by {}", cancelled.id, actor.id);
        self.record(AuditAction::SessionCancelled, Some(actor), &cancelled, None);
        self.hub
            .publish(SessionEvent::StatusChanged(cancelled.clone()));
        Ok(cancelled)
    }

    /// Hard delete in any status
    pub async fn delete(&self, id: Uuid, actor: &Actor) -> SessionResult<()> {
        let _lane = self.lanes.enter(id).await;
        let current = self
            .store
            .get(id)
            .await?
            .ok_or(SessionError::NotFound(id))?;
        self.authorize(actor, Action::DeleteSession, Some(&current))?;

        let removed = self
            .store
            .remove(id)
            .await?
            .ok_or(SessionError::NotFound(id))?;

        info!("Session {} for {} deleted", removed.id, removed.child_name);
        self.record(AuditAction::SessionDeleted, Some(actor), &removed, None);
        self.hub.publish(SessionEvent::Deleted { id });
        Ok(())
    }

    pub async fn settings(&self, actor: &Actor) -> SessionResult<Settings> {
        self.authorize(actor, Action::ReadSettings, None)?;
        Ok(self.settings.settings().await?)
    }

    pub async fn update_settings(
        &self,
        default_duration_minutes: i64,
        actor: &Actor,
    ) -> SessionResult<Settings> {
        self.authorize(actor, Action::UpdateSettings, None)?;

        let minutes = u32::try_from(default_duration_minutes)
            .ok()
            .filter(|m| *m > 0)
            .ok_or_else(|| {
                SessionError::Validation(format!(
                    "defaultDurationMinutes must be a positive integer, got {}",
                    default_duration_minutes
                ))
            })?;

        let saved = self
            .settings
            .save_settings(Settings {
                default_duration_minutes: minutes,
            })
            .await?;
        info!("Default session length set to {} minutes by {}", minutes, actor.id);
        Ok(saved)
    }

    /// Read, decide, then write guarded by what was read. A rejected write
    /// means someone else committed in between; the decision is re-made
    /// against the fresh record.
    async fn commit<F>(
        &self,
        id: Uuid,
        actor: &Actor,
        action: Action,
        decide: F,
    ) -> SessionResult<Committed>
    where
        F: Fn(&Session, DateTime<Utc>) -> SessionResult<Decision>,
    {
        let mut current = self
            .store
            .get(id)
            .await?
            .ok_or(SessionError::NotFound(id))?;

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            self.authorize(actor, action, Some(&current))?;

            let changes = match decide(&current, self.clock.now())? {
                Decision::Apply(changes) => changes,
                Decision::Unchanged => return Ok(Committed::Unchanged(current)),
            };

            match self
                .store
                .update_if(id, Precondition::observed(&current), changes)
                .await?
            {
                UpdateOutcome::Applied(updated) => return Ok(Committed::Written(updated)),
                UpdateOutcome::Rejected(latest) => {
                    debug!(
                        "Write to session {} rejected (attempt {}/{}), revision {} -> {}",
                        id, attempt, MAX_WRITE_ATTEMPTS, current.revision, latest.revision
                    );
                    current = latest;
                }
                UpdateOutcome::Missing => return Err(SessionError::NotFound(id)),
            }
        }

        warn!("Giving up on session {} after {} conflicting writes", id, MAX_WRITE_ATTEMPTS);
        Err(StoreError::Conflict(id).into())
    }

    fn authorize(&self, actor: &Actor, action: Action, session: Option<&Session>) -> SessionResult<()> {
        if self.policy.permits(actor, action, session) {
            Ok(())
        } else {
            warn!("Denied '{}' ({}) to {}", action.name(), actor.role, actor.id);
            Err(SessionError::Forbidden {
                actor: actor.id.clone(),
                action: action.name(),
            })
        }
    }

    fn record(
        &self,
        action: AuditAction,
        actor: Option<&Actor>,
        session: &Session,
        payload: Option<serde_json::Value>,
    ) {
        self.audit.record(AuditEntry {
            action,
            actor: actor.map(|a| a.id.clone()),
            session_id: session.id,
            at: self.clock.now(),
            payload,
        });
    }
}

fn target(current: &Session, transition: Transition) -> SessionResult<SessionStatus> {
    current
        .status
        .apply(transition)
        .ok_or_else(|| invalid(current, transition))
}

fn invalid(current: &Session, transition: Transition) -> SessionError {
    SessionError::InvalidTransition {
        id: current.id,
        from: current.status,
        action: transition.name(),
    }
}

/// Changes for entering a terminal status. A paused session gets its
/// countdown closed at `now` so `end_time` stays authoritative.
fn leave_countdown(current: &Session, status: SessionStatus, now: DateTime<Utc>) -> SessionChanges {
    let mut changes = SessionChanges {
        status: Some(status),
        ..Default::default()
    };
    if current.status == SessionStatus::Paused {
        changes.remaining_seconds = Some(None);
        changes.end_time = Some(now);
    }
    changes
}

fn written(committed: Committed) -> Session {
    match committed {
        Committed::Written(session) | Committed::Unchanged(session) => session,
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.is_empty())
}
