/// Fan-out of session state changes to every connected observer.
///
/// There is one logical channel: every subscriber sees every event. The hub
/// never waits on a subscriber; each one owns an unbounded queue, so a slow
/// dashboard only delays itself.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sessions::model::Session;

pub const EVENT_CREATED: &str = "session:created";
pub const EVENT_UPDATED: &str = "session:updated";
pub const EVENT_STATUS_CHANGED: &str = "session:statusChanged";
pub const EVENT_DELETED: &str = "session:deleted";

/// A committed state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created(Session),
    Updated(Session),
    StatusChanged(Session),
    Deleted { id: Uuid },
}

#[derive(Debug, Deserialize, Serialize)]
struct DeletedPayload {
    id: Uuid,
}

impl SessionEvent {
    /// Wire name observers subscribe to
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Created(_) => EVENT_CREATED,
            SessionEvent::Updated(_) => EVENT_UPDATED,
            SessionEvent::StatusChanged(_) => EVENT_STATUS_CHANGED,
            SessionEvent::Deleted { .. } => EVENT_DELETED,
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::Created(s) | SessionEvent::Updated(s) | SessionEvent::StatusChanged(s) => {
                s.id
            }
            SessionEvent::Deleted { id } => *id,
        }
    }

    /// Full record for upserts, `None` for deletions
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionEvent::Created(s) | SessionEvent::Updated(s) | SessionEvent::StatusChanged(s) => {
                Some(s)
            }
            SessionEvent::Deleted { .. } => None,
        }
    }

    /// JSON payload: the full record, or just `{"id": ...}` for deletions
    pub fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            SessionEvent::Deleted { id } => serde_json::to_string(&DeletedPayload { id: *id }),
            SessionEvent::Created(s) | SessionEvent::Updated(s) | SessionEvent::StatusChanged(s) => {
                serde_json::to_string(s)
            }
        }
    }

    /// Rebuild an event from its wire name and JSON payload
    pub fn from_wire(name: &str, payload: &str) -> Result<Self> {
        let event = match name {
            EVENT_DELETED => {
                let deleted: DeletedPayload =
                    serde_json::from_str(payload).context("Invalid deleted payload")?;
                SessionEvent::Deleted { id: deleted.id }
            }
            EVENT_CREATED | EVENT_UPDATED | EVENT_STATUS_CHANGED => {
                let session: Session = serde_json::from_str(payload)
                    .with_context(|| format!("Invalid session payload for {}", name))?;
                match name {
                    EVENT_CREATED => SessionEvent::Created(session),
                    EVENT_UPDATED => SessionEvent::Updated(session),
                    _ => SessionEvent::StatusChanged(session),
                }
            }
            other => anyhow::bail!("Unknown event name: {}", other),
        };
        Ok(event)
    }
}

struct HubInner {
    subscribers: Mutex<HashMap<u64, UnboundedSender<SessionEvent>>>,
    next_id: AtomicU64,
}

impl HubInner {
    fn remove(&self, id: u64) -> bool {
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }
}

/// Publish/subscribe hub for session events
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Join the channel. The subscriber leaves when the handle is dropped.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.lock_subscribers().insert(id, sender);
        debug!("Observer {} joined ({} connected)", id, self.subscriber_count());

        Subscription {
            id,
            receiver,
            hub: Arc::clone(&self.inner),
        }
    }

    /// Deliver `event` to a snapshot of the current subscribers.
    ///
    /// Never blocks; subscribers whose receiving side is gone are pruned.
    /// Returns how many subscribers the event was queued for.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let snapshot: Vec<(u64, UnboundedSender<SessionEvent>)> = self
            .lock_subscribers()
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sender) in snapshot {
            if sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }

        for id in closed {
            if self.inner.remove(id) {
                debug!("Pruned disconnected observer {}", id);
            }
        }

        debug!(
            "Published {} for session {} to {} observers",
            event.name(),
            event.session_id(),
            delivered
        );
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, UnboundedSender<SessionEvent>>> {
        match self.inner.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Subscriber registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's handle on the hub
pub struct Subscription {
    id: u64,
    receiver: UnboundedReceiver<SessionEvent>,
    hub: Arc<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.receiver.recv().await
    }

    /// Next queued event without waiting
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.hub.remove(self.id) {
            debug!("Observer {} left", self.id);
        }
    }
}

/// Deleted ids remembered by an `ObserverView`
pub const MAX_TOMBSTONES: usize = 1024;

/// Client-side projection of the session list built from events.
///
/// Upserts by id, removes on deletion, and ignores anything older than what
/// it already holds, so duplicated or replayed deliveries are harmless.
/// Only the most recent `MAX_TOMBSTONES` deletions are remembered.
#[derive(Debug, Default, Clone)]
pub struct ObserverView {
    sessions: HashMap<Uuid, Session>,
    deleted: HashSet<Uuid>,
    deletion_order: VecDeque<Uuid>,
}

impl ObserverView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a full listing
    pub fn seed(&mut self, sessions: Vec<Session>) {
        self.sessions.clear();
        self.deleted.clear();
        self.deletion_order.clear();
        for session in sessions {
            self.upsert(session);
        }
    }

    /// Apply one event; returns whether the view changed
    pub fn apply(&mut self, event: &SessionEvent) -> bool {
        match event {
            SessionEvent::Deleted { id } => {
                self.remember_deleted(*id);
                self.sessions.remove(id).is_some()
            }
            _ => match event.session() {
                Some(session) => self.upsert(session.clone()),
                None => false,
            },
        }
    }

    fn remember_deleted(&mut self, id: Uuid) {
        if !self.deleted.insert(id) {
            return;
        }
        self.deletion_order.push_back(id);
        if self.deletion_order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.deletion_order.pop_front() {
                self.deleted.remove(&oldest);
            }
        }
    }

    /// Number of deleted ids currently remembered
    pub fn tombstones(&self) -> usize {
        self.deleted.len()
    }

    fn upsert(&mut self, session: Session) -> bool {
        if self.deleted.contains(&session.id) {
            return false;
        }

        if let Some(existing) = self.sessions.get(&session.id) {
            if existing.revision > session.revision || *existing == session {
                return false;
            }
        }

        self.sessions.insert(session.id, session);
        true
    }

    pub fn get(&self, id: Uuid) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions in listing order (status, then end time)
    pub fn sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.status.cmp(&b.status).then(a.end_time.cmp(&b.end_time)));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::model::SessionStatus;
    use chrono::DateTime;

    fn session() -> Session {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Session::start("Mia".to_string(), 10, None, "admin".to_string(), start)
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let hub = BroadcastHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        let event = SessionEvent::Created(session());
        assert_eq!(hub.publish(event.clone()), 2);

        assert_eq!(first.recv().await, Some(event.clone()));
        assert_eq!(second.recv().await, Some(event));
    }

    #[test]
    fn test_dropping_subscription_leaves_hub() {
        let hub = BroadcastHub::new();
        let subscription = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(hub.publish(SessionEvent::Deleted { id: Uuid::new_v4() }), 0);
    }

    #[test]
    fn test_publish_does_not_wait_for_slow_subscriber() {
        let hub = BroadcastHub::new();
        let _slow = hub.subscribe();

        for _ in 0..1000 {
            hub.publish(SessionEvent::Updated(session()));
        }
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_events_arrive_in_publish_order() {
        let hub = BroadcastHub::new();
        let mut subscription = hub.subscribe();
        let created = session();

        hub.publish(SessionEvent::Created(created.clone()));
        hub.publish(SessionEvent::Updated(created.clone()));
        hub.publish(SessionEvent::Deleted { id: created.id });

        let names: Vec<&str> = std::iter::from_fn(|| subscription.try_recv())
            .map(|e| e.name())
            .collect();
        assert_eq!(names, vec![EVENT_CREATED, EVENT_UPDATED, EVENT_DELETED]);
    }

    #[test]
    fn test_deleted_payload_carries_only_id() {
        let id = Uuid::new_v4();
        let payload = SessionEvent::Deleted { id }.payload_json().unwrap();
        assert_eq!(payload, format!("{{\"id\":\"{}\"}}", id));
    }

    #[test]
    fn test_wire_round_trip_for_status_change() {
        let mut expired = session();
        expired.status = SessionStatus::ExpiredWaitingConfirm;
        let event = SessionEvent::StatusChanged(expired);

        let payload = event.payload_json().unwrap();
        let decoded = SessionEvent::from_wire(event.name(), &payload).unwrap();
        assert_eq!(decoded, event);
        assert!(SessionEvent::from_wire("session:renamed", &payload).is_err());
    }

    #[test]
    fn test_view_is_idempotent_under_duplicates() {
        let mut view = ObserverView::new();
        let created = session();
        let event = SessionEvent::Created(created.clone());

        assert!(view.apply(&event));
        assert!(!view.apply(&event));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_view_ignores_stale_revision() {
        let mut view = ObserverView::new();
        let original = session();
        let mut paused = original.clone();
        paused.status = SessionStatus::Paused;
        paused.remaining_seconds = Some(300);
        paused.revision = 2;

        view.apply(&SessionEvent::Updated(paused.clone()));
        assert!(!view.apply(&SessionEvent::Created(original)));
        assert_eq!(view.get(paused.id), Some(&paused));
    }

    #[test]
    fn test_view_does_not_resurrect_deleted_sessions() {
        let mut view = ObserverView::new();
        let created = session();

        view.apply(&SessionEvent::Created(created.clone()));
        assert!(view.apply(&SessionEvent::Deleted { id: created.id }));
        assert!(!view.apply(&SessionEvent::Updated(created)));
        assert!(view.is_empty());
    }

    #[test]
    fn test_seed_replaces_view_and_tombstones() {
        let mut view = ObserverView::new();
        let stale = session();
        view.apply(&SessionEvent::Created(stale.clone()));
        view.apply(&SessionEvent::Deleted { id: Uuid::new_v4() });
        assert_eq!(view.tombstones(), 1);

        let mut fresh = session();
        fresh.id = Uuid::new_v4();
        view.seed(vec![fresh.clone()]);

        assert_eq!(view.len(), 1);
        assert_eq!(view.get(fresh.id), Some(&fresh));
        assert!(view.get(stale.id).is_none());
        assert_eq!(view.tombstones(), 0);
    }

    #[test]
    fn test_tombstones_are_capped() {
        let mut view = ObserverView::new();
        let first = Uuid::new_v4();
        view.apply(&SessionEvent::Deleted { id: first });
        for _ in 0..MAX_TOMBSTONES {
            view.apply(&SessionEvent::Deleted { id: Uuid::new_v4() });
        }
        assert_eq!(view.tombstones(), MAX_TOMBSTONES);

        // The oldest deletion has been forgotten
        let mut returning = session();
        returning.id = first;
        assert!(view.apply(&SessionEvent::Created(returning)));
    }
}
