use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    atomic_write, Precondition, SessionChanges, SessionQuery, SessionStore, SettingsStore,
    UpdateOutcome,
};
use crate::error::{StoreError, StoreResult};
use crate::sessions::model::{Session, Settings};

/// Current on-disk document version
pub const STORE_VERSION: &str = "1.0";

/// On-disk representation of the whole store
#[derive(Debug, Deserialize, Serialize)]
struct StoreDocument {
    version: String,
    #[serde(default)]
    settings: Option<Settings>,
    #[serde(default)]
    sessions: Vec<Session>,
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<Uuid, Session>,
    settings: Option<Settings>,
}

impl StoreState {
    fn to_document(&self) -> StoreDocument {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| (s.start_time, s.id));
        StoreDocument {
            version: STORE_VERSION.to_string(),
            settings: self.settings,
            sessions,
        }
    }
}

/// Session and settings store kept in memory and, when opened with a path,
/// mirrored to a single JSON file on every committed write.
///
/// All mutations happen under one write lock, which is what makes
/// `update_if` an atomic compare-and-write.
pub struct JsonFileStore {
    path: Option<PathBuf>,
    state: RwLock<StoreState>,
    fallback_settings: Settings,
}

impl JsonFileStore {
    /// Volatile store, nothing is written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(StoreState::default()),
            fallback_settings: Settings::default(),
        }
    }

    /// Open (or lazily create) the store file at `path`
    pub fn open(path: &Path) -> StoreResult<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let document: StoreDocument = serde_json::from_str(&content)?;

            if document.version != STORE_VERSION {
                return Err(StoreError::UnsupportedVersion {
                    found: document.version,
                    expected: STORE_VERSION.to_string(),
                });
            }

            info!(
                "Loaded {} sessions from {}",
                document.sessions.len(),
                path.display()
            );

            StoreState {
                sessions: document.sessions.into_iter().map(|s| (s.id, s)).collect(),
                settings: document.settings,
            }
        } else {
            debug!("Store file {} does not exist yet", path.display());
            StoreState::default()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(state),
            fallback_settings: Settings::default(),
        })
    }

    /// Settings returned while no settings record has been saved
    pub fn with_default_settings(mut self, settings: Settings) -> Self {
        self.fallback_settings = settings;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the whole document; the file I/O runs on the blocking pool while
    /// the caller keeps the write lock
    async fn persist(&self, state: &StoreState) -> StoreResult<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };

        let content = serde_json::to_string_pretty(&state.to_document())?;
        tokio::task::spawn_blocking(move || atomic_write(&path, content.as_bytes()))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn insert(&self, session: Session) -> StoreResult<Session> {
        let mut state = self.state.write().await;
        state.sessions.insert(session.id, session.clone());

        if let Err(e) = self.persist(&state).await {
            state.sessions.remove(&session.id);
            return Err(e);
        }

        Ok(session)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn list(&self, query: SessionQuery) -> StoreResult<Vec<Session>> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();

        sessions.sort_by(|a, b| {
            a.status
                .cmp(&b.status)
                .then(a.end_time.cmp(&b.end_time))
                .then(a.id.cmp(&b.id))
        });

        Ok(sessions)
    }

    async fn update_if(
        &self,
        id: Uuid,
        precondition: Precondition,
        changes: SessionChanges,
    ) -> StoreResult<UpdateOutcome> {
        let mut state = self.state.write().await;

        let Some(current) = state.sessions.get(&id).cloned() else {
            return Ok(UpdateOutcome::Missing);
        };

        if !precondition.holds_for(&current) {
            return Ok(UpdateOutcome::Rejected(current));
        }

        let mut updated = current.clone();
        changes.apply_to(&mut updated);
        updated.revision = current.revision + 1;
        state.sessions.insert(id, updated.clone());

        if let Err(e) = self.persist(&state).await {
            state.sessions.insert(id, current);
            return Err(e);
        }

        Ok(UpdateOutcome::Applied(updated))
    }

    async fn remove(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let mut state = self.state.write().await;

        let Some(removed) = state.sessions.remove(&id) else {
            return Ok(None);
        };

        if let Err(e) = self.persist(&state).await {
            state.sessions.insert(id, removed);
            return Err(e);
        }

        Ok(Some(removed))
    }
}

#[async_trait]
impl SettingsStore for JsonFileStore {
    async fn settings(&self) -> StoreResult<Settings> {
        Ok(self
            .state
            .read()
            .await
            .settings
            .unwrap_or(self.fallback_settings))
    }

    async fn save_settings(&self, settings: Settings) -> StoreResult<Settings> {
        let mut state = self.state.write().await;
        let previous = state.settings.replace(settings);

        if let Err(e) = self.persist(&state).await {
            state.settings = previous;
            return Err(e);
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::model::SessionStatus;
    use chrono::{DateTime, Duration, Utc};
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn session(name: &str, minutes: u32) -> Session {
        Session::start(name.to_string(), minutes, None, "admin".to_string(), t0())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = JsonFileStore::in_memory();
        let created = store.insert(session("Ana", 10)).await.unwrap();

        let loaded = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_orders_by_status_then_end_time() {
        let store = JsonFileStore::in_memory();
        let long = store.insert(session("Long", 30)).await.unwrap();
        let short = store.insert(session("Short", 5)).await.unwrap();
        let paused = store.insert(session("Paused", 1)).await.unwrap();
        store
            .update_if(
                paused.id,
                Precondition::any(),
                SessionChanges {
                    status: Some(SessionStatus::Paused),
                    remaining_seconds: Some(Some(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ids: Vec<Uuid> = store
            .list(SessionQuery::all())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![short.id, long.id, paused.id]);

        let running = store
            .list(SessionQuery::with_status(Some(SessionStatus::Running)))
            .await
            .unwrap();
        assert_eq!(running.len(), 2);
    }

    #[tokio::test]
    async fn test_update_if_bumps_revision() {
        let store = JsonFileStore::in_memory();
        let created = store.insert(session("Ana", 10)).await.unwrap();

        let outcome = store
            .update_if(
                created.id,
                Precondition::observed(&created),
                SessionChanges {
                    notes: Some(Some("snack".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match outcome {
            UpdateOutcome::Applied(updated) => {
                assert_eq!(updated.revision, 2);
                assert_eq!(updated.notes.as_deref(), Some("snack"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_if_rejects_on_status_mismatch() {
        let store = JsonFileStore::in_memory();
        let created = store.insert(session("Ana", 10)).await.unwrap();

        let outcome = store
            .update_if(
                created.id,
                Precondition::status(SessionStatus::Paused),
                SessionChanges {
                    status: Some(SessionStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::Rejected(created.clone()));
        assert_eq!(store.get(created.id).await.unwrap().unwrap(), created);
    }

    #[tokio::test]
    async fn test_update_if_missing() {
        let store = JsonFileStore::in_memory();
        let outcome = store
            .update_if(Uuid::new_v4(), Precondition::any(), SessionChanges::default())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Missing);
    }

    #[tokio::test]
    async fn test_due_query_excludes_future_sessions() {
        let store = JsonFileStore::in_memory();
        let due = store.insert(session("Due", 1)).await.unwrap();
        store.insert(session("Later", 60)).await.unwrap();

        let found = store
            .list(SessionQuery::due_at(t0() + Duration::minutes(2)))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = JsonFileStore::in_memory();
        let created = store.insert(session("Ana", 10)).await.unwrap();

        assert_eq!(store.remove(created.id).await.unwrap(), Some(created.clone()));
        assert_eq!(store.remove(created.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settings_fallback_and_save() {
        let store = JsonFileStore::in_memory().with_default_settings(Settings {
            default_duration_minutes: 20,
        });
        assert_eq!(store.settings().await.unwrap().default_duration_minutes, 20);

        store
            .save_settings(Settings {
                default_duration_minutes: 45,
            })
            .await
            .unwrap();
        assert_eq!(store.settings().await.unwrap().default_duration_minutes, 45);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sessions.json");

        let created = {
            let store = JsonFileStore::open(&path).unwrap();
            store
                .save_settings(Settings {
                    default_duration_minutes: 25,
                })
                .await
                .unwrap();
            store.insert(session("Ana", 10)).await.unwrap()
        };

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get(created.id).await.unwrap(), Some(created));
        assert_eq!(reopened.settings().await.unwrap().default_duration_minutes, 25);
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_version() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sessions.json");
        std::fs::write(&path, r#"{"version":"9.9","sessions":[]}"#).unwrap();

        match JsonFileStore::open(&path) {
            Err(StoreError::UnsupportedVersion { found, .. }) => assert_eq!(found, "9.9"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("expected version error"),
        }
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let temp_dir = tempdir().unwrap();
        // A directory where the store file should be makes every write fail
        let path = temp_dir.path().join("blocked");
        std::fs::create_dir_all(path.with_extension("tmp")).unwrap();

        let store = JsonFileStore::open(&path).unwrap();
        let result = store.insert(session("Ana", 10)).await;

        assert!(result.is_err());
        assert!(store.list(SessionQuery::all()).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_all_reach_disk() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("sessions.json");
        let store = std::sync::Arc::new(JsonFileStore::open(&path).unwrap());

        let writes = (0..20).map(|n| {
            let store = store.clone();
            tokio::spawn(async move { store.insert(session(&format!("Child {}", n), 10)).await })
        });
        for write in futures::future::join_all(writes).await {
            write.unwrap().unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.list(SessionQuery::all()).await.unwrap().len(), 20);
    }
}
