use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Audited lifecycle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    SessionCreated,
    SessionUpdated,
    SessionPaused,
    SessionResumed,
    SessionExpired,
    SessionConfirmedExit,
    SessionCancelled,
    SessionDeleted,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: AuditAction,
    /// `None` when the sweeper acted
    pub actor: Option<String>,
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Write-only audit trail. Recording must not fail the operation.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Emits entries on the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, entry: AuditEntry) {
        info!(
            target: "audit",
            action = ?entry.action,
            actor = entry.actor.as_deref().unwrap_or("system"),
            session = %entry.session_id,
            "audit"
        );
    }
}

/// Appends one JSON document per line to a file
pub struct JsonLinesAudit {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesAudit {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry)?;
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

impl AuditSink for JsonLinesAudit {
    fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.append(&entry) {
            warn!("Failed to write audit entry to {}: {}", self.path.display(), e);
        }
    }
}
