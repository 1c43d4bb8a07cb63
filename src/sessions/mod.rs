// Session lifecycle: model, state machine, expiry sweeper, access and audit hooks

pub mod audit;
pub mod auth;
pub mod model;
pub mod service;
pub mod sweeper;

pub use audit::{AuditAction, AuditEntry, AuditSink, JsonLinesAudit, TracingAudit};
pub use auth::{AccessPolicy, Action, Actor, AllowAll, Role, RolePolicy};
pub use model::{Session, SessionStatus, Settings, Transition, DEFAULT_DURATION_MINUTES};
pub use service::{NewSession, SessionPatch, SessionService};
pub use sweeper::{ExpirationSweeper, DEFAULT_SWEEP_INTERVAL_SECS};
