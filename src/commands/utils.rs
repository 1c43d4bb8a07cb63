use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::Arc;

use playtime::client::ApiClient;
use playtime::clock::{ClockSync, SystemClock};
use playtime::sessions::{Actor, Session};

/// Initialize logging. `RUST_LOG` wins over `--verbose`, which wins over
/// the configured level.
pub fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let level = if verbose { "debug" } else { level };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Run one command on a fresh multi-threaded runtime
pub fn block_on<F: Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(future)
}

pub fn client(server: &str, actor: &Actor) -> Result<Arc<ApiClient>> {
    Ok(Arc::new(ApiClient::new(server, actor.clone())?))
}

/// Clock synchronized against `client` once. A failed sample leaves the
/// local clock in charge.
pub async fn synced_clock(client: Arc<ApiClient>) -> Arc<ClockSync> {
    let sync = Arc::new(ClockSync::new(client, Arc::new(SystemClock)));
    if let Err(e) = sync.sync_once().await {
        tracing::warn!("Clock sync failed, using local clock: {:#}", e);
    }
    sync
}

/// Format duration for display
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().abs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

/// `MM:SS`, or `H:MM:SS` past an hour
pub fn format_countdown(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

/// Print sessions as a table, countdowns evaluated at `now`
pub fn print_sessions(sessions: &[&Session], now: DateTime<Utc>) {
    if sessions.is_empty() {
        println!("No sessions");
        return;
    }

    println!(
        "{:<36}  {:<20}  {:<23}  {:>9}  {}",
        "ID", "CHILD", "STATUS", "REMAINING", "ENDS"
    );
    for session in sessions {
        println!(
            "{:<36}  {:<20}  {:<23}  {:>9}  {}",
            session.id,
            truncate(&session.child_name, 20),
            session.status,
            format_countdown(session.remaining_at(now)),
            session.end_time.with_timezone(&chrono::Local).format("%H:%M:%S"),
        );
    }
}

pub fn print_session(label: &str, session: &Session, now: DateTime<Utc>) {
    println!("✓ {} {}", label, session.id);
    println!("  Child:     {}", session.child_name);
    println!("  Status:    {}", session.status);
    println!("  Duration:  {} min", session.duration_minutes);
    println!("  Remaining: {}", format_countdown(session.remaining_at(now)));
    if let Some(notes) = &session.notes {
        println!("  Notes:     {}", notes);
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
