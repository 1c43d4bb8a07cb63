use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::SessionResult;
use crate::sessions::service::SessionService;
use crate::store::SessionQuery;

/// Seconds between sweeps
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;

/// Periodic task that moves due RUNNING sessions to EXPIRED_WAITING_CONFIRM.
///
/// Expiry is at most one interval late. A sweep whose conditional write loses
/// to an operator (pause, confirm, cancel) is skipped without error.
pub struct ExpirationSweeper {
    service: Arc<SessionService>,
    interval: Duration,
    running: Arc<Mutex<bool>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationSweeper {
    pub fn new(service: Arc<SessionService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            running: Arc::new(Mutex::new(false)),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Start sweeping in the background
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if *running {
            anyhow::bail!("Expiration sweeper is already running");
        }
        *running = true;
        drop(running);

        info!("Starting expiration sweeper (every {}s)", self.interval.as_secs());

        let service = self.service.clone();
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // Only the wait is interruptible; a sweep always runs to the end
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.notified() => {}
                }

                if !*running.lock().await {
                    info!("Expiration sweeper stopped");
                    break;
                }

                if let Err(e) = Self::sweep(&service).await {
                    error!("Error in sweep: {:#}", e);
                }
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the loop and wait for it to exit. A sweep already in progress
    /// finishes its writes and publishes their events first.
    pub async fn stop(&self) {
        *self.running.lock().await = false;
        info!("Stopping expiration sweeper");
        self.shutdown.notify_one();

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Expiration sweeper task ended abnormally: {}", e);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.lock().await
    }

    /// Run one sweep now; returns how many sessions were expired
    pub async fn sweep_once(&self) -> SessionResult<usize> {
        Self::sweep(&self.service).await
    }

    async fn sweep(service: &SessionService) -> SessionResult<usize> {
        let due = service.store().list(SessionQuery::due_at(service.now())).await?;
        if due.is_empty() {
            return Ok(0);
        }

        debug!("{} session(s) due for expiry", due.len());

        let mut expired = 0;
        for session in due {
            match service.expire(session.id).await {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {}
                Err(e) => error!("Failed to expire session {}: {}", session.id, e),
            }
        }
        Ok(expired)
    }
}
