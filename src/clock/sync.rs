use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{from_epoch_millis, Clock, PollingScheduler};

/// Something that can report the authoritative server time
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn server_time(&self) -> Result<DateTime<Utc>>;
}

/// One synchronization measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    pub rtt: Duration,
    pub offset: Duration,
}

/// Estimate the local clock's offset from one request/response exchange.
///
/// The server timestamp is taken to be sampled at the midpoint of the round
/// trip, so at `t1` the server reads `server_time + rtt / 2`.
pub fn estimate_offset(
    t0: DateTime<Utc>,
    server_time: DateTime<Utc>,
    t1: DateTime<Utc>,
) -> ClockSample {
    let rtt = t1 - t0;
    let estimated_server_now = server_time + rtt / 2;
    ClockSample {
        rtt,
        offset: estimated_server_now - t1,
    }
}

/// Observer-side estimate of the server clock.
///
/// Starts with a zero offset; a failed sample leaves the previous offset in
/// place so rendering degrades to local-clock accuracy instead of failing.
pub struct ClockSync {
    source: Arc<dyn TimeSource>,
    local: Arc<dyn Clock>,
    offset: RwLock<Duration>,
    last_sample: RwLock<Option<ClockSample>>,
}

impl ClockSync {
    pub fn new(source: Arc<dyn TimeSource>, local: Arc<dyn Clock>) -> Self {
        Self {
            source,
            local,
            offset: RwLock::new(Duration::zero()),
            last_sample: RwLock::new(None),
        }
    }

    /// Correction currently added to local timestamps
    pub fn offset(&self) -> Duration {
        *self.offset.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn last_sample(&self) -> Option<ClockSample> {
        *self
            .last_sample
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Best estimate of the server's current time
    pub fn now(&self) -> DateTime<Utc> {
        self.local.now() + self.offset()
    }

    /// Take one sample and adopt its offset
    pub async fn sync_once(&self) -> Result<ClockSample> {
        let t0 = self.local.now();
        let server_time = self.source.server_time().await?;
        let t1 = self.local.now();

        if t1 < t0 {
            anyhow::bail!("Local clock moved backwards during sync; sample discarded");
        }

        let sample = estimate_offset(t0, server_time, t1);

        *self
            .offset
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = sample.offset;
        *self
            .last_sample
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sample);

        debug!(
            "Clock sample: rtt={}ms offset={}ms",
            sample.rtt.num_milliseconds(),
            sample.offset.num_milliseconds()
        );
        Ok(sample)
    }

    /// Resample forever in the background, `interval` (plus jitter) apart
    pub fn spawn(self: Arc<Self>, interval: StdDuration) -> JoinHandle<()> {
        let scheduler = PollingScheduler::new(interval, interval / 10);

        tokio::spawn(async move {
            info!("Clock sync started (every ~{}s)", interval.as_secs());
            loop {
                if let Err(e) = self.sync_once().await {
                    warn!(
                        "Clock sync failed, keeping offset {}ms: {:#}",
                        self.offset().num_milliseconds(),
                        e
                    );
                }
                scheduler.sleep_until_next_poll().await;
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTimeResponse {
    server_time: i64,
}

/// `TimeSource` backed by the server's `GET /time` endpoint
pub struct HttpTimeSource {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpTimeSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = url::Url::parse(base_url).context("Invalid server URL")?;
        let url = base.join("time").context("Invalid server URL")?;

        let client = reqwest::Client::builder()
            .user_agent(format!("playtime/{}", env!("CARGO_PKG_VERSION")))
            .timeout(StdDuration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn server_time(&self) -> Result<DateTime<Utc>> {
        let response = self
            .client
            .get(self.url.clone())
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .context("Failed to reach server")?
            .error_for_status()
            .context("Server rejected time request")?;

        let body: ServerTimeResponse = response
            .json()
            .await
            .context("Invalid time response")?;

        from_epoch_millis(body.server_time).context("Server time out of range")
    }
}
