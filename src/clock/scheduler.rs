use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Periodic scheduler with jitter so many observers started together do not
/// resample the server clock in lockstep
pub struct PollingScheduler {
    base_interval: Duration,
    jitter_range: Duration,
}

impl PollingScheduler {
    /// # Arguments
    /// * `interval` - Base period between polls
    /// * `jitter` - Maximum extra delay added to each period
    pub fn new(interval: Duration, jitter: Duration) -> Self {
        Self {
            base_interval: interval,
            jitter_range: jitter,
        }
    }

    pub async fn sleep_until_next_poll(&self) {
        let sleep_duration = self.calculate_next_interval();
        tracing::debug!(
            "Sleeping for {} ms until next poll",
            sleep_duration.as_millis()
        );
        sleep(sleep_duration).await;
    }

    /// Estimated wall time of the next poll
    pub fn next_poll_time(&self) -> DateTime<Utc> {
        let sleep_duration = self.calculate_next_interval();
        Utc::now() + chrono::Duration::from_std(sleep_duration).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn calculate_next_interval(&self) -> Duration {
        self.base_interval + self.random_jitter()
    }

    /// Random jitter in `[0, jitter_range]`
    fn random_jitter(&self) -> Duration {
        let max_millis = self.jitter_range.as_millis() as u64;
        if max_millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_scheduler_jitter_is_within_range() {
        let scheduler = PollingScheduler::new(Duration::from_secs(60), Duration::from_secs(5));

        for _ in 0..100 {
            let interval = scheduler.calculate_next_interval();
            assert!(interval >= Duration::from_secs(60));
            assert!(interval <= Duration::from_secs(65));
        }
    }

    #[test]
    fn polling_scheduler_with_zero_jitter() {
        let scheduler = PollingScheduler::new(Duration::from_secs(60), Duration::ZERO);

        for _ in 0..10 {
            assert_eq!(scheduler.calculate_next_interval(), Duration::from_secs(60));
        }
    }

    #[test]
    fn polling_scheduler_next_poll_time_is_in_future() {
        let scheduler = PollingScheduler::new(Duration::from_secs(60), Duration::from_secs(5));
        let now = Utc::now();
        let next = scheduler.next_poll_time();

        assert!(next > now);
        assert!(next <= now + chrono::Duration::seconds(66));
    }
}
