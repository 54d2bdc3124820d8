use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AgentSettings;

/// Policy-file polling cadence with jitter so a fleet does not poll in lockstep
pub struct PollingScheduler {
    base_interval: Duration,
    jitter_range: Duration,
}

impl PollingScheduler {
    pub fn new(interval_secs: u64, jitter_secs: u64) -> Self {
        Self {
            base_interval: Duration::from_secs(interval_secs),
            jitter_range: Duration::from_secs(jitter_secs),
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(settings.poll_interval, settings.poll_jitter)
    }

    /// Sleep for one interval plus jitter, returning when the next poll was due
    pub async fn sleep_until_next_poll(&self) -> DateTime<Utc> {
        let interval = self.next_interval();
        let due = Utc::now() + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());

        tracing::debug!(
            "Next policy check at {} ({} seconds)",
            due.format("%Y-%m-%d %H:%M:%S %Z"),
            interval.as_secs()
        );
        sleep(interval).await;

        due
    }

    /// Base interval plus a random jitter in `[0, jitter_range]`
    fn next_interval(&self) -> Duration {
        let jitter_secs = rand::thread_rng().gen_range(0..=self.jitter_range.as_secs());
        self.base_interval + Duration::from_secs(jitter_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_range() {
        let scheduler = PollingScheduler::new(300, 60);

        for _ in 0..100 {
            let interval = scheduler.next_interval();
            assert!(interval >= Duration::from_secs(300));
            assert!(interval <= Duration::from_secs(360));
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let scheduler = PollingScheduler::new(300, 0);

        for _ in 0..10 {
            assert_eq!(scheduler.next_interval(), Duration::from_secs(300));
        }
    }

    #[test]
    fn built_from_agent_settings() {
        let config = crate::config::AgentConfig::new("rs-instance-1-1", "https://keys.example.com");
        let scheduler = PollingScheduler::from_settings(&config.agent);

        assert_eq!(scheduler.base_interval, Duration::from_secs(300));
        assert_eq!(scheduler.jitter_range, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_for_the_interval() {
        let scheduler = PollingScheduler::new(10, 0);
        let before = tokio::time::Instant::now();

        scheduler.sleep_until_next_poll().await;

        assert!(before.elapsed() >= Duration::from_secs(10));
    }
}
