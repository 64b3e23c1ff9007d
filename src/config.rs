//! Engine configuration
//!
//! Read-only to the engine; the host application owns where these values
//! come from (settings UI, config file). Defaults match the documented
//! policy: 90% high-water mark, 98% hard limit, 24h eviction cadence,
//! 5s active / 15min passive polling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cache byte budget for downloaded bodies and attachments
    pub cache_budget_bytes: u64,

    /// Messages older than this window are not backfilled on first sync
    pub initial_sync_window_days: i64,

    /// Poll interval while the application is foregrounded
    pub active_poll_interval_secs: u64,

    /// Poll interval while backgrounded
    pub passive_poll_interval_secs: u64,

    /// How often the backfill producer looks for folders with history left
    pub backfill_interval_secs: u64,

    /// Cache fraction above which content-growing jobs are vetoed
    pub high_water_fraction: f64,

    /// Cache fraction that triggers immediate eviction
    pub hard_limit_fraction: f64,

    /// Scheduled eviction cadence
    pub eviction_cadence_hours: i64,

    /// Entities younger than this never get evicted
    pub eviction_min_age_days: i64,

    /// Entities accessed or synced within this window never get evicted
    pub eviction_access_grace_hours: i64,

    /// Attempt ceiling for a pending mutation before it is marked failed
    pub max_mutation_attempts: i32,

    /// Attempt ceiling for a transiently failing job
    pub max_job_attempts: u32,

    /// Base delay for exponential retry backoff
    pub retry_base_delay_ms: u64,

    /// Cap on the retry backoff delay
    pub retry_max_delay_ms: u64,

    /// Base cooldown before a gatekeeper-vetoed job is re-evaluated
    pub veto_cooldown_ms: u64,

    /// How long the work score must stay at zero before the syncing
    /// indicator clears
    pub syncing_debounce_ms: u64,

    /// Global cap on concurrently executing jobs across all accounts
    pub max_concurrent_jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: 512 * 1024 * 1024,
            initial_sync_window_days: 90,
            active_poll_interval_secs: 5,
            passive_poll_interval_secs: 15 * 60,
            backfill_interval_secs: 60,
            high_water_fraction: 0.90,
            hard_limit_fraction: 0.98,
            eviction_cadence_hours: 24,
            eviction_min_age_days: 90,
            eviction_access_grace_hours: 24,
            max_mutation_attempts: 5,
            max_job_attempts: 5,
            retry_base_delay_ms: 30_000,
            retry_max_delay_ms: 3_600_000,
            veto_cooldown_ms: 1_000,
            syncing_debounce_ms: 5_000,
            max_concurrent_jobs: 4,
        }
    }
}

impl EngineConfig {
    pub fn high_water_bytes(&self) -> u64 {
        (self.cache_budget_bytes as f64 * self.high_water_fraction) as u64
    }

    pub fn hard_limit_bytes(&self) -> u64 {
        (self.cache_budget_bytes as f64 * self.hard_limit_fraction) as u64
    }

    /// Exponential backoff delay for the given attempt number (1-based),
    /// capped at `retry_max_delay_ms`
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Cooldown before re-evaluating a vetoed job, growing with each veto
    pub fn veto_delay(&self, vetoes: u32) -> Duration {
        let exp = vetoes.min(6);
        let ms = self
            .veto_cooldown_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.high_water_fraction, 0.90);
        assert_eq!(config.hard_limit_fraction, 0.98);
        assert!(config.high_water_bytes() < config.hard_limit_bytes());
        assert!(config.hard_limit_bytes() < config.cache_budget_bytes);
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let config = EngineConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(400));
        assert_eq!(config.retry_delay(10), Duration::from_millis(1_000));
    }
}
