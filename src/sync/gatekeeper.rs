//! Gatekeepers - pure veto predicates evaluated before every execution
//!
//! A gatekeeper may only read shared state, never change it. A vetoed job
//! is not discarded: the dispatcher re-queues it after a cooldown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::sync::job::Job;

/// Veto predicate. Must be pure and cheap; it runs on every attempt.
pub trait Gatekeeper: Send + Sync {
    fn name(&self) -> &'static str;
    fn allows(&self, job: &Job) -> bool;
}

// ============================================================================
// Shared transient state
// ============================================================================

/// Shared byte counter for cached content, kept current by the runner and
/// the eviction pass. Authoritative usage lives in the database; this is
/// the cheap in-memory mirror the gatekeepers read.
pub struct CacheUsage {
    used: AtomicU64,
    budget: u64,
    high_water: u64,
    hard_limit: u64,
}

impl CacheUsage {
    pub fn new(config: &EngineConfig, initial_used: u64) -> Self {
        Self {
            used: AtomicU64::new(initial_used),
            budget: config.cache_budget_bytes,
            high_water: config.high_water_bytes(),
            hard_limit: config.hard_limit_bytes(),
        }
    }

    pub fn bytes_used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn set_bytes_used(&self, bytes: u64) {
        self.used.store(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget
    }

    pub fn over_high_water(&self) -> bool {
        self.bytes_used() >= self.high_water
    }

    pub fn over_hard_limit(&self) -> bool {
        self.bytes_used() >= self.hard_limit
    }
}

/// Connectivity flag owned by the host application
pub struct NetworkMonitor {
    online: AtomicBool,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::Relaxed);
        if was != online {
            log::info!("network state changed: online={}", online);
        }
    }
}

// ============================================================================
// Baseline gatekeepers
// ============================================================================

/// Vetoes content-growing jobs above the cache high-water mark
pub struct CachePressureGatekeeper {
    usage: Arc<CacheUsage>,
}

impl CachePressureGatekeeper {
    pub fn new(usage: Arc<CacheUsage>) -> Self {
        Self { usage }
    }
}

impl Gatekeeper for CachePressureGatekeeper {
    fn name(&self) -> &'static str {
        "cache_pressure"
    }

    fn allows(&self, job: &Job) -> bool {
        !(job.kind.is_content_growing() && self.usage.over_high_water())
    }
}

/// Vetoes network-requiring jobs while offline
pub struct NetworkGatekeeper {
    network: Arc<NetworkMonitor>,
}

impl NetworkGatekeeper {
    pub fn new(network: Arc<NetworkMonitor>) -> Self {
        Self { network }
    }
}

impl Gatekeeper for NetworkGatekeeper {
    fn name(&self) -> &'static str {
        "network"
    }

    fn allows(&self, job: &Job) -> bool {
        !(job.kind.requires_network() && !self.network.is_online())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::job::JobKind;

    fn usage_at(config: &EngineConfig, bytes: u64) -> Arc<CacheUsage> {
        Arc::new(CacheUsage::new(config, bytes))
    }

    #[test]
    fn test_cache_pressure_vetoes_content_growing_only() {
        let config = EngineConfig {
            cache_budget_bytes: 1000,
            ..Default::default()
        };
        let gk = CachePressureGatekeeper::new(usage_at(&config, 950));

        assert!(!gk.allows(&Job::new(1, JobKind::DownloadAttachment { attachment_id: 1 })));
        assert!(!gk.allows(&Job::new(1, JobKind::FetchFullMessageBody { message_id: 1 })));

        // Uploads and header polling keep flowing
        assert!(gk.allows(&Job::new(1, JobKind::UploadAction)));
        assert!(gk.allows(&Job::new(1, JobKind::FetchMessageHeaders { folder_id: 1 })));
        assert!(gk.allows(&Job::new(1, JobKind::EvictFromCache)));
    }

    #[test]
    fn test_cache_pressure_allows_below_high_water() {
        let config = EngineConfig {
            cache_budget_bytes: 1000,
            ..Default::default()
        };
        let gk = CachePressureGatekeeper::new(usage_at(&config, 100));
        assert!(gk.allows(&Job::new(1, JobKind::DownloadAttachment { attachment_id: 1 })));
    }

    #[test]
    fn test_network_gatekeeper() {
        let network = Arc::new(NetworkMonitor::new(false));
        let gk = NetworkGatekeeper::new(network.clone());

        assert!(!gk.allows(&Job::new(1, JobKind::UploadAction)));
        // Eviction is purely local
        assert!(gk.allows(&Job::new(1, JobKind::EvictFromCache)));

        network.set_online(true);
        assert!(gk.allows(&Job::new(1, JobKind::UploadAction)));
    }
}
