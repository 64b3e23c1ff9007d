//! Lifecycle controller
//!
//! Two-state machine driven by application foreground/background signals.
//! Producers subscribe to the state over a watch channel and rebuild their
//! timers on every transition instead of filtering ticks in place.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Application foregrounded: short polling interval
    Active,
    /// Backgrounded: long polling interval
    Passive,
}

impl LifecycleState {
    pub fn poll_interval(&self, config: &EngineConfig) -> Duration {
        match self {
            Self::Active => Duration::from_secs(config.active_poll_interval_secs),
            Self::Passive => Duration::from_secs(config.passive_poll_interval_secs),
        }
    }
}

pub struct LifecycleController {
    tx: watch::Sender<LifecycleState>,
}

impl LifecycleController {
    /// Starts passive; the host signals foreground when it knows
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Passive);
        Self { tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    pub fn set_foreground(&self, foreground: bool) {
        let next = if foreground {
            LifecycleState::Active
        } else {
            LifecycleState::Passive
        };
        let changed = self.tx.send_if_modified(|state| {
            if *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            log::info!("lifecycle transition: {:?}", next);
        }
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_passive() {
        let lifecycle = LifecycleController::new();
        assert_eq!(lifecycle.state(), LifecycleState::Passive);
    }

    #[tokio::test]
    async fn test_transitions_notify_subscribers() {
        let lifecycle = LifecycleController::new();
        let mut rx = lifecycle.subscribe();

        lifecycle.set_foreground(true);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::Active);

        // Same state again does not produce a spurious notification
        lifecycle.set_foreground(true);
        assert!(!rx.has_changed().unwrap());

        lifecycle.set_foreground(false);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::Passive);
    }

    #[test]
    fn test_poll_intervals() {
        let config = EngineConfig::default();
        assert!(
            LifecycleState::Active.poll_interval(&config)
                < LifecycleState::Passive.poll_interval(&config)
        );
    }
}
