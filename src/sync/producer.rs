//! Job producers
//!
//! Background tasks that feed the dispatcher. Each producer owns one
//! concern: header polling at the lifecycle cadence, historical backfill,
//! and scheduled eviction. They only submit jobs; gatekeepers and the
//! dispatcher decide what actually runs. Identity coalescing makes every
//! producer safe to fire redundantly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::sync::dispatcher::Dispatcher;
use crate::sync::eviction::LAST_RUN_SETTING;
use crate::sync::gatekeeper::{CacheUsage, NetworkMonitor};
use crate::sync::job::{Job, JobKind};
use crate::sync::lifecycle::LifecycleState;

// ============================================================================
// Header polling
// ============================================================================

/// Polls every account's primary folder for new headers. The cadence
/// follows the lifecycle state; a transition rebuilds the timer and
/// triggers an immediate poll.
#[derive(Clone)]
pub struct PollingProducer {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    network: Arc<NetworkMonitor>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl PollingProducer {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        network: Arc<NetworkMonitor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            network,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn start(&self, lifecycle_rx: tokio::sync::watch::Receiver<LifecycleState>) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let producer = self.clone();
        let handle = tokio::spawn(async move {
            producer.poll_loop(lifecycle_rx).await;
        });
        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        log::info!("polling producer started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        log::info!("polling producer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn poll_loop(
        &self,
        mut lifecycle_rx: tokio::sync::watch::Receiver<LifecycleState>,
    ) {
        loop {
            let state = *lifecycle_rx.borrow_and_update();
            let mut interval = tokio::time::interval(state.poll_interval(&self.config));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::debug!("polling cadence now {:?}", state);

            loop {
                if !self.running.load(Ordering::Relaxed) {
                    return;
                }
                tokio::select! {
                    _ = interval.tick() => self.poll_once(),
                    changed = lifecycle_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        // Rebuild the timer at the new cadence
                        break;
                    }
                }
            }
        }
    }

    fn poll_once(&self) {
        if !self.network.is_online() {
            log::debug!("poll skipped, offline");
            return;
        }
        let account_ids = match self.db.list_account_ids() {
            Ok(ids) => ids,
            Err(e) => {
                log::error!("poll could not list accounts: {}", e);
                return;
            }
        };
        for account_id in account_ids {
            match self.db.primary_folder(account_id) {
                Ok(Some(folder)) => {
                    self.dispatcher.submit(Job::new(
                        account_id,
                        JobKind::FetchMessageHeaders {
                            folder_id: folder.id,
                        },
                    ));
                }
                // No folders yet: bootstrap with the folder list
                Ok(None) => {
                    self.dispatcher
                        .submit(Job::new(account_id, JobKind::SyncFolderList));
                }
                Err(e) => {
                    log::error!("poll failed for account {}: {}", account_id, e);
                }
            }
        }
    }
}

// ============================================================================
// Historical backfill
// ============================================================================

/// Trickles older history in, folder by folder, until each folder's
/// initial sync window is complete. Pauses under cache pressure.
#[derive(Clone)]
pub struct BackfillProducer {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    network: Arc<NetworkMonitor>,
    usage: Arc<CacheUsage>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackfillProducer {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        network: Arc<NetworkMonitor>,
        usage: Arc<CacheUsage>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            network,
            usage,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let producer = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(producer.config.backfill_interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !producer.running.load(Ordering::Relaxed) {
                    return;
                }
                producer.backfill_once();
            }
        });
        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        log::info!("backfill producer started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        log::info!("backfill producer stopped");
    }

    fn backfill_once(&self) {
        if !self.network.is_online() {
            return;
        }
        // Backfill is the first thing to yield under cache pressure
        if self.usage.over_high_water() {
            log::debug!("backfill paused, cache over high-water mark");
            return;
        }
        if let Err(e) = self.submit_unfinished_folders() {
            log::error!("backfill pass failed: {}", e);
        }
    }

    fn submit_unfinished_folders(&self) -> Result<(), crate::db::DbError> {
        for account_id in self.db.list_account_ids()? {
            for folder in self.db.list_folders(account_id)? {
                let state = self.db.folder_sync_state(account_id, folder.id)?;
                if state.as_ref().map(|s| s.backfill_done).unwrap_or(false) {
                    continue;
                }
                let cursor = state.and_then(|s| s.next_page_token);
                self.dispatcher.submit(Job::new(
                    account_id,
                    JobKind::FetchNextMessageListPage {
                        folder_id: folder.id,
                        cursor,
                        backfill: true,
                    },
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Scheduled eviction
// ============================================================================

/// True when an eviction pass is due: immediately over the hard limit,
/// otherwise once per cadence period.
pub fn eviction_due(
    db: &Database,
    config: &EngineConfig,
    usage: &CacheUsage,
) -> Result<bool, crate::db::DbError> {
    if usage.over_hard_limit() {
        return Ok(true);
    }
    let last_run: Option<String> = db.get_setting(LAST_RUN_SETTING)?;
    let last_run = last_run
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let due = match last_run {
        Some(at) => Utc::now() - at >= ChronoDuration::hours(config.eviction_cadence_hours),
        None => true,
    };
    Ok(due)
}

/// Submits `EvictFromCache` when due. The pass itself is global, so the
/// job rides on the first account's queue.
#[derive(Clone)]
pub struct EvictionProducer {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    usage: Arc<CacheUsage>,
    config: EngineConfig,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl EvictionProducer {
    pub fn new(
        db: Arc<Database>,
        dispatcher: Dispatcher,
        usage: Arc<CacheUsage>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            dispatcher,
            usage,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let producer = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(producer.config.backfill_interval_secs));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !producer.running.load(Ordering::Relaxed) {
                    return;
                }
                producer.check_once();
            }
        });
        *self.task_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        log::info!("eviction producer started");
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        log::info!("eviction producer stopped");
    }

    fn check_once(&self) {
        match eviction_due(&self.db, &self.config, &self.usage) {
            Ok(true) => {
                let account = match self.db.list_account_ids() {
                    Ok(ids) => ids.into_iter().next(),
                    Err(e) => {
                        log::error!("eviction check could not list accounts: {}", e);
                        return;
                    }
                };
                if let Some(account_id) = account {
                    self.dispatcher
                        .submit(Job::new(account_id, JobKind::EvictFromCache));
                }
            }
            Ok(false) => {}
            Err(e) => log::error!("eviction check failed: {}", e),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
