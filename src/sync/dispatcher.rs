//! Priority job dispatcher
//!
//! One serial queue per account, a global semaphore across accounts. Jobs
//! are ordered by (work_score, submission seq): cheaper first, FIFO within
//! equal cost. Submission is idempotent on `JobIdentity` - a resubmission
//! supersedes the queued payload in place without losing its position.
//!
//! Gatekeepers run right before execution; a veto re-queues the job after a
//! growing cooldown. Remote failures are classified here: transient errors
//! retry with backoff, re-auth parks the whole account, permanent
//! rejections surface on the status and drop the job.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};

use crate::config::EngineConfig;
use crate::db::Database;
use crate::remote::RemoteError;
use crate::sync::gatekeeper::Gatekeeper;
use crate::sync::job::{Job, JobIdentity};
use crate::sync::runner::JobRunner;
use crate::sync::EngineError;

// ============================================================================
// Account status
// ============================================================================

/// Observable per-account sync state, published over a watch channel.
/// `is_syncing` flips on immediately with work and clears only after the
/// score has stayed at zero for the debounce window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccountStatus {
    pub is_syncing: bool,
    pub total_work_score: u64,
    pub reauth_required: bool,
    pub last_error: Option<String>,
}

// ============================================================================
// Per-account queue
// ============================================================================

#[derive(Default)]
struct QueueState {
    /// Ready jobs keyed by (work_score, submission seq); pop_first yields
    /// the cheapest, oldest job
    ready: BTreeMap<(u32, u64), Job>,
    /// Occupied identity -> its key in `ready`
    identities: HashMap<JobIdentity, (u32, u64)>,
    next_seq: u64,
    inflight_score: u64,
    /// Re-auth park: pop yields nothing until the flag clears
    parked: bool,
    /// Transient-failure attempts per identity
    attempts: HashMap<JobIdentity, u32>,
    /// Consecutive gatekeeper vetoes per identity
    vetoes: HashMap<JobIdentity, u32>,
}

struct AccountQueue {
    account_id: i64,
    state: StdMutex<QueueState>,
    notify: Notify,
    status: watch::Sender<AccountStatus>,
    /// Invalidates in-flight debounced is_syncing clears
    clear_epoch: AtomicU64,
}

impl AccountQueue {
    fn new(account_id: i64, parked: bool) -> Self {
        let status = AccountStatus {
            reauth_required: parked,
            ..Default::default()
        };
        let (tx, _) = watch::channel(status);
        Self {
            account_id,
            state: StdMutex::new(QueueState {
                parked,
                ..Default::default()
            }),
            notify: Notify::new(),
            status: tx,
            clear_epoch: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or supersede. An existing identity keeps its queue position;
    /// only the payload is replaced.
    fn push(&self, job: Job) {
        let identity = job.identity();
        let mut state = self.lock();
        if let Some(&key) = state.identities.get(&identity) {
            log::debug!(
                "job {} superseded in place for account {}",
                job.kind.label(),
                self.account_id
            );
            state.ready.insert(key, job);
        } else {
            let key = (job.work_score, state.next_seq);
            state.next_seq += 1;
            state.ready.insert(key, job);
            state.identities.insert(identity, key);
        }
    }

    fn pop(&self) -> Option<Job> {
        let mut state = self.lock();
        if state.parked {
            return None;
        }
        let (_, job) = state.ready.pop_first()?;
        state.identities.remove(&job.identity());
        state.inflight_score += u64::from(job.work_score);
        Some(job)
    }

    /// The job left its execution slot; its score no longer counts
    fn settle(&self, job: &Job) {
        let mut state = self.lock();
        state.inflight_score = state
            .inflight_score
            .saturating_sub(u64::from(job.work_score));
    }

    fn total_score(&self) -> u64 {
        let state = self.lock();
        let queued: u64 = state.ready.keys().map(|(score, _)| u64::from(*score)).sum();
        queued + state.inflight_score
    }

    fn bump_vetoes(&self, job: &Job) -> u32 {
        let mut state = self.lock();
        let count = state.vetoes.entry(job.identity()).or_insert(0);
        *count += 1;
        *count
    }

    fn bump_attempts(&self, job: &Job) -> u32 {
        let mut state = self.lock();
        let count = state.attempts.entry(job.identity()).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_backoff(&self, job: &Job) {
        let identity = job.identity();
        let mut state = self.lock();
        state.attempts.remove(&identity);
        state.vetoes.remove(&identity);
    }

    fn park(&self) {
        self.lock().parked = true;
        self.status.send_if_modified(|s| {
            if s.reauth_required {
                false
            } else {
                s.reauth_required = true;
                true
            }
        });
        log::warn!(
            "account {} parked pending re-authentication",
            self.account_id
        );
    }

    fn unpark(&self) {
        self.lock().parked = false;
        self.status.send_if_modified(|s| {
            if s.reauth_required {
                s.reauth_required = false;
                true
            } else {
                false
            }
        });
        self.notify.notify_one();
        log::info!("account {} resumed after re-authentication", self.account_id);
    }

    fn set_error(&self, error: String) {
        self.status.send_if_modified(|s| {
            if s.last_error.as_deref() == Some(error.as_str()) {
                false
            } else {
                s.last_error = Some(error.clone());
                true
            }
        });
    }

    /// Publish the current work score. Non-zero turns is_syncing on at
    /// once; zero schedules a debounced clear that a later submission
    /// cancels by bumping the epoch.
    fn publish(self: &Arc<Self>, debounce: Duration) {
        let total = self.total_score();
        if total > 0 {
            self.clear_epoch.fetch_add(1, Ordering::SeqCst);
            self.status.send_if_modified(|s| {
                let changed = !s.is_syncing || s.total_work_score != total;
                s.is_syncing = true;
                s.total_work_score = total;
                changed
            });
        } else {
            self.status.send_if_modified(|s| {
                let changed = s.total_work_score != 0;
                s.total_work_score = 0;
                changed
            });
            let epoch = self.clear_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                let still_idle = queue.clear_epoch.load(Ordering::SeqCst) == epoch
                    && queue.total_score() == 0;
                if still_idle {
                    queue.status.send_if_modified(|s| {
                        if s.is_syncing {
                            s.is_syncing = false;
                            true
                        } else {
                            false
                        }
                    });
                }
            });
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

struct DispatcherInner {
    db: Arc<Database>,
    config: EngineConfig,
    runner: JobRunner,
    gatekeepers: Vec<Arc<dyn Gatekeeper>>,
    semaphore: Arc<Semaphore>,
    queues: StdMutex<HashMap<i64, Arc<AccountQueue>>>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Database>,
        config: EngineConfig,
        runner: JobRunner,
        gatekeepers: Vec<Arc<dyn Gatekeeper>>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            inner: Arc::new(DispatcherInner {
                db,
                config,
                runner,
                gatekeepers,
                semaphore,
                queues: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn submit(&self, job: Job) {
        let queue = self.inner.queue(job.account_id);
        log::debug!(
            "submitted {} (score {}) for account {}",
            job.kind.label(),
            job.work_score,
            job.account_id
        );
        queue.push(job);
        queue.publish(self.inner.debounce());
        queue.notify.notify_one();
    }

    pub fn subscribe(&self, account_id: i64) -> watch::Receiver<AccountStatus> {
        self.inner.queue(account_id).status.subscribe()
    }

    pub fn account_status(&self, account_id: i64) -> AccountStatus {
        self.inner.queue(account_id).status.borrow().clone()
    }

    pub fn total_work_score(&self, account_id: i64) -> u64 {
        self.inner.queue(account_id).total_score()
    }

    /// External auth collaborator finished: persist the cleared flag and
    /// resume the account's queue
    pub fn clear_reauth(&self, account_id: i64) -> Result<(), EngineError> {
        self.inner.db.set_reauth_required(account_id, false)?;
        self.inner.queue(account_id).unpark();
        Ok(())
    }

    /// Wake every queue so gatekeeper-sensitive jobs get re-evaluated
    pub fn poke_all(&self) {
        let queues = self
            .inner
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for queue in queues.values() {
            queue.notify.notify_one();
        }
    }
}

impl DispatcherInner {
    fn debounce(&self) -> Duration {
        Duration::from_millis(self.config.syncing_debounce_ms)
    }

    /// Existing queue for the account, or a new one with its serial loop
    fn queue(self: &Arc<Self>, account_id: i64) -> Arc<AccountQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(queue) = queues.get(&account_id) {
            return Arc::clone(queue);
        }
        // A persisted re-auth flag survives restarts as a parked queue
        let parked = match self.db.get_account(account_id) {
            Ok(account) => account.map(|a| a.reauth_required).unwrap_or(false),
            Err(e) => {
                log::warn!("could not read account {} on queue init: {}", account_id, e);
                false
            }
        };
        let queue = Arc::new(AccountQueue::new(account_id, parked));
        queues.insert(account_id, Arc::clone(&queue));
        tokio::spawn(run_queue(Arc::clone(self), Arc::clone(&queue)));
        queue
    }

    fn schedule_resubmit(self: &Arc<Self>, queue: &Arc<AccountQueue>, job: Job, delay: Duration) {
        let queue = Arc::clone(queue);
        let debounce = self.debounce();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(job);
            queue.publish(debounce);
            queue.notify.notify_one();
        });
    }
}

/// Serial consumer for one account's queue
async fn run_queue(inner: Arc<DispatcherInner>, queue: Arc<AccountQueue>) {
    loop {
        let Some(job) = queue.pop() else {
            queue.notify.notified().await;
            continue;
        };
        queue.publish(inner.debounce());

        // Gatekeepers veto at the last moment, against current conditions
        if let Some(gk) = inner.gatekeepers.iter().find(|g| !g.allows(&job)) {
            let vetoes = queue.bump_vetoes(&job);
            log::debug!(
                "{} vetoed by {} for account {} ({} so far)",
                job.kind.label(),
                gk.name(),
                job.account_id,
                vetoes
            );
            queue.settle(&job);
            inner.schedule_resubmit(&queue, job, inner.config.veto_delay(vetoes));
            continue;
        }

        let permit = match inner.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let result = inner.runner.execute(&job).await;
        drop(permit);
        queue.settle(&job);

        match result {
            Ok(outcome) => {
                queue.clear_backoff(&job);
                if let Some(error) = outcome.status_error {
                    queue.set_error(error);
                }
                for follow_up in outcome.follow_ups {
                    queue.push(follow_up);
                    queue.notify.notify_one();
                }
                if let Some((delayed, delay)) = outcome.delayed {
                    inner.schedule_resubmit(&queue, delayed, delay);
                }
            }
            Err(EngineError::Remote(RemoteError::Transient(reason))) => {
                let attempts = queue.bump_attempts(&job);
                if attempts >= inner.config.max_job_attempts {
                    log::error!(
                        "{} gave up after {} attempts for account {}: {}",
                        job.kind.label(),
                        attempts,
                        job.account_id,
                        reason
                    );
                    queue.set_error(reason);
                    queue.clear_backoff(&job);
                } else {
                    let delay = inner.config.retry_delay(attempts);
                    log::warn!(
                        "{} failed transiently for account {} (attempt {}), retrying in {:?}: {}",
                        job.kind.label(),
                        job.account_id,
                        attempts,
                        delay,
                        reason
                    );
                    inner.schedule_resubmit(&queue, job, delay);
                }
            }
            Err(EngineError::Remote(RemoteError::ReauthRequired)) => {
                if let Err(e) = inner.db.set_reauth_required(job.account_id, true) {
                    log::error!(
                        "could not persist re-auth flag for account {}: {}",
                        job.account_id,
                        e
                    );
                }
                queue.park();
                // Held, not dropped: it resumes when the flag clears
                queue.push(job);
            }
            Err(EngineError::Remote(RemoteError::PermanentRejection(reason))) => {
                log::warn!(
                    "{} rejected permanently for account {}: {}",
                    job.kind.label(),
                    job.account_id,
                    reason
                );
                queue.set_error(reason);
            }
            Err(e) => {
                log::error!(
                    "{} failed for account {}: {}",
                    job.kind.label(),
                    job.account_id,
                    e
                );
                queue.set_error(e.to_string());
            }
        }
        queue.publish(inner.debounce());
    }
}

// ============================================================================
// Tests
// ============================================================================
