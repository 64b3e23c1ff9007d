//! Engine facade
//!
//! Single entry point the host application talks to. Wires the database,
//! the remote boundary, the dispatcher, the mutation pipeline and the
//! producers together, and exposes the write path, the read-path fetch
//! triggers and the external signals (foreground, connectivity, re-auth).
//!
//! Must be constructed inside a Tokio runtime; per-account dispatch loops
//! and producers run as spawned tasks.

use std::sync::Arc;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::remote::RemoteMailService;
use crate::sync::dispatcher::{AccountStatus, Dispatcher};
use crate::sync::gatekeeper::{
    CachePressureGatekeeper, CacheUsage, Gatekeeper, NetworkGatekeeper, NetworkMonitor,
};
use crate::sync::job::{Job, JobKind};
use crate::sync::lifecycle::LifecycleController;
use crate::sync::mutations::{DraftContent, MutationPipeline, MutationStats, PendingMutation};
use crate::sync::producer::{BackfillProducer, EvictionProducer, PollingProducer};
use crate::sync::runner::JobRunner;
use crate::sync::{EngineError, EngineResult};

pub struct SyncEngine {
    db: Arc<Database>,
    config: EngineConfig,
    usage: Arc<CacheUsage>,
    network: Arc<NetworkMonitor>,
    lifecycle: LifecycleController,
    pipeline: MutationPipeline,
    dispatcher: Dispatcher,
    polling: PollingProducer,
    backfill: BackfillProducer,
    eviction: EvictionProducer,
}

impl SyncEngine {
    /// Builds the engine and recovers any pending mutations left over from
    /// the previous run. Producers stay idle until `start` is called.
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteMailService>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let initial_used = db.compute_cache_usage()?;
        let usage = Arc::new(CacheUsage::new(&config, initial_used));
        let network = Arc::new(NetworkMonitor::new(true));
        let lifecycle = LifecycleController::new();

        let gatekeepers: Vec<Arc<dyn Gatekeeper>> = vec![
            Arc::new(NetworkGatekeeper::new(Arc::clone(&network))),
            Arc::new(CachePressureGatekeeper::new(Arc::clone(&usage))),
        ];

        let pipeline = MutationPipeline::new(Arc::clone(&db), Arc::clone(&remote), config.clone());
        let runner = JobRunner::new(
            Arc::clone(&db),
            remote,
            config.clone(),
            Arc::clone(&usage),
            pipeline.clone(),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&db), config.clone(), runner, gatekeepers);

        let polling = PollingProducer::new(
            Arc::clone(&db),
            dispatcher.clone(),
            Arc::clone(&network),
            config.clone(),
        );
        let backfill = BackfillProducer::new(
            Arc::clone(&db),
            dispatcher.clone(),
            Arc::clone(&network),
            Arc::clone(&usage),
            config.clone(),
        );
        let eviction = EvictionProducer::new(
            Arc::clone(&db),
            dispatcher.clone(),
            Arc::clone(&usage),
            config.clone(),
        );

        let engine = Self {
            db,
            config,
            usage,
            network,
            lifecycle,
            pipeline,
            dispatcher,
            polling,
            backfill,
            eviction,
        };
        engine.recover_pending()?;
        Ok(engine)
    }

    /// Re-submit upload work for mutations persisted before a restart.
    /// The rows are the source of truth; the jobs are reconstructed.
    fn recover_pending(&self) -> EngineResult<()> {
        for account_id in self.db.list_account_ids()? {
            let open = self.pipeline.count_open(account_id)?;
            if open > 0 {
                log::info!(
                    "recovered {} pending mutations for account {}",
                    open,
                    account_id
                );
                self.dispatcher
                    .submit(Job::new(account_id, JobKind::UploadAction));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle and external signals
    // ------------------------------------------------------------------------

    pub fn start(&self) {
        self.polling.start(self.lifecycle.subscribe());
        self.backfill.start();
        self.eviction.start();
    }

    pub fn stop(&self) {
        self.polling.stop();
        self.backfill.stop();
        self.eviction.stop();
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.lifecycle.set_foreground(foreground);
    }

    pub fn set_online(&self, online: bool) {
        self.network.set_online(online);
        if online {
            // Vetoed work gets re-evaluated right away
            self.dispatcher.poke_all();
        }
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    /// Auth collaborator finished re-authenticating the account
    pub fn clear_reauth(&self, account_id: i64) -> EngineResult<()> {
        self.dispatcher.clear_reauth(account_id)?;
        if self.pipeline.count_open(account_id)? > 0 {
            self.dispatcher
                .submit(Job::new(account_id, JobKind::UploadAction));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------------

    pub fn subscribe_status(&self, account_id: i64) -> watch::Receiver<AccountStatus> {
        self.dispatcher.subscribe(account_id)
    }

    pub fn account_status(&self, account_id: i64) -> AccountStatus {
        self.dispatcher.account_status(account_id)
    }

    pub fn total_work_score(&self, account_id: i64) -> u64 {
        self.dispatcher.total_work_score(account_id)
    }

    pub fn cache_bytes_used(&self) -> u64 {
        self.usage.bytes_used()
    }

    pub fn mutation_stats(&self, account_id: i64) -> EngineResult<MutationStats> {
        self.pipeline.stats(account_id)
    }

    pub fn list_failed_mutations(&self, account_id: i64) -> EngineResult<Vec<PendingMutation>> {
        self.pipeline.list_failed(account_id)
    }

    // ------------------------------------------------------------------------
    // Write path: optimistic local apply + durable queue + upload job
    // ------------------------------------------------------------------------

    pub fn mark_read(&self, account_id: i64, message_id: i64, read: bool) -> EngineResult<()> {
        let job = self.pipeline.mark_read(account_id, message_id, read)?;
        self.dispatcher.submit(job);
        Ok(())
    }

    pub fn set_starred(&self, account_id: i64, message_id: i64, starred: bool) -> EngineResult<()> {
        let job = self.pipeline.set_starred(account_id, message_id, starred)?;
        self.dispatcher.submit(job);
        Ok(())
    }

    pub fn delete_message(&self, account_id: i64, message_id: i64) -> EngineResult<()> {
        let job = self.pipeline.delete_message(account_id, message_id)?;
        self.dispatcher.submit(job);
        Ok(())
    }

    pub fn move_message(
        &self,
        account_id: i64,
        message_id: i64,
        source_folder_id: i64,
        target_folder_id: i64,
    ) -> EngineResult<()> {
        let job =
            self.pipeline
                .move_message(account_id, message_id, source_folder_id, target_folder_id)?;
        self.dispatcher.submit(job);
        Ok(())
    }

    pub fn send_message(&self, account_id: i64, draft: &DraftContent) -> EngineResult<()> {
        let job = self.pipeline.send_message(account_id, draft)?;
        self.dispatcher.submit(job);
        Ok(())
    }

    pub fn create_draft(&self, account_id: i64, draft: &DraftContent) -> EngineResult<()> {
        let job = self.pipeline.create_draft(account_id, draft)?;
        self.dispatcher.submit(job);
        Ok(())
    }

    pub fn update_draft(
        &self,
        account_id: i64,
        message_id: i64,
        draft: &DraftContent,
    ) -> EngineResult<()> {
        let job = self.pipeline.update_draft(account_id, message_id, draft)?;
        self.dispatcher.submit(job);
        Ok(())
    }

    /// Reset failed mutations to pending and resume draining
    pub fn retry_failed_mutations(&self, account_id: i64) -> EngineResult<()> {
        if let Some(job) = self.pipeline.retry_failed(account_id)? {
            self.dispatcher.submit(job);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Read path: cache first, fetch on miss
    // ------------------------------------------------------------------------

    /// Body from the cache if present; otherwise queue the fetch and
    /// return None. Either way the access stamp is refreshed.
    pub fn open_message(&self, account_id: i64, message_id: i64) -> EngineResult<Option<String>> {
        self.db.touch_message(message_id)?;
        if let Some(body) = self.db.message_body(message_id)? {
            return Ok(Some(body));
        }
        self.dispatcher
            .submit(Job::new(account_id, JobKind::FetchFullMessageBody { message_id }));
        Ok(None)
    }

    pub fn request_attachment(&self, account_id: i64, attachment_id: i64) {
        self.dispatcher
            .submit(Job::new(account_id, JobKind::DownloadAttachment { attachment_id }));
    }

    // ------------------------------------------------------------------------
    // Explicit sync triggers
    // ------------------------------------------------------------------------

    pub fn sync_folder_list(&self, account_id: i64) {
        self.dispatcher
            .submit(Job::new(account_id, JobKind::SyncFolderList));
    }

    pub fn refresh_folder(&self, account_id: i64, folder_id: i64) {
        self.dispatcher
            .submit(Job::new(account_id, JobKind::FetchMessageHeaders { folder_id }));
    }

    /// User-initiated pull-to-refresh: drop cursors and re-list
    pub fn force_refresh_folder(&self, account_id: i64, folder_id: i64) {
        self.dispatcher
            .submit(Job::new(account_id, JobKind::ForceRefreshFolder { folder_id }));
    }

    pub fn search_online(&self, account_id: i64, query: &str, folder_id: Option<i64>) {
        self.dispatcher.submit(Job::new(
            account_id,
            JobKind::SearchOnline {
                query: query.to_string(),
                folder_id,
            },
        ));
    }

    /// Queue an eviction pass outside the normal cadence
    pub fn request_eviction(&self) -> EngineResult<()> {
        let account = self.db.list_account_ids()?.into_iter().next();
        let Some(account_id) = account else {
            return Err(EngineError::MissingEntity("no accounts".into()));
        };
        self.dispatcher
            .submit(Job::new(account_id, JobKind::EvictFromCache));
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }
}
