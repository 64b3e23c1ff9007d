//! Job execution
//!
//! One function per job kind, each running inside a single dispatch slot.
//! A successful execution may return follow-up jobs (continuation pages,
//! further uploads); the dispatcher submits them. Errors propagate
//! unclassified; the dispatcher owns retry and parking policy.

use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::remote::RemoteMailService;
use crate::sync::eviction;
use crate::sync::gatekeeper::CacheUsage;
use crate::sync::job::{Job, JobKind};
use crate::sync::mutations::{MutationPipeline, UploadOutcome};
use crate::sync::{EngineError, EngineResult};

/// What a finished job asks the dispatcher to do next
#[derive(Debug, Default)]
pub struct ExecOutcome {
    /// Submit immediately
    pub follow_ups: Vec<Job>,
    /// Submit after a delay (mutation retry backoff)
    pub delayed: Option<(Job, std::time::Duration)>,
    /// Record on the account status without failing the job
    pub status_error: Option<String>,
}

impl ExecOutcome {
    fn with_follow_up(job: Job) -> Self {
        Self {
            follow_ups: vec![job],
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    db: Arc<Database>,
    remote: Arc<dyn RemoteMailService>,
    config: EngineConfig,
    usage: Arc<CacheUsage>,
    pipeline: MutationPipeline,
}

impl JobRunner {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteMailService>,
        config: EngineConfig,
        usage: Arc<CacheUsage>,
        pipeline: MutationPipeline,
    ) -> Self {
        Self {
            db,
            remote,
            config,
            usage,
            pipeline,
        }
    }

    pub async fn execute(&self, job: &Job) -> EngineResult<ExecOutcome> {
        let account_id = job.account_id;
        match &job.kind {
            JobKind::SyncFolderList => self.sync_folder_list(account_id).await,
            JobKind::ForceRefreshFolder { folder_id } => {
                self.db.clear_folder_cursor(account_id, *folder_id)?;
                self.fetch_page(account_id, *folder_id, None, false).await
            }
            JobKind::FetchMessageHeaders { folder_id } => {
                let cursor = self
                    .db
                    .folder_sync_state(account_id, *folder_id)?
                    .and_then(|s| s.delta_token);
                self.fetch_page(account_id, *folder_id, cursor, false).await
            }
            JobKind::FetchNextMessageListPage {
                folder_id,
                cursor,
                backfill,
            } => {
                self.fetch_page(account_id, *folder_id, cursor.clone(), *backfill)
                    .await
            }
            JobKind::FetchFullMessageBody { message_id } => {
                self.fetch_body(account_id, *message_id).await
            }
            JobKind::DownloadAttachment { attachment_id } => {
                self.download_attachment(account_id, *attachment_id).await
            }
            JobKind::SearchOnline { query, folder_id } => {
                self.search_online(account_id, query, *folder_id).await
            }
            JobKind::UploadAction => self.upload_action(account_id).await,
            JobKind::EvictFromCache => {
                let report = eviction::run(&self.db, &self.config, &self.usage)?;
                log::debug!(
                    "eviction job freed {} bytes for account {}",
                    report.bytes_freed,
                    account_id
                );
                Ok(ExecOutcome::default())
            }
        }
    }

    async fn sync_folder_list(&self, account_id: i64) -> EngineResult<ExecOutcome> {
        let cursor = self.db.folders_cursor(account_id)?;
        let page = self.remote.list_folders(account_id, cursor.as_deref()).await?;
        for folder in &page.folders {
            self.db.upsert_folder(account_id, folder)?;
        }
        self.db
            .set_folders_cursor(account_id, page.cursor.as_deref())?;
        log::info!(
            "folder list synced for account {}: {} folders",
            account_id,
            page.folders.len()
        );
        Ok(ExecOutcome::default())
    }

    /// Fetch one page of headers and persist it. The cursor goes back into
    /// folder_sync_state after every successful page, so an interrupted
    /// multi-page sync resumes where it stopped.
    async fn fetch_page(
        &self,
        account_id: i64,
        folder_id: i64,
        cursor: Option<String>,
        backfill: bool,
    ) -> EngineResult<ExecOutcome> {
        let folder = self
            .db
            .folder_by_id(folder_id)?
            .ok_or_else(|| EngineError::MissingEntity(format!("folder {}", folder_id)))?;

        let earliest = backfill
            .then(|| Utc::now() - Duration::days(self.config.initial_sync_window_days));

        let page = self
            .remote
            .list_messages(account_id, &folder.remote_id, cursor.as_deref(), earliest)
            .await?;

        for msg in &page.messages {
            let message_id = self.db.upsert_message_header(account_id, msg)?;

            // Resync is the last writer for the association set. Label-style
            // providers send the full set; otherwise the listed folder is it.
            let mut folder_ids = Vec::new();
            for remote_folder_id in &msg.folder_remote_ids {
                if let Some(f) = self.db.folder_by_remote_id(account_id, remote_folder_id)? {
                    folder_ids.push(f.id);
                }
            }
            if folder_ids.is_empty() {
                folder_ids.push(folder_id);
            }
            self.db.replace_folder_associations(message_id, &folder_ids)?;

            // Remote flags only apply when no local write is still in flight
            if !self.pipeline.references_message(message_id)? {
                self.db
                    .apply_remote_flags(message_id, msg.is_read, msg.is_starred)?;
            }

            for att in &msg.attachments {
                self.db.upsert_attachment_meta(message_id, att)?;
            }
        }

        self.db.save_folder_sync_state(
            account_id,
            folder_id,
            page.delta_token.as_deref(),
            page.cursor.as_deref(),
        )?;

        log::info!(
            "fetched {} headers for folder {} (account {}, backfill={})",
            page.messages.len(),
            folder.name,
            account_id,
            backfill
        );

        if let Some(next) = page.cursor {
            // Continuation submits itself; no external trigger needed
            Ok(ExecOutcome::with_follow_up(Job::new(
                account_id,
                JobKind::FetchNextMessageListPage {
                    folder_id,
                    cursor: Some(next),
                    backfill,
                },
            )))
        } else {
            if backfill {
                self.db.mark_backfill_done(account_id, folder_id)?;
                log::info!("backfill complete for folder {}", folder_id);
            }
            Ok(ExecOutcome::default())
        }
    }

    async fn fetch_body(&self, account_id: i64, message_id: i64) -> EngineResult<ExecOutcome> {
        let Some(remote_id) = self.db.message_remote_id(message_id)? else {
            // Message was deleted locally while the job sat queued
            log::debug!("body fetch dropped, message {} no longer cached", message_id);
            return Ok(ExecOutcome::default());
        };
        let body = self.remote.fetch_body(account_id, &remote_id).await?;
        let bytes = self.db.store_message_body(message_id, &body)?;
        self.usage.add_bytes(bytes);
        Ok(ExecOutcome::default())
    }

    async fn download_attachment(
        &self,
        account_id: i64,
        attachment_id: i64,
    ) -> EngineResult<ExecOutcome> {
        let Some(meta) = self.db.attachment_meta(attachment_id)? else {
            log::debug!("attachment {} no longer cached, dropping download", attachment_id);
            return Ok(ExecOutcome::default());
        };
        if meta.cached {
            return Ok(ExecOutcome::default());
        }
        let data = self
            .remote
            .fetch_attachment(account_id, &meta.remote_id)
            .await?;
        let bytes = self.db.store_attachment_data(attachment_id, &data)?;
        self.usage.add_bytes(bytes);
        log::info!(
            "downloaded attachment {} ({} bytes) for account {}",
            meta.filename,
            bytes,
            account_id
        );
        Ok(ExecOutcome::default())
    }

    async fn search_online(
        &self,
        account_id: i64,
        query: &str,
        folder_id: Option<i64>,
    ) -> EngineResult<ExecOutcome> {
        let folder_remote_id = match folder_id {
            Some(id) => self.db.folder_by_id(id)?.map(|f| f.remote_id),
            None => None,
        };
        let results = self
            .remote
            .search(account_id, query, folder_remote_id.as_deref())
            .await?;
        // Cache search hits as headers without disturbing folder cursors
        for msg in &results {
            let message_id = self.db.upsert_message_header(account_id, msg)?;
            if let Some(folder_id) = folder_id {
                self.db.add_folder_association(message_id, folder_id)?;
            }
        }
        log::info!(
            "online search '{}' returned {} results for account {}",
            query,
            results.len(),
            account_id
        );
        Ok(ExecOutcome::default())
    }

    async fn upload_action(&self, account_id: i64) -> EngineResult<ExecOutcome> {
        match self.pipeline.process_next(account_id).await? {
            UploadOutcome::Drained => Ok(ExecOutcome::default()),
            UploadOutcome::Delivered { more_pending } => {
                if more_pending {
                    // Keep draining in creation order
                    Ok(ExecOutcome::with_follow_up(Job::new(
                        account_id,
                        JobKind::UploadAction,
                    )))
                } else {
                    Ok(ExecOutcome::default())
                }
            }
            UploadOutcome::RetryLater { delay } => Ok(ExecOutcome {
                delayed: Some((Job::new(account_id, JobKind::UploadAction), delay)),
                ..Default::default()
            }),
            UploadOutcome::Failed { error, more_pending } => {
                let mut outcome = ExecOutcome {
                    status_error: Some(error),
                    ..Default::default()
                };
                if more_pending {
                    outcome
                        .follow_ups
                        .push(Job::new(account_id, JobKind::UploadAction));
                }
                Ok(outcome)
            }
            UploadOutcome::Reauth => Err(EngineError::Remote(
                crate::remote::RemoteError::ReauthRequired,
            )),
        }
    }
}
