//! Pending-mutation pipeline - durable, ordered, at-least-once user writes
//!
//! Write-path calls never touch the provider directly. Each call applies an
//! optimistic local mutation, persists a pending_mutations row, and hands
//! back an `UploadAction` job for the dispatcher. The row is created before
//! the job so a crash between the two only costs a redundant upload attempt,
//! never a lost write. Rows drain FIFO per account and are deleted only on
//! confirmed remote success.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::remote::{MutationKind, RemoteError, RemoteMailService};
use crate::sync::job::{Job, JobKind};
use crate::sync::EngineError;

// ============================================================================
// Data types
// ============================================================================

/// Pending mutation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Retry,
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "retry" => Self::Retry,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Durable record of a user-initiated write awaiting remote confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: i64,
    pub account_id: i64,
    pub action: MutationKind,
    pub entity_id: Option<i64>,
    pub payload: serde_json::Value,
    pub status: MutationStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Queue statistics for presentation layers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationStats {
    pub pending_count: i32,
    pub retry_count: i32,
    pub failed_count: i32,
    pub total_count: i32,
}

/// Draft or outgoing message content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftContent {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Result of processing one `UploadAction`
#[derive(Debug)]
pub enum UploadOutcome {
    /// Nothing left to deliver
    Drained,
    /// One mutation confirmed and deleted
    Delivered { more_pending: bool },
    /// Transient failure; re-submit the upload job after this delay
    RetryLater { delay: Duration },
    /// Mutation is terminally failed; remaining ones may still drain
    Failed { error: String, more_pending: bool },
    /// Provider demands re-authentication; park the account
    Reauth,
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Clone)]
pub struct MutationPipeline {
    db: Arc<Database>,
    remote: Arc<dyn RemoteMailService>,
    config: EngineConfig,
}

impl MutationPipeline {
    pub fn new(db: Arc<Database>, remote: Arc<dyn RemoteMailService>, config: EngineConfig) -> Self {
        Self { db, remote, config }
    }

    // ------------------------------------------------------------------------
    // Write-path API: optimistic local write + durable enqueue.
    // Each returns the UploadAction job the caller must submit.
    // ------------------------------------------------------------------------

    pub fn mark_read(&self, account_id: i64, message_id: i64, read: bool) -> Result<Job, EngineError> {
        let remote_id = self.require_remote_id(message_id)?;
        self.db.set_message_read(message_id, read)?;
        self.enqueue(
            account_id,
            MutationKind::MarkRead,
            Some(message_id),
            json!({ "remote_id": remote_id, "read": read }),
        )
    }

    pub fn set_starred(&self, account_id: i64, message_id: i64, starred: bool) -> Result<Job, EngineError> {
        let remote_id = self.require_remote_id(message_id)?;
        self.db.set_message_starred(message_id, starred)?;
        self.enqueue(
            account_id,
            MutationKind::Star,
            Some(message_id),
            json!({ "remote_id": remote_id, "starred": starred }),
        )
    }

    pub fn delete_message(&self, account_id: i64, message_id: i64) -> Result<Job, EngineError> {
        // Capture the remote id before the optimistic delete removes the row
        let remote_id = self.require_remote_id(message_id)?;
        self.db.delete_message_local(message_id)?;
        self.enqueue(
            account_id,
            MutationKind::Delete,
            Some(message_id),
            json!({ "remote_id": remote_id }),
        )
    }

    pub fn move_message(
        &self,
        account_id: i64,
        message_id: i64,
        source_folder_id: i64,
        target_folder_id: i64,
    ) -> Result<Job, EngineError> {
        let remote_id = self.require_remote_id(message_id)?;
        let target = self
            .db
            .folder_by_id(target_folder_id)?
            .ok_or_else(|| EngineError::MissingEntity(format!("folder {}", target_folder_id)))?;
        self.db
            .reassign_folder(message_id, source_folder_id, target_folder_id)?;
        self.enqueue(
            account_id,
            MutationKind::Move,
            Some(message_id),
            json!({ "remote_id": remote_id, "target_folder": target.remote_id }),
        )
    }

    /// Queue an outgoing message. A local placeholder row stands in until
    /// the provider confirms and assigns the real message id.
    pub fn send_message(&self, account_id: i64, draft: &DraftContent) -> Result<Job, EngineError> {
        let sender = self
            .db
            .get_account(account_id)?
            .map(|a| a.email)
            .unwrap_or_default();
        let sent_folder = self.db.folder_by_role(account_id, "sent")?.map(|f| f.id);
        let message_id =
            self.db
                .insert_local_message(account_id, sent_folder, &draft.subject, &sender, &draft.body)?;
        self.enqueue(
            account_id,
            MutationKind::Send,
            Some(message_id),
            json!({ "draft": draft }),
        )
    }

    pub fn create_draft(&self, account_id: i64, draft: &DraftContent) -> Result<Job, EngineError> {
        let sender = self
            .db
            .get_account(account_id)?
            .map(|a| a.email)
            .unwrap_or_default();
        let drafts_folder = self.db.folder_by_role(account_id, "drafts")?.map(|f| f.id);
        let message_id =
            self.db
                .insert_local_message(account_id, drafts_folder, &draft.subject, &sender, &draft.body)?;
        self.enqueue(
            account_id,
            MutationKind::CreateDraft,
            Some(message_id),
            json!({ "draft": draft }),
        )
    }

    pub fn update_draft(
        &self,
        account_id: i64,
        message_id: i64,
        draft: &DraftContent,
    ) -> Result<Job, EngineError> {
        let remote_id = self.require_remote_id(message_id)?;
        self.db
            .update_local_draft(message_id, &draft.subject, &draft.body)?;
        self.enqueue(
            account_id,
            MutationKind::UpdateDraft,
            Some(message_id),
            json!({ "remote_id": remote_id, "draft": draft }),
        )
    }

    fn require_remote_id(&self, message_id: i64) -> Result<String, EngineError> {
        self.db
            .message_remote_id(message_id)?
            .ok_or_else(|| EngineError::MissingEntity(format!("message {}", message_id)))
    }

    /// Persist the mutation row, then hand back the job referencing it
    fn enqueue(
        &self,
        account_id: i64,
        action: MutationKind,
        entity_id: Option<i64>,
        payload: serde_json::Value,
    ) -> Result<Job, EngineError> {
        let now = Utc::now().to_rfc3339();
        let id = self.db.insert(
            r#"
            INSERT INTO pending_mutations (account_id, action_type, entity_id, payload, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
            "#,
            params![account_id, action.as_str(), entity_id, payload.to_string(), now],
        )?;
        log::info!(
            "queued mutation {} ({}) for account {}",
            id,
            action.as_str(),
            account_id
        );
        Ok(Job::new(account_id, JobKind::UploadAction))
    }

    // ------------------------------------------------------------------------
    // Upload processing
    // ------------------------------------------------------------------------

    /// Deliver the oldest non-terminal mutation for the account.
    /// Creation order is the delivery order, always.
    pub async fn process_next(&self, account_id: i64) -> Result<UploadOutcome, EngineError> {
        let Some(mutation) = self.oldest_open(account_id)? else {
            return Ok(UploadOutcome::Drained);
        };

        let entity_remote_id = mutation
            .payload
            .get("remote_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        log::debug!(
            "delivering mutation {} ({}) attempt {}",
            mutation.id,
            mutation.action.as_str(),
            mutation.attempt_count + 1
        );

        match self
            .remote
            .apply_mutation(
                account_id,
                mutation.action,
                entity_remote_id.as_deref(),
                &mutation.payload,
            )
            .await
        {
            Ok(outcome) => {
                if let (Some(new_id), Some(entity_id)) = (&outcome.new_remote_id, mutation.entity_id)
                {
                    // Server-assigned id replaces the local placeholder
                    self.db.assign_remote_id(entity_id, new_id)?;
                }
                self.delete(mutation.id)?;
                log::info!(
                    "mutation {} ({}) confirmed for account {}",
                    mutation.id,
                    mutation.action.as_str(),
                    account_id
                );
                Ok(UploadOutcome::Delivered {
                    more_pending: self.count_open(account_id)? > 0,
                })
            }
            Err(RemoteError::ReauthRequired) => {
                log::warn!(
                    "mutation {} needs re-authentication for account {}",
                    mutation.id,
                    account_id
                );
                Ok(UploadOutcome::Reauth)
            }
            Err(RemoteError::PermanentRejection(reason)) => {
                self.mark_failed(mutation.id, mutation.attempt_count + 1, &reason)?;
                log::warn!(
                    "mutation {} rejected permanently: {} (no retry)",
                    mutation.id,
                    reason
                );
                Ok(UploadOutcome::Failed {
                    error: reason,
                    more_pending: self.count_open(account_id)? > 0,
                })
            }
            Err(RemoteError::Transient(reason)) => {
                let attempts = mutation.attempt_count + 1;
                if attempts >= self.config.max_mutation_attempts {
                    self.mark_failed(mutation.id, attempts, &reason)?;
                    log::warn!(
                        "mutation {} failed after {} attempts: {}",
                        mutation.id,
                        attempts,
                        reason
                    );
                    Ok(UploadOutcome::Failed {
                        error: reason,
                        more_pending: self.count_open(account_id)? > 0,
                    })
                } else {
                    self.mark_retry(mutation.id, attempts, &reason)?;
                    let delay = self.config.retry_delay(attempts as u32);
                    log::info!(
                        "mutation {} will retry in {:?} (attempt {}/{})",
                        mutation.id,
                        delay,
                        attempts,
                        self.config.max_mutation_attempts
                    );
                    Ok(UploadOutcome::RetryLater { delay })
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queue inspection / maintenance
    // ------------------------------------------------------------------------

    /// Oldest mutation still awaiting delivery (pending or retry)
    pub fn oldest_open(&self, account_id: i64) -> Result<Option<PendingMutation>, EngineError> {
        let rows = self.db.query(
            r#"
            SELECT id, account_id, action_type, entity_id, payload, status, attempt_count, last_error, created_at
            FROM pending_mutations
            WHERE account_id = ?1 AND status IN ('pending', 'retry')
            ORDER BY id ASC
            LIMIT 1
            "#,
            params![account_id],
            map_mutation,
        )?;
        Ok(rows.into_iter().next())
    }

    pub fn count_open(&self, account_id: i64) -> Result<i64, EngineError> {
        let count = self
            .db
            .query_row(
                "SELECT COUNT(*) FROM pending_mutations WHERE account_id = ?1 AND status IN ('pending', 'retry')",
                params![account_id],
                |row| row.get(0),
            )?
            .unwrap_or(0);
        Ok(count)
    }

    /// True if any mutation (terminal or not) still references the message.
    /// Used by eviction: anything a user write refers to stays cached.
    pub fn references_message(&self, message_id: i64) -> Result<bool, EngineError> {
        let exists: Option<i64> = self.db.query_row(
            "SELECT 1 FROM pending_mutations WHERE entity_id = ?1 LIMIT 1",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(exists.is_some())
    }

    pub fn stats(&self, account_id: i64) -> Result<MutationStats, EngineError> {
        let stats = self
            .db
            .query_row(
                r#"
                SELECT
                    SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'retry' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                    COUNT(*)
                FROM pending_mutations
                WHERE account_id = ?1
                "#,
                params![account_id],
                |row| {
                    Ok(MutationStats {
                        pending_count: row.get::<_, Option<i32>>(0)?.unwrap_or(0),
                        retry_count: row.get::<_, Option<i32>>(1)?.unwrap_or(0),
                        failed_count: row.get::<_, Option<i32>>(2)?.unwrap_or(0),
                        total_count: row.get::<_, Option<i32>>(3)?.unwrap_or(0),
                    })
                },
            )?
            .unwrap_or_default();
        Ok(stats)
    }

    pub fn list_failed(&self, account_id: i64) -> Result<Vec<PendingMutation>, EngineError> {
        Ok(self.db.query(
            r#"
            SELECT id, account_id, action_type, entity_id, payload, status, attempt_count, last_error, created_at
            FROM pending_mutations
            WHERE account_id = ?1 AND status = 'failed'
            ORDER BY id ASC
            "#,
            params![account_id],
            map_mutation,
        )?)
    }

    /// Explicit user retry: reset failed rows and hand back an upload job
    pub fn retry_failed(&self, account_id: i64) -> Result<Option<Job>, EngineError> {
        let updated = self.db.execute(
            r#"
            UPDATE pending_mutations
            SET status = 'pending', attempt_count = 0, last_error = NULL, updated_at = ?1
            WHERE account_id = ?2 AND status = 'failed'
            "#,
            params![Utc::now().to_rfc3339(), account_id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        log::info!("reset {} failed mutations for account {}", updated, account_id);
        Ok(Some(Job::new(account_id, JobKind::UploadAction)))
    }

    fn mark_retry(&self, id: i64, attempts: i32, error: &str) -> Result<(), EngineError> {
        self.db.execute(
            r#"
            UPDATE pending_mutations
            SET status = 'retry', attempt_count = ?1, last_error = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![attempts, error, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: i64, attempts: i32, error: &str) -> Result<(), EngineError> {
        self.db.execute(
            r#"
            UPDATE pending_mutations
            SET status = 'failed', attempt_count = ?1, last_error = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![attempts, error, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<(), EngineError> {
        self.db
            .execute("DELETE FROM pending_mutations WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn map_mutation(row: &rusqlite::Row) -> rusqlite::Result<PendingMutation> {
    let action_raw: String = row.get(2)?;
    let payload_raw: String = row.get(4)?;
    Ok(PendingMutation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        action: MutationKind::from_str(&action_raw).ok_or(rusqlite::Error::InvalidQuery)?,
        entity_id: row.get(3)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        status: MutationStatus::from_str(&row.get::<_, String>(5)?),
        attempt_count: row.get(6)?,
        last_error: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(8)?)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .map_err(|_| rusqlite::Error::InvalidQuery)?,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::MockRemote;

    fn setup() -> (Arc<Database>, MutationPipeline, i64, i64, Arc<MockRemote>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let account = db.add_account("u@example.com", "U").unwrap();
        let remote = Arc::new(MockRemote::new());
        let pipeline = MutationPipeline::new(
            db.clone(),
            remote.clone(),
            EngineConfig {
                max_mutation_attempts: 3,
                ..Default::default()
            },
        );
        let msg = crate::remote::RemoteMessage {
            remote_id: "m1".into(),
            subject: "s".into(),
            sender: "a@example.com".into(),
            snippet: "s".into(),
            received_at: Utc::now(),
            is_read: false,
            is_starred: false,
            folder_remote_ids: vec![],
            attachments: vec![],
        };
        let message_id = db.upsert_message_header(account, &msg).unwrap();
        (db, pipeline, account, message_id, remote)
    }

    #[test]
    fn test_mark_read_is_optimistic_and_durable() {
        let (db, pipeline, account, message_id, _remote) = setup();

        let job = pipeline.mark_read(account, message_id, true).unwrap();
        assert_eq!(job.kind, JobKind::UploadAction);

        // Optimistic flag visible immediately
        assert!(db.message_header(message_id).unwrap().unwrap().is_read);

        // Durable row persisted before the job runs
        let open = pipeline.oldest_open(account).unwrap().unwrap();
        assert_eq!(open.action, MutationKind::MarkRead);
        assert_eq!(open.entity_id, Some(message_id));
        assert_eq!(open.payload["remote_id"], "m1");
        assert_eq!(open.status, MutationStatus::Pending);
    }

    #[tokio::test]
    async fn test_delivery_order_is_creation_order() {
        let (_db, pipeline, account, message_id, remote) = setup();

        pipeline.mark_read(account, message_id, true).unwrap();
        pipeline.set_starred(account, message_id, true).unwrap();
        pipeline.mark_read(account, message_id, false).unwrap();

        loop {
            match pipeline.process_next(account).await.unwrap() {
                UploadOutcome::Drained => break,
                UploadOutcome::Delivered { .. } => continue,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        let applied = remote.applied_mutations();
        assert_eq!(
            applied,
            vec![MutationKind::MarkRead, MutationKind::Star, MutationKind::MarkRead]
        );
    }

    #[tokio::test]
    async fn test_permanent_rejection_fails_without_retry() {
        let (_db, pipeline, account, _message_id, remote) = setup();
        remote.fail_mutations_with(RemoteError::PermanentRejection("invalid recipient".into()));

        pipeline
            .send_message(
                account,
                &DraftContent {
                    to: vec!["bad@".into()],
                    subject: "hi".into(),
                    body: "hello".into(),
                },
            )
            .unwrap();

        match pipeline.process_next(account).await.unwrap() {
            UploadOutcome::Failed { error, more_pending } => {
                assert!(error.contains("invalid recipient"));
                assert!(!more_pending);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let stats = pipeline.stats(account).unwrap();
        assert_eq!(stats.failed_count, 1);
        let failed = pipeline.list_failed(account).unwrap();
        assert_eq!(failed[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_fails() {
        let (_db, pipeline, account, message_id, remote) = setup();
        remote.fail_mutations_with(RemoteError::Transient("timeout".into()));

        pipeline.mark_read(account, message_id, true).unwrap();

        // Two transient attempts stay retryable
        for _ in 0..2 {
            match pipeline.process_next(account).await.unwrap() {
                UploadOutcome::RetryLater { .. } => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        // Third hits the ceiling
        match pipeline.process_next(account).await.unwrap() {
            UploadOutcome::Failed { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(pipeline.stats(account).unwrap().failed_count, 1);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_and_requeues() {
        let (_db, pipeline, account, message_id, remote) = setup();
        remote.fail_mutations_with(RemoteError::PermanentRejection("nope".into()));

        pipeline.mark_read(account, message_id, true).unwrap();
        let _ = pipeline.process_next(account).await.unwrap();
        assert_eq!(pipeline.stats(account).unwrap().failed_count, 1);

        remote.clear_failures();
        let job = pipeline.retry_failed(account).unwrap();
        assert!(job.is_some());
        let reset = pipeline.oldest_open(account).unwrap().unwrap();
        assert_eq!(reset.attempt_count, 0);

        match pipeline.process_next(account).await.unwrap() {
            UploadOutcome::Delivered { more_pending } => assert!(!more_pending),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_reconciles_server_assigned_id() {
        let (db, pipeline, account, _message_id, remote) = setup();
        remote.assign_remote_id("srv-42");

        pipeline
            .send_message(
                account,
                &DraftContent {
                    to: vec!["b@example.com".into()],
                    subject: "hi".into(),
                    body: "hello".into(),
                },
            )
            .unwrap();

        let placeholder = pipeline.oldest_open(account).unwrap().unwrap();
        let entity = placeholder.entity_id.unwrap();
        assert!(db
            .message_remote_id(entity)
            .unwrap()
            .unwrap()
            .starts_with("local-"));

        match pipeline.process_next(account).await.unwrap() {
            UploadOutcome::Delivered { .. } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(db.message_remote_id(entity).unwrap().unwrap(), "srv-42");
    }
}
