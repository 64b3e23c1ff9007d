//! End-to-end engine tests against the scripted remote

use chrono::Utc;
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::remote::{
    FolderRole, MessagePage, MutationKind, RemoteAttachment, RemoteError, RemoteFolder,
    RemoteMailService,
};
use crate::sync::engine::SyncEngine;
use crate::sync::mutations::DraftContent;
use crate::sync::testing::{inbox_folder, remote_message, MockRemote};

/// Tight timings so backoff and debounce resolve within the test window
fn test_config() -> EngineConfig {
    EngineConfig {
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        veto_cooldown_ms: 10,
        syncing_debounce_ms: 50,
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Fixture {
    db: Arc<Database>,
    remote: Arc<MockRemote>,
    engine: SyncEngine,
    account_id: i64,
    folder_id: i64,
    message_id: i64,
}

fn fixture_with(config: EngineConfig) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Arc::new(Database::in_memory().unwrap());
    let account_id = db.add_account("u@example.com", "U").unwrap();
    let folder_id = db.upsert_folder(account_id, &inbox_folder()).unwrap();
    let message_id = db
        .upsert_message_header(account_id, &remote_message("m1", Utc::now()))
        .unwrap();
    db.replace_folder_associations(message_id, &[folder_id])
        .unwrap();

    let remote = Arc::new(MockRemote::new());
    let remote_dyn: Arc<dyn RemoteMailService> = remote.clone();
    let engine = SyncEngine::new(db.clone(), remote_dyn, config).unwrap();
    Fixture {
        db,
        remote,
        engine,
        account_id,
        folder_id,
        message_id,
    }
}

fn fixture() -> Fixture {
    fixture_with(test_config())
}

// ============================================================================
// Offline writes and the mutation queue
// ============================================================================

#[tokio::test]
async fn test_offline_writes_apply_locally_and_drain_in_order() {
    let f = fixture();
    f.engine.set_online(false);

    f.engine.mark_read(f.account_id, f.message_id, true).unwrap();
    f.engine.set_starred(f.account_id, f.message_id, true).unwrap();
    f.engine.mark_read(f.account_id, f.message_id, false).unwrap();

    // Optimistic local state is immediate
    let header = f.db.message_header(f.message_id).unwrap().unwrap();
    assert!(!header.is_read);
    assert!(header.is_starred);

    // Nothing reaches the provider while offline
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f.remote.applied_mutations().is_empty());
    assert_eq!(f.engine.mutation_stats(f.account_id).unwrap().pending_count, 3);

    // Reconnect: the queue drains in creation order
    f.engine.set_online(true);
    wait_until("all mutations delivered", || {
        f.remote.applied_mutations().len() == 3
    })
    .await;
    assert_eq!(
        f.remote.applied_mutations(),
        vec![MutationKind::MarkRead, MutationKind::Star, MutationKind::MarkRead]
    );
    wait_until("queue emptied", || {
        f.engine.mutation_stats(f.account_id).unwrap().total_count == 0
    })
    .await;
}

#[tokio::test]
async fn test_pending_mutations_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mail.db");

    let account_id;
    {
        let db = Arc::new(Database::new(path.clone()).unwrap());
        account_id = db.add_account("u@example.com", "U").unwrap();
        let message_id = db
            .upsert_message_header(account_id, &remote_message("m1", Utc::now()))
            .unwrap();

        let remote: Arc<dyn RemoteMailService> = Arc::new(MockRemote::new());
        let engine = SyncEngine::new(db, remote, test_config()).unwrap();
        engine.set_online(false);
        engine.mark_read(account_id, message_id, true).unwrap();
        // The process "dies" here with the mutation row persisted
    }

    let db = Arc::new(Database::new(path).unwrap());
    let remote = Arc::new(MockRemote::new());
    let remote_dyn: Arc<dyn RemoteMailService> = remote.clone();
    let _engine = SyncEngine::new(db, remote_dyn, test_config()).unwrap();

    // Recovery rebuilt the upload job from the durable row
    wait_until("recovered mutation delivered", || {
        remote.applied_mutations() == vec![MutationKind::MarkRead]
    })
    .await;
}

// ============================================================================
// Idempotent submission
// ============================================================================

#[tokio::test]
async fn test_duplicate_submissions_occupy_one_slot() {
    let f = fixture();
    // Park the queue so nothing executes while we inspect it
    f.db.set_reauth_required(f.account_id, true).unwrap();

    f.engine.refresh_folder(f.account_id, f.folder_id);
    f.engine.refresh_folder(f.account_id, f.folder_id);
    f.engine.refresh_folder(f.account_id, f.folder_id);

    // One header fetch, score 10, not three
    assert_eq!(f.engine.total_work_score(f.account_id), 10);

    f.engine.open_message(f.account_id, f.message_id).unwrap();
    assert_eq!(f.engine.total_work_score(f.account_id), 16);
}

// ============================================================================
// Cache pressure
// ============================================================================

#[tokio::test]
async fn test_cache_pressure_blocks_downloads_but_not_uploads() {
    let db = Arc::new(Database::in_memory().unwrap());
    let account_id = db.add_account("u@example.com", "U").unwrap();
    let m1 = db
        .upsert_message_header(account_id, &remote_message("m1", Utc::now()))
        .unwrap();
    let m2 = db
        .upsert_message_header(account_id, &remote_message("m2", Utc::now()))
        .unwrap();
    // Fill the cache past the high-water mark before the engine starts
    db.store_message_body(m1, &"x".repeat(950)).unwrap();

    let remote = Arc::new(MockRemote::new());
    let remote_dyn: Arc<dyn RemoteMailService> = remote.clone();
    let config = EngineConfig {
        cache_budget_bytes: 1000,
        ..test_config()
    };
    let engine = SyncEngine::new(db.clone(), remote_dyn, config).unwrap();

    // Content-growing work is vetoed
    assert!(engine.open_message(account_id, m2).unwrap().is_none());

    // Mutation upload keeps flowing regardless
    engine.mark_read(account_id, m1, true).unwrap();
    wait_until("upload delivered under pressure", || {
        remote.applied_mutations().len() == 1
    })
    .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(db.message_body(m2).unwrap().is_none());
}

// ============================================================================
// Send failure surfacing
// ============================================================================

#[tokio::test]
async fn test_rejected_send_is_kept_and_retryable() {
    let f = fixture();
    f.remote
        .fail_mutations_with(RemoteError::PermanentRejection("invalid recipient".into()));

    let draft = DraftContent {
        to: vec!["nobody@".into()],
        subject: "hello".into(),
        body: "hi there".into(),
    };
    f.engine.send_message(f.account_id, &draft).unwrap();

    wait_until("send marked failed", || {
        f.engine.mutation_stats(f.account_id).unwrap().failed_count == 1
    })
    .await;

    // Failure surfaces on the account status, content is not lost
    wait_until("error surfaced", || {
        f.engine
            .account_status(f.account_id)
            .last_error
            .as_deref()
            .map(|e| e.contains("invalid recipient"))
            .unwrap_or(false)
    })
    .await;
    let failed = f.engine.list_failed_mutations(f.account_id).unwrap();
    assert_eq!(failed.len(), 1);
    let entity = failed[0].entity_id.unwrap();
    assert!(f.db.message_header(entity).unwrap().is_some());

    // Explicit retry succeeds once the provider accepts it
    f.remote.clear_failures();
    f.engine.retry_failed_mutations(f.account_id).unwrap();
    wait_until("retried send delivered", || {
        f.remote.applied_mutations() == vec![MutationKind::Send]
    })
    .await;
}

// ============================================================================
// Pagination
// ============================================================================

#[tokio::test]
async fn test_listing_continues_across_pages() {
    let f = fixture();
    f.remote.push_page(MessagePage {
        messages: vec![
            remote_message("p1-a", Utc::now()),
            remote_message("p1-b", Utc::now()),
        ],
        cursor: Some("page-2".into()),
        delta_token: None,
    });
    f.remote.push_page(MessagePage {
        messages: vec![remote_message("p2-a", Utc::now())],
        cursor: None,
        delta_token: Some("delta-1".into()),
    });

    f.engine.refresh_folder(f.account_id, f.folder_id);

    wait_until("both pages fetched", || f.remote.list_call_count() == 2).await;
    let calls = f.remote.list_calls();
    assert_eq!(calls[0].1, None);
    assert_eq!(calls[1].1.as_deref(), Some("page-2"));

    wait_until("all headers cached", || {
        f.db.list_messages_in_folder(f.folder_id).unwrap().len() == 4
    })
    .await;

    // Delta token persisted for the next incremental poll
    let state = f
        .db
        .folder_sync_state(f.account_id, f.folder_id)
        .unwrap()
        .unwrap();
    assert_eq!(state.delta_token.as_deref(), Some("delta-1"));
}

#[tokio::test]
async fn test_transient_listing_failure_retries_until_success() {
    let f = fixture();
    f.remote
        .fail_listings_with(RemoteError::Transient("connection reset".into()));
    f.engine.refresh_folder(f.account_id, f.folder_id);

    // Let a couple of backoff rounds elapse before the provider recovers
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(f
        .db
        .folder_sync_state(f.account_id, f.folder_id)
        .unwrap()
        .is_none());

    f.remote.clear_failures();
    f.remote.push_page(MessagePage {
        messages: vec![remote_message("r1", Utc::now())],
        cursor: None,
        delta_token: Some("delta-9".into()),
    });
    wait_until("retried listing landed", || {
        f.db.folder_sync_state(f.account_id, f.folder_id)
            .unwrap()
            .map(|s| s.delta_token.as_deref() == Some("delta-9"))
            .unwrap_or(false)
    })
    .await;
}

// ============================================================================
// Folder list sync
// ============================================================================

#[tokio::test]
async fn test_folder_list_sync_upserts_folders() {
    let db = Arc::new(Database::in_memory().unwrap());
    let account_id = db.add_account("u@example.com", "U").unwrap();

    let remote = Arc::new(MockRemote::new());
    remote.set_folders(vec![
        inbox_folder(),
        RemoteFolder {
            remote_id: "ARCHIVE".into(),
            name: "Archive".into(),
            role: FolderRole::Archive,
        },
    ]);
    let remote_dyn: Arc<dyn RemoteMailService> = remote.clone();
    let engine = SyncEngine::new(db.clone(), remote_dyn, test_config()).unwrap();

    engine.sync_folder_list(account_id);
    wait_until("folders synced", || {
        db.list_folders(account_id).unwrap().len() == 2
    })
    .await;
    let primary = db.primary_folder(account_id).unwrap().unwrap();
    assert_eq!(primary.remote_id, "INBOX");
}

// ============================================================================
// Body and attachment downloads
// ============================================================================

#[tokio::test]
async fn test_open_message_fetches_missing_body() {
    let f = fixture();
    f.remote.set_body("m1", "the full body");

    // Cache miss schedules the download and returns nothing yet
    assert!(f
        .engine
        .open_message(f.account_id, f.message_id)
        .unwrap()
        .is_none());

    wait_until("body cached", || {
        f.db.message_body(f.message_id).unwrap().is_some()
    })
    .await;
    assert_eq!(
        f.engine
            .open_message(f.account_id, f.message_id)
            .unwrap()
            .as_deref(),
        Some("the full body")
    );
    assert_eq!(f.engine.cache_bytes_used(), "the full body".len() as u64);
}

#[tokio::test]
async fn test_requested_attachment_is_downloaded_and_counted() {
    let f = fixture();
    let attachment_id = f
        .db
        .upsert_attachment_meta(
            f.message_id,
            &RemoteAttachment {
                remote_id: "att-1".into(),
                filename: "report.pdf".into(),
                size_bytes: 64,
            },
        )
        .unwrap();
    f.remote.set_attachment("att-1", vec![7u8; 64]);
    assert_eq!(f.engine.cache_bytes_used(), 0);

    f.engine.request_attachment(f.account_id, attachment_id);
    wait_until("attachment cached", || {
        f.db.attachment_meta(attachment_id).unwrap().unwrap().cached
    })
    .await;
    assert_eq!(f.engine.cache_bytes_used(), 64);
}

// ============================================================================
// Online search
// ============================================================================

#[tokio::test]
async fn test_online_search_caches_hits_without_touching_cursors() {
    let f = fixture();
    f.remote.set_search_results(vec![
        remote_message("hit-1", Utc::now()),
        remote_message("hit-2", Utc::now()),
    ]);

    f.engine.search_online(f.account_id, "invoice", Some(f.folder_id));

    // Hits land as headers next to the fixture message in the scoped folder
    wait_until("search hits cached", || {
        f.db.list_messages_in_folder(f.folder_id).unwrap().len() == 3
    })
    .await;

    // Listing cursors stay untouched; the next poll still starts fresh
    assert!(f
        .db
        .folder_sync_state(f.account_id, f.folder_id)
        .unwrap()
        .is_none());
}

// ============================================================================
// Delete addressing
// ============================================================================

#[tokio::test]
async fn test_delete_addresses_the_remote_entity() {
    let f = fixture();
    f.engine.delete_message(f.account_id, f.message_id).unwrap();

    // Local removal is optimistic
    assert!(f.db.message_header(f.message_id).unwrap().is_none());

    wait_until("delete delivered", || {
        f.remote.applied_mutations() == vec![MutationKind::Delete]
    })
    .await;
    assert_eq!(f.remote.applied_entities(), vec![Some("m1".to_string())]);
}

// ============================================================================
// Re-authentication parking
// ============================================================================

#[tokio::test]
async fn test_reauth_parks_account_until_cleared() {
    let f = fixture();
    f.remote.fail_mutations_with(RemoteError::ReauthRequired);

    f.engine.mark_read(f.account_id, f.message_id, true).unwrap();

    wait_until("account parked", || {
        f.engine.account_status(f.account_id).reauth_required
    })
    .await;
    assert!(f
        .db
        .get_account(f.account_id)
        .unwrap()
        .unwrap()
        .reauth_required);
    assert!(f.remote.applied_mutations().is_empty());

    // Queued work resumes once the collaborator re-authenticates
    f.remote.clear_failures();
    f.engine.clear_reauth(f.account_id).unwrap();
    wait_until("held mutation delivered", || {
        f.remote.applied_mutations() == vec![MutationKind::MarkRead]
    })
    .await;
    assert!(!f.engine.account_status(f.account_id).reauth_required);
}

// ============================================================================
// Status channel
// ============================================================================

#[tokio::test]
async fn test_syncing_flag_debounces_clear() {
    let f = fixture();

    assert!(!f.engine.account_status(f.account_id).is_syncing);
    f.engine.mark_read(f.account_id, f.message_id, true).unwrap();

    // On immediately with queued work
    wait_until("syncing flag set", || {
        f.engine.account_status(f.account_id).is_syncing
    })
    .await;

    // Off only after the score has stayed at zero for the debounce window
    wait_until("work drained", || {
        f.engine.total_work_score(f.account_id) == 0
    })
    .await;
    wait_until("syncing flag cleared", || {
        !f.engine.account_status(f.account_id).is_syncing
    })
    .await;
}

// ============================================================================
// Backfill
// ============================================================================

#[tokio::test]
async fn test_backfill_completes_folder_history() {
    let f = fixture();
    // One page for the initial poll, one for the backfill pass; both end
    // the listing, so backfill marks the folder done
    f.remote.push_page(MessagePage::default());
    f.remote.push_page(MessagePage::default());

    f.engine.start();
    wait_until("backfill finished", || {
        f.db.folder_sync_state(f.account_id, f.folder_id)
            .unwrap()
            .map(|s| s.backfill_done)
            .unwrap_or(false)
    })
    .await;
    f.engine.stop();
}

// ============================================================================
// Eviction
// ============================================================================

#[tokio::test]
async fn test_requested_eviction_brings_usage_under_budget() {
    let db = Arc::new(Database::in_memory().unwrap());
    let account_id = db.add_account("u@example.com", "U").unwrap();
    let old = Utc::now() - chrono::Duration::days(200);
    let m1 = db
        .upsert_message_header(account_id, &remote_message("old-1", old))
        .unwrap();
    db.store_message_body(m1, &"x".repeat(900)).unwrap();
    // Age the stamps past the grace windows
    let stale = (Utc::now() - chrono::Duration::days(10)).to_rfc3339();
    db.execute(
        "UPDATE messages SET synced_at = ?1, last_accessed_at = NULL",
        params![stale],
    )
    .unwrap();

    let remote: Arc<dyn RemoteMailService> = Arc::new(MockRemote::new());
    let config = EngineConfig {
        cache_budget_bytes: 500,
        ..test_config()
    };
    let engine = SyncEngine::new(db.clone(), remote, config).unwrap();
    assert_eq!(engine.cache_bytes_used(), 900);

    engine.request_eviction().unwrap();
    wait_until("cache under budget", || {
        db.compute_cache_usage().unwrap() <= 500
    })
    .await;
    wait_until("usage mirror updated", || engine.cache_bytes_used() <= 500).await;
}
