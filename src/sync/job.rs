//! Job model
//!
//! A job is an ephemeral unit of sync work with a cost estimate
//! (`work_score`). Cheap jobs preempt expensive ones; FIFO applies within
//! equal score. `UploadAction` is the only kind backed by durable state
//! (a pending mutation row), so it carries no payload of its own.

use serde::{Deserialize, Serialize};

/// What a job does. Entity ids are local (cache store) ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Refresh the account's folder list
    SyncFolderList,
    /// Drop the folder's delta cursor and fetch from scratch
    ForceRefreshFolder { folder_id: i64 },
    /// Delta fetch of new headers for a folder
    FetchMessageHeaders { folder_id: i64 },
    /// Continuation or backfill page for a folder listing
    FetchNextMessageListPage {
        folder_id: i64,
        cursor: Option<String>,
        backfill: bool,
    },
    /// Download the full body of one message
    FetchFullMessageBody { message_id: i64 },
    /// Download one attachment's bytes
    DownloadAttachment { attachment_id: i64 },
    /// Server-side search, results cached as headers
    SearchOnline { query: String, folder_id: Option<i64> },
    /// Drain the oldest pending mutation for the account
    UploadAction,
    /// Run the cache eviction passes
    EvictFromCache,
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SyncFolderList => "sync_folder_list",
            Self::ForceRefreshFolder { .. } => "force_refresh_folder",
            Self::FetchMessageHeaders { .. } => "fetch_message_headers",
            Self::FetchNextMessageListPage { .. } => "fetch_next_message_list_page",
            Self::FetchFullMessageBody { .. } => "fetch_full_message_body",
            Self::DownloadAttachment { .. } => "download_attachment",
            Self::SearchOnline { .. } => "search_online",
            Self::UploadAction => "upload_action",
            Self::EvictFromCache => "evict_from_cache",
        }
    }

    /// Default cost estimate. Mutation uploads are the cheapest so they
    /// always preempt bulk downloads.
    pub fn default_work_score(&self) -> u32 {
        match self {
            Self::UploadAction => 1,
            Self::EvictFromCache => 2,
            Self::SyncFolderList => 4,
            Self::FetchFullMessageBody { .. } => 6,
            Self::SearchOnline { .. } => 8,
            Self::FetchMessageHeaders { .. } => 10,
            Self::ForceRefreshFolder { .. } => 12,
            Self::FetchNextMessageListPage { .. } => 15,
            Self::DownloadAttachment { .. } => 20,
        }
    }

    /// Kinds that add bytes to the cache; vetoed under cache pressure
    pub fn is_content_growing(&self) -> bool {
        matches!(
            self,
            Self::FetchNextMessageListPage { .. }
                | Self::FetchFullMessageBody { .. }
                | Self::DownloadAttachment { .. }
        )
    }

    pub fn requires_network(&self) -> bool {
        !matches!(self, Self::EvictFromCache)
    }

    /// The entity id relevant for coalescing, if any
    fn identity_entity(&self) -> Option<i64> {
        match self {
            Self::SyncFolderList | Self::UploadAction | Self::EvictFromCache => None,
            Self::ForceRefreshFolder { folder_id }
            | Self::FetchMessageHeaders { folder_id }
            | Self::FetchNextMessageListPage { folder_id, .. } => Some(*folder_id),
            Self::FetchFullMessageBody { message_id } => Some(*message_id),
            Self::DownloadAttachment { attachment_id } => Some(*attachment_id),
            Self::SearchOnline { folder_id, .. } => *folder_id,
        }
    }
}

/// A schedulable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub account_id: i64,
    pub kind: JobKind,
    pub work_score: u32,
}

impl Job {
    pub fn new(account_id: i64, kind: JobKind) -> Self {
        let work_score = kind.default_work_score();
        Self {
            account_id,
            kind,
            work_score,
        }
    }

    /// Coalescing key: two submissions with the same identity occupy one
    /// queue slot, the newer payload superseding the older. Volatile
    /// payload (page cursors) is deliberately excluded so a fresher cursor
    /// replaces a stale one in place. The backfill flag is part of the
    /// identity: a history page carries a time floor that must never
    /// supersede a forward continuation, so the two track separate cursors
    /// in separate slots.
    pub fn identity(&self) -> JobIdentity {
        let query = match &self.kind {
            JobKind::SearchOnline { query, .. } => Some(query.clone()),
            _ => None,
        };
        let backfill = matches!(
            &self.kind,
            JobKind::FetchNextMessageListPage { backfill: true, .. }
        );
        JobIdentity {
            account_id: self.account_id,
            label: self.kind.label(),
            entity: self.kind.identity_entity(),
            query,
            backfill,
        }
    }
}

/// Identity used for idempotent submission
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobIdentity {
    pub account_id: i64,
    pub label: &'static str,
    pub entity: Option<i64>,
    pub query: Option<String>,
    pub backfill: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_action_is_cheapest() {
        let upload = JobKind::UploadAction.default_work_score();
        for kind in [
            JobKind::SyncFolderList,
            JobKind::FetchMessageHeaders { folder_id: 1 },
            JobKind::FetchFullMessageBody { message_id: 1 },
            JobKind::DownloadAttachment { attachment_id: 1 },
        ] {
            assert!(upload < kind.default_work_score(), "{:?}", kind);
        }
    }

    #[test]
    fn test_identity_ignores_cursor() {
        let a = Job::new(
            1,
            JobKind::FetchNextMessageListPage {
                folder_id: 7,
                cursor: Some("page-1".into()),
                backfill: false,
            },
        );
        let b = Job::new(
            1,
            JobKind::FetchNextMessageListPage {
                folder_id: 7,
                cursor: Some("page-2".into()),
                backfill: false,
            },
        );
        assert_eq!(a.identity(), b.identity());

        let other_folder = Job::new(
            1,
            JobKind::FetchNextMessageListPage {
                folder_id: 8,
                cursor: Some("page-1".into()),
                backfill: false,
            },
        );
        assert_ne!(a.identity(), other_folder.identity());
    }

    #[test]
    fn test_backfill_pages_keep_their_own_slot() {
        let forward = Job::new(
            1,
            JobKind::FetchNextMessageListPage {
                folder_id: 7,
                cursor: Some("next".into()),
                backfill: false,
            },
        );
        let history = Job::new(
            1,
            JobKind::FetchNextMessageListPage {
                folder_id: 7,
                cursor: Some("old".into()),
                backfill: true,
            },
        );
        // A history page must never replace a forward continuation in place
        assert_ne!(forward.identity(), history.identity());

        // Within the backfill track the cursor still coalesces
        let history_later = Job::new(
            1,
            JobKind::FetchNextMessageListPage {
                folder_id: 7,
                cursor: Some("older".into()),
                backfill: true,
            },
        );
        assert_eq!(history.identity(), history_later.identity());
    }

    #[test]
    fn test_content_growing_classification() {
        assert!(JobKind::DownloadAttachment { attachment_id: 1 }.is_content_growing());
        assert!(JobKind::FetchFullMessageBody { message_id: 1 }.is_content_growing());
        assert!(JobKind::FetchNextMessageListPage {
            folder_id: 1,
            cursor: None,
            backfill: true
        }
        .is_content_growing());

        // Header polling and mutation upload must keep flowing under pressure
        assert!(!JobKind::FetchMessageHeaders { folder_id: 1 }.is_content_growing());
        assert!(!JobKind::UploadAction.is_content_growing());
    }

    #[test]
    fn test_eviction_needs_no_network() {
        assert!(!JobKind::EvictFromCache.requires_network());
        assert!(JobKind::SyncFolderList.requires_network());
    }
}
