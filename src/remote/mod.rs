//! Remote mail provider boundary
//!
//! The engine never talks to a concrete provider SDK. Everything it needs
//! from the network is expressed through the `RemoteMailService` capability
//! trait, with an explicit error taxonomy so the dispatcher can classify
//! failures without knowing anything provider-specific. Authentication and
//! token refresh live behind this boundary; the engine only sees
//! `ReauthRequired`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider failure classes the engine reacts to
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Timeouts, connection resets, 5xx. Retried with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Token expired or revoked. The account is parked until the external
    /// auth collaborator clears it.
    #[error("re-authentication required")]
    ReauthRequired,

    /// 4xx-style rejection. Never retried automatically.
    #[error("request rejected by provider: {0}")]
    PermanentRejection(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Well-known folder roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Archive,
    Standard,
}

impl FolderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Archive => "archive",
            Self::Standard => "standard",
        }
    }
}

/// Folder as reported by the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub remote_id: String,
    pub name: String,
    pub role: FolderRole,
}

/// Attachment metadata carried on a message header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAttachment {
    pub remote_id: String,
    pub filename: String,
    pub size_bytes: u64,
}

/// Message header as reported by the provider.
/// `folder_remote_ids` is the full label set for label-style providers;
/// an empty list means "only the folder this listing was fetched from".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub remote_id: String,
    pub subject: String,
    pub sender: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub folder_remote_ids: Vec<String>,
    pub attachments: Vec<RemoteAttachment>,
}

/// One page of a folder listing
#[derive(Debug, Clone, Default)]
pub struct FolderPage {
    pub folders: Vec<RemoteFolder>,
    pub cursor: Option<String>,
}

/// One page of a message listing. `cursor` continues pagination;
/// `delta_token` resumes change tracking on the next sync.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<RemoteMessage>,
    pub cursor: Option<String>,
    pub delta_token: Option<String>,
}

/// User-initiated write kinds deliverable to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    MarkRead,
    Star,
    Delete,
    Move,
    Send,
    CreateDraft,
    UpdateDraft,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarkRead => "mark_read",
            Self::Star => "star",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Send => "send",
            Self::CreateDraft => "create_draft",
            Self::UpdateDraft => "update_draft",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "mark_read" => Some(Self::MarkRead),
            "star" => Some(Self::Star),
            "delete" => Some(Self::Delete),
            "move" => Some(Self::Move),
            "send" => Some(Self::Send),
            "create_draft" => Some(Self::CreateDraft),
            "update_draft" => Some(Self::UpdateDraft),
            _ => None,
        }
    }
}

/// Result of a delivered mutation. `new_remote_id` is set when the provider
/// assigned an id (send, draft create) that must replace a local placeholder.
#[derive(Debug, Clone, Default)]
pub struct MutationOutcome {
    pub new_remote_id: Option<String>,
}

/// Capability interface to a remote mail provider.
///
/// Implementations own their own timeouts; the engine imposes none.
#[async_trait]
pub trait RemoteMailService: Send + Sync {
    async fn list_folders(&self, account_id: i64, cursor: Option<&str>) -> RemoteResult<FolderPage>;

    /// List headers for a folder. `earliest` bounds backfill: the provider
    /// must not return messages older than it.
    async fn list_messages(
        &self,
        account_id: i64,
        folder_remote_id: &str,
        cursor: Option<&str>,
        earliest: Option<DateTime<Utc>>,
    ) -> RemoteResult<MessagePage>;

    async fn fetch_body(&self, account_id: i64, message_remote_id: &str) -> RemoteResult<String>;

    async fn fetch_attachment(
        &self,
        account_id: i64,
        attachment_remote_id: &str,
    ) -> RemoteResult<Vec<u8>>;

    async fn apply_mutation(
        &self,
        account_id: i64,
        kind: MutationKind,
        entity_remote_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> RemoteResult<MutationOutcome>;

    async fn search(
        &self,
        account_id: i64,
        query: &str,
        folder_remote_id: Option<&str>,
    ) -> RemoteResult<Vec<RemoteMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_kind_roundtrip() {
        for kind in [
            MutationKind::MarkRead,
            MutationKind::Star,
            MutationKind::Delete,
            MutationKind::Move,
            MutationKind::Send,
            MutationKind::CreateDraft,
            MutationKind::UpdateDraft,
        ] {
            assert_eq!(MutationKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(MutationKind::from_str("bogus"), None);
    }
}
