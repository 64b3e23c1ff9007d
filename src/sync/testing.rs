//! Scripted in-memory RemoteMailService for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;

use crate::remote::{
    FolderPage, FolderRole, MessagePage, MutationKind, MutationOutcome, RemoteError, RemoteFolder,
    RemoteMailService, RemoteMessage, RemoteResult,
};

/// Records every call and serves scripted responses. Failure injection is
/// per call family; `applied_mutations` exposes the exact delivery order.
#[derive(Default)]
pub struct MockRemote {
    folders: StdMutex<Vec<RemoteFolder>>,
    pages: StdMutex<VecDeque<MessagePage>>,
    bodies: StdMutex<HashMap<String, String>>,
    attachments: StdMutex<HashMap<String, Vec<u8>>>,
    search_results: StdMutex<Vec<RemoteMessage>>,

    applied: StdMutex<Vec<(MutationKind, Option<String>)>>,
    list_calls: StdMutex<Vec<(String, Option<String>)>>,

    mutation_failure: StdMutex<Option<RemoteError>>,
    listing_failure: StdMutex<Option<RemoteError>>,
    assigned_remote_id: StdMutex<Option<String>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<'a, T>(m: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_folders(&self, folders: Vec<RemoteFolder>) {
        *Self::lock(&self.folders) = folders;
    }

    /// Queue the next message-listing response; served in order
    pub fn push_page(&self, page: MessagePage) {
        Self::lock(&self.pages).push_back(page);
    }

    pub fn set_body(&self, remote_id: &str, body: &str) {
        Self::lock(&self.bodies).insert(remote_id.into(), body.into());
    }

    pub fn set_attachment(&self, remote_id: &str, data: Vec<u8>) {
        Self::lock(&self.attachments).insert(remote_id.into(), data);
    }

    pub fn set_search_results(&self, results: Vec<RemoteMessage>) {
        *Self::lock(&self.search_results) = results;
    }

    pub fn fail_mutations_with(&self, err: RemoteError) {
        *Self::lock(&self.mutation_failure) = Some(err);
    }

    pub fn fail_listings_with(&self, err: RemoteError) {
        *Self::lock(&self.listing_failure) = Some(err);
    }

    pub fn clear_failures(&self) {
        *Self::lock(&self.mutation_failure) = None;
        *Self::lock(&self.listing_failure) = None;
    }

    /// Every successful mutation returns this as the server-assigned id
    pub fn assign_remote_id(&self, id: &str) {
        *Self::lock(&self.assigned_remote_id) = Some(id.into());
    }

    pub fn applied_mutations(&self) -> Vec<MutationKind> {
        Self::lock(&self.applied).iter().map(|(k, _)| *k).collect()
    }

    pub fn applied_entities(&self) -> Vec<Option<String>> {
        Self::lock(&self.applied)
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn list_call_count(&self) -> usize {
        Self::lock(&self.list_calls).len()
    }

    pub fn list_calls(&self) -> Vec<(String, Option<String>)> {
        Self::lock(&self.list_calls).clone()
    }
}

/// Convenience constructor for header fixtures
pub fn remote_message(remote_id: &str, received_at: DateTime<Utc>) -> RemoteMessage {
    RemoteMessage {
        remote_id: remote_id.to_string(),
        subject: format!("subject {}", remote_id),
        sender: "someone@example.com".to_string(),
        snippet: "snippet".to_string(),
        received_at,
        is_read: false,
        is_starred: false,
        folder_remote_ids: vec![],
        attachments: vec![],
    }
}

pub fn inbox_folder() -> RemoteFolder {
    RemoteFolder {
        remote_id: "INBOX".into(),
        name: "Inbox".into(),
        role: FolderRole::Inbox,
    }
}

#[async_trait]
impl RemoteMailService for MockRemote {
    async fn list_folders(&self, _account_id: i64, _cursor: Option<&str>) -> RemoteResult<FolderPage> {
        if let Some(err) = Self::lock(&self.listing_failure).clone() {
            return Err(err);
        }
        Ok(FolderPage {
            folders: Self::lock(&self.folders).clone(),
            cursor: None,
        })
    }

    async fn list_messages(
        &self,
        _account_id: i64,
        folder_remote_id: &str,
        cursor: Option<&str>,
        _earliest: Option<DateTime<Utc>>,
    ) -> RemoteResult<MessagePage> {
        if let Some(err) = Self::lock(&self.listing_failure).clone() {
            return Err(err);
        }
        Self::lock(&self.list_calls)
            .push((folder_remote_id.to_string(), cursor.map(str::to_string)));
        Ok(Self::lock(&self.pages).pop_front().unwrap_or_default())
    }

    async fn fetch_body(&self, _account_id: i64, message_remote_id: &str) -> RemoteResult<String> {
        Ok(Self::lock(&self.bodies)
            .get(message_remote_id)
            .cloned()
            .unwrap_or_else(|| format!("body of {}", message_remote_id)))
    }

    async fn fetch_attachment(
        &self,
        _account_id: i64,
        attachment_remote_id: &str,
    ) -> RemoteResult<Vec<u8>> {
        Ok(Self::lock(&self.attachments)
            .get(attachment_remote_id)
            .cloned()
            .unwrap_or_else(|| vec![0u8; 16]))
    }

    async fn apply_mutation(
        &self,
        _account_id: i64,
        kind: MutationKind,
        entity_remote_id: Option<&str>,
        _payload: &serde_json::Value,
    ) -> RemoteResult<MutationOutcome> {
        if let Some(err) = Self::lock(&self.mutation_failure).clone() {
            return Err(err);
        }
        Self::lock(&self.applied)
            .push((kind, entity_remote_id.map(str::to_string)));
        Ok(MutationOutcome {
            new_remote_id: Self::lock(&self.assigned_remote_id).clone(),
        })
    }

    async fn search(
        &self,
        _account_id: i64,
        _query: &str,
        _folder_remote_id: Option<&str>,
    ) -> RemoteResult<Vec<RemoteMessage>> {
        if let Some(err) = Self::lock(&self.listing_failure).clone() {
            return Err(err);
        }
        Ok(Self::lock(&self.search_results).clone())
    }
}
