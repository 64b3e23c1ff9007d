//! Database module for the mailsync cache store
//!
//! Provides SQLite-backed storage for messages, folders, attachments, the
//! message/folder junction, per-folder sync cursors and the durable
//! pending-mutation queue. Interactive readers share this store with the
//! sync engine; all engine writes happen in short-lived transactions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::remote::{RemoteAttachment, RemoteFolder, RemoteMessage};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

// ============================================================================
// Row types
// ============================================================================

/// Stored account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    pub reauth_required: bool,
    pub folders_cursor: Option<String>,
}

/// Stored folder record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub account_id: i64,
    pub remote_id: String,
    pub name: String,
    pub role: String,
}

/// Message header as cached locally. Body and attachments are stored
/// separately and flagged `cached` when downloaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: i64,
    pub account_id: i64,
    pub remote_id: String,
    pub subject: String,
    pub sender: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub body_cached: bool,
    pub body_size: i64,
    pub synced_at: DateTime<Utc>,
}

/// Attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub id: i64,
    pub message_id: i64,
    pub remote_id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub cached: bool,
}

/// Per (account, folder) sync cursor state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSyncState {
    pub account_id: i64,
    pub folder_id: i64,
    pub delta_token: Option<String>,
    pub next_page_token: Option<String>,
    pub backfill_done: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

fn map_folder(row: &Row) -> rusqlite::Result<Folder> {
    Ok(Folder {
        id: row.get(0)?,
        account_id: row.get(1)?,
        remote_id: row.get(2)?,
        name: row.get(3)?,
        role: row.get(4)?,
    })
}

fn map_message(row: &Row) -> rusqlite::Result<MessageHeader> {
    Ok(MessageHeader {
        id: row.get(0)?,
        account_id: row.get(1)?,
        remote_id: row.get(2)?,
        subject: row.get(3)?,
        sender: row.get(4)?,
        snippet: row.get(5)?,
        received_at: parse_ts(&row.get::<_, String>(6)?)?,
        is_read: row.get(7)?,
        is_starred: row.get(8)?,
        body_cached: row.get(9)?,
        body_size: row.get(10)?,
        synced_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, account_id, remote_id, subject, sender, snippet, \
     received_at, is_read, is_starred, body_cached, body_size, synced_at";

// ============================================================================
// Database
// ============================================================================

/// Database manager for thread-safe SQLite access.
/// Uses an r2d2 connection pool so readers never queue behind the engine.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(10)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        // Performance PRAGMAs
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database pool (for testing).
    /// Pool size 1 so every handle sees the same in-memory database.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run migrations for databases created by older schema versions
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: backfill_done column on folder_sync_state
        let has_backfill_done: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('folder_sync_state') WHERE name = 'backfill_done'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_backfill_done {
            log::info!("Running migration: adding backfill_done to folder_sync_state");
            conn.execute(
                "ALTER TABLE folder_sync_state ADD COLUMN backfill_done INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
        }

        // Migration 2: last_accessed_at column on attachments
        let has_last_accessed: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('attachments') WHERE name = 'last_accessed_at'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_last_accessed {
            log::info!("Running migration: adding last_accessed_at to attachments");
            conn.execute("ALTER TABLE attachments ADD COLUMN last_accessed_at TEXT", [])?;
        }

        Ok(())
    }

    // =========================================================================
    // GENERIC HELPERS
    // =========================================================================

    /// Execute a statement, returning the number of affected rows
    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> DbResult<usize> {
        let conn = self.get_conn()?;
        Ok(conn.execute(sql, params)?)
    }

    /// Execute an INSERT, returning the new row id
    pub fn insert<P: rusqlite::Params>(&self, sql: &str, params: P) -> DbResult<i64> {
        let conn = self.get_conn()?;
        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Execute multiple statements at once
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        Ok(conn.execute_batch(sql)?)
    }

    /// Query rows through a mapper closure
    pub fn query<T, P, F>(&self, sql: &str, params: P, mapper: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, mapper)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Query a single optional row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, mapper: F) -> DbResult<Option<T>>
    where
        P: rusqlite::Params,
        F: FnOnce(&Row) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;
        Ok(conn.query_row(sql, params, mapper).optional()?)
    }

    // =========================================================================
    // ACCOUNTS
    // =========================================================================

    pub fn add_account(&self, email: &str, display_name: &str) -> DbResult<i64> {
        self.insert(
            "INSERT INTO accounts (email, display_name, created_at) VALUES (?1, ?2, ?3)",
            params![email, display_name, Utc::now().to_rfc3339()],
        )
    }

    pub fn get_account(&self, account_id: i64) -> DbResult<Option<Account>> {
        self.query_row(
            "SELECT id, email, display_name, reauth_required, folders_cursor FROM accounts WHERE id = ?1",
            params![account_id],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    display_name: row.get(2)?,
                    reauth_required: row.get(3)?,
                    folders_cursor: row.get(4)?,
                })
            },
        )
    }

    pub fn list_account_ids(&self) -> DbResult<Vec<i64>> {
        self.query("SELECT id FROM accounts ORDER BY id", [], |row| row.get(0))
    }

    pub fn set_reauth_required(&self, account_id: i64, required: bool) -> DbResult<()> {
        self.execute(
            "UPDATE accounts SET reauth_required = ?1 WHERE id = ?2",
            params![required, account_id],
        )?;
        Ok(())
    }

    pub fn folders_cursor(&self, account_id: i64) -> DbResult<Option<String>> {
        Ok(self
            .query_row(
                "SELECT folders_cursor FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get::<_, Option<String>>(0),
            )?
            .flatten())
    }

    pub fn set_folders_cursor(&self, account_id: i64, cursor: Option<&str>) -> DbResult<()> {
        self.execute(
            "UPDATE accounts SET folders_cursor = ?1 WHERE id = ?2",
            params![cursor, account_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // FOLDERS
    // =========================================================================

    pub fn upsert_folder(&self, account_id: i64, folder: &RemoteFolder) -> DbResult<i64> {
        self.execute(
            r#"
            INSERT INTO folders (account_id, remote_id, name, role, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id, remote_id)
            DO UPDATE SET name = excluded.name, role = excluded.role
            "#,
            params![
                account_id,
                folder.remote_id,
                folder.name,
                folder.role.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = self
            .query_row(
                "SELECT id FROM folders WHERE account_id = ?1 AND remote_id = ?2",
                params![account_id, folder.remote_id],
                |row| row.get(0),
            )?
            .ok_or_else(|| DbError::NotFound(format!("folder {}", folder.remote_id)))?;
        Ok(id)
    }

    pub fn folder_by_id(&self, folder_id: i64) -> DbResult<Option<Folder>> {
        self.query_row(
            "SELECT id, account_id, remote_id, name, role FROM folders WHERE id = ?1",
            params![folder_id],
            map_folder,
        )
    }

    pub fn folder_by_remote_id(&self, account_id: i64, remote_id: &str) -> DbResult<Option<Folder>> {
        self.query_row(
            "SELECT id, account_id, remote_id, name, role FROM folders WHERE account_id = ?1 AND remote_id = ?2",
            params![account_id, remote_id],
            map_folder,
        )
    }

    pub fn list_folders(&self, account_id: i64) -> DbResult<Vec<Folder>> {
        self.query(
            "SELECT id, account_id, remote_id, name, role FROM folders WHERE account_id = ?1 ORDER BY id",
            params![account_id],
            map_folder,
        )
    }

    /// The folder polled by default: the one with the inbox role
    pub fn primary_folder(&self, account_id: i64) -> DbResult<Option<Folder>> {
        self.query_row(
            "SELECT id, account_id, remote_id, name, role FROM folders WHERE account_id = ?1 AND role = 'inbox' LIMIT 1",
            params![account_id],
            map_folder,
        )
    }

    pub fn folder_by_role(&self, account_id: i64, role: &str) -> DbResult<Option<Folder>> {
        self.query_row(
            "SELECT id, account_id, remote_id, name, role FROM folders WHERE account_id = ?1 AND role = ?2 LIMIT 1",
            params![account_id, role],
            map_folder,
        )
    }

    // =========================================================================
    // MESSAGES
    // =========================================================================

    /// Insert or refresh a message header from a remote listing.
    /// Local read/star flags are preserved on conflict; the runner applies
    /// remote flags separately when no pending mutation touches the message.
    pub fn upsert_message_header(&self, account_id: i64, msg: &RemoteMessage) -> DbResult<i64> {
        self.execute(
            r#"
            INSERT INTO messages (account_id, remote_id, subject, sender, snippet,
                                  received_at, is_read, is_starred, synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(account_id, remote_id)
            DO UPDATE SET subject = excluded.subject,
                          sender = excluded.sender,
                          snippet = excluded.snippet,
                          received_at = excluded.received_at,
                          synced_at = excluded.synced_at
            "#,
            params![
                account_id,
                msg.remote_id,
                msg.subject,
                msg.sender,
                msg.snippet,
                msg.received_at.to_rfc3339(),
                msg.is_read,
                msg.is_starred,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = self
            .query_row(
                "SELECT id FROM messages WHERE account_id = ?1 AND remote_id = ?2",
                params![account_id, msg.remote_id],
                |row| row.get(0),
            )?
            .ok_or_else(|| DbError::NotFound(format!("message {}", msg.remote_id)))?;
        Ok(id)
    }

    /// Overwrite local flags with the provider's view (resync path)
    pub fn apply_remote_flags(&self, message_id: i64, is_read: bool, is_starred: bool) -> DbResult<()> {
        self.execute(
            "UPDATE messages SET is_read = ?1, is_starred = ?2 WHERE id = ?3",
            params![is_read, is_starred, message_id],
        )?;
        Ok(())
    }

    pub fn message_header(&self, message_id: i64) -> DbResult<Option<MessageHeader>> {
        self.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![message_id],
            map_message,
        )
    }

    pub fn message_remote_id(&self, message_id: i64) -> DbResult<Option<String>> {
        self.query_row(
            "SELECT remote_id FROM messages WHERE id = ?1",
            params![message_id],
            |row| row.get(0),
        )
    }

    /// Replace a local placeholder id with the server-assigned one
    pub fn assign_remote_id(&self, message_id: i64, remote_id: &str) -> DbResult<()> {
        self.execute(
            "UPDATE messages SET remote_id = ?1 WHERE id = ?2",
            params![remote_id, message_id],
        )?;
        Ok(())
    }

    pub fn set_message_read(&self, message_id: i64, read: bool) -> DbResult<()> {
        self.execute(
            "UPDATE messages SET is_read = ?1 WHERE id = ?2",
            params![read, message_id],
        )?;
        Ok(())
    }

    pub fn set_message_starred(&self, message_id: i64, starred: bool) -> DbResult<()> {
        self.execute(
            "UPDATE messages SET is_starred = ?1 WHERE id = ?2",
            params![starred, message_id],
        )?;
        Ok(())
    }

    /// Optimistic local delete. The junction and attachment rows cascade.
    pub fn delete_message_local(&self, message_id: i64) -> DbResult<()> {
        self.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
        Ok(())
    }

    /// Record a reader access so eviction can honor the access grace window
    pub fn touch_message(&self, message_id: i64) -> DbResult<()> {
        self.execute(
            "UPDATE messages SET last_accessed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), message_id],
        )?;
        Ok(())
    }

    pub fn store_message_body(&self, message_id: i64, body: &str) -> DbResult<u64> {
        let size = body.len() as i64;
        self.execute(
            r#"
            UPDATE messages
            SET body = ?1, body_cached = 1, body_size = ?2, last_accessed_at = ?3
            WHERE id = ?4
            "#,
            params![body, size, Utc::now().to_rfc3339(), message_id],
        )?;
        Ok(size as u64)
    }

    pub fn message_body(&self, message_id: i64) -> DbResult<Option<String>> {
        Ok(self
            .query_row(
                "SELECT body FROM messages WHERE id = ?1 AND body_cached = 1",
                params![message_id],
                |row| row.get::<_, Option<String>>(0),
            )?
            .flatten())
    }

    /// Insert a locally authored message (draft or outgoing placeholder).
    /// The remote id is a local placeholder until the provider assigns one.
    pub fn insert_local_message(
        &self,
        account_id: i64,
        folder_id: Option<i64>,
        subject: &str,
        sender: &str,
        body: &str,
    ) -> DbResult<i64> {
        let now = Utc::now().to_rfc3339();
        let placeholder = format!("local-{}", uuid::Uuid::new_v4());
        let snippet: String = body.chars().take(120).collect();
        let id = self.insert(
            r#"
            INSERT INTO messages (account_id, remote_id, subject, sender, snippet,
                                  received_at, is_read, body, body_cached, body_size, synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, 0, 0, ?6)
            "#,
            params![account_id, placeholder, subject, sender, snippet, now, body],
        )?;
        if let Some(folder_id) = folder_id {
            self.execute(
                "INSERT OR IGNORE INTO message_folders (message_id, folder_id) VALUES (?1, ?2)",
                params![id, folder_id],
            )?;
        }
        Ok(id)
    }

    pub fn update_local_draft(&self, message_id: i64, subject: &str, body: &str) -> DbResult<()> {
        let snippet: String = body.chars().take(120).collect();
        self.execute(
            "UPDATE messages SET subject = ?1, body = ?2, snippet = ?3 WHERE id = ?4",
            params![subject, body, snippet, message_id],
        )?;
        Ok(())
    }

    // =========================================================================
    // MESSAGE <-> FOLDER ASSOCIATIONS
    // =========================================================================

    /// Replace the full folder-association set for a message in one
    /// transaction. Resync is the last writer for the association set.
    pub fn replace_folder_associations(&self, message_id: i64, folder_ids: &[i64]) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM message_folders WHERE message_id = ?1",
            params![message_id],
        )?;
        for folder_id in folder_ids {
            tx.execute(
                "INSERT OR IGNORE INTO message_folders (message_id, folder_id) VALUES (?1, ?2)",
                params![message_id, folder_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn add_folder_association(&self, message_id: i64, folder_id: i64) -> DbResult<()> {
        self.execute(
            "INSERT OR IGNORE INTO message_folders (message_id, folder_id) VALUES (?1, ?2)",
            params![message_id, folder_id],
        )?;
        Ok(())
    }

    /// Optimistic local move: swap one association for another
    pub fn reassign_folder(
        &self,
        message_id: i64,
        source_folder_id: i64,
        target_folder_id: i64,
    ) -> DbResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM message_folders WHERE message_id = ?1 AND folder_id = ?2",
            params![message_id, source_folder_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO message_folders (message_id, folder_id) VALUES (?1, ?2)",
            params![message_id, target_folder_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn folder_ids_for_message(&self, message_id: i64) -> DbResult<Vec<i64>> {
        self.query(
            "SELECT folder_id FROM message_folders WHERE message_id = ?1 ORDER BY folder_id",
            params![message_id],
            |row| row.get(0),
        )
    }

    pub fn list_messages_in_folder(&self, folder_id: i64) -> DbResult<Vec<MessageHeader>> {
        self.query(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE id IN (SELECT message_id FROM message_folders WHERE folder_id = ?1) \
                 ORDER BY received_at DESC"
            ),
            params![folder_id],
            map_message,
        )
    }

    // =========================================================================
    // ATTACHMENTS
    // =========================================================================

    pub fn upsert_attachment_meta(&self, message_id: i64, att: &RemoteAttachment) -> DbResult<i64> {
        self.execute(
            r#"
            INSERT INTO attachments (message_id, remote_id, filename, size_bytes)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(message_id, remote_id)
            DO UPDATE SET filename = excluded.filename,
                          size_bytes = CASE WHEN cached = 1 THEN size_bytes ELSE excluded.size_bytes END
            "#,
            params![message_id, att.remote_id, att.filename, att.size_bytes as i64],
        )?;
        let id = self
            .query_row(
                "SELECT id FROM attachments WHERE message_id = ?1 AND remote_id = ?2",
                params![message_id, att.remote_id],
                |row| row.get(0),
            )?
            .ok_or_else(|| DbError::NotFound(format!("attachment {}", att.remote_id)))?;
        Ok(id)
    }

    pub fn attachment_meta(&self, attachment_id: i64) -> DbResult<Option<AttachmentMeta>> {
        self.query_row(
            "SELECT id, message_id, remote_id, filename, size_bytes, cached FROM attachments WHERE id = ?1",
            params![attachment_id],
            |row| {
                Ok(AttachmentMeta {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    remote_id: row.get(2)?,
                    filename: row.get(3)?,
                    size_bytes: row.get(4)?,
                    cached: row.get(5)?,
                })
            },
        )
    }

    pub fn store_attachment_data(&self, attachment_id: i64, data: &[u8]) -> DbResult<u64> {
        self.execute(
            r#"
            UPDATE attachments
            SET data = ?1, cached = 1, size_bytes = ?2, last_accessed_at = ?3
            WHERE id = ?4
            "#,
            params![data, data.len() as i64, Utc::now().to_rfc3339(), attachment_id],
        )?;
        Ok(data.len() as u64)
    }

    // =========================================================================
    // FOLDER SYNC STATE
    // =========================================================================

    pub fn folder_sync_state(
        &self,
        account_id: i64,
        folder_id: i64,
    ) -> DbResult<Option<FolderSyncState>> {
        self.query_row(
            r#"
            SELECT account_id, folder_id, delta_token, next_page_token, backfill_done, last_synced_at
            FROM folder_sync_state
            WHERE account_id = ?1 AND folder_id = ?2
            "#,
            params![account_id, folder_id],
            |row| {
                Ok(FolderSyncState {
                    account_id: row.get(0)?,
                    folder_id: row.get(1)?,
                    delta_token: row.get(2)?,
                    next_page_token: row.get(3)?,
                    backfill_done: row.get(4)?,
                    last_synced_at: row
                        .get::<_, Option<String>>(5)?
                        .as_deref()
                        .map(parse_ts)
                        .transpose()?,
                })
            },
        )
    }

    /// Persist the cursors returned by a successful page fetch
    pub fn save_folder_sync_state(
        &self,
        account_id: i64,
        folder_id: i64,
        delta_token: Option<&str>,
        next_page_token: Option<&str>,
    ) -> DbResult<()> {
        self.execute(
            r#"
            INSERT INTO folder_sync_state (account_id, folder_id, delta_token, next_page_token, last_synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(account_id, folder_id)
            DO UPDATE SET delta_token = COALESCE(excluded.delta_token, delta_token),
                          next_page_token = excluded.next_page_token,
                          last_synced_at = excluded.last_synced_at
            "#,
            params![
                account_id,
                folder_id,
                delta_token,
                next_page_token,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn clear_folder_cursor(&self, account_id: i64, folder_id: i64) -> DbResult<()> {
        self.execute(
            "UPDATE folder_sync_state SET delta_token = NULL, next_page_token = NULL WHERE account_id = ?1 AND folder_id = ?2",
            params![account_id, folder_id],
        )?;
        Ok(())
    }

    pub fn mark_backfill_done(&self, account_id: i64, folder_id: i64) -> DbResult<()> {
        self.execute(
            r#"
            INSERT INTO folder_sync_state (account_id, folder_id, backfill_done, last_synced_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(account_id, folder_id) DO UPDATE SET backfill_done = 1
            "#,
            params![account_id, folder_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // =========================================================================
    // CACHE USAGE
    // =========================================================================

    /// Current cache usage: cached body bytes plus cached attachment bytes
    pub fn compute_cache_usage(&self) -> DbResult<u64> {
        let bodies: i64 = self
            .query_row(
                "SELECT COALESCE(SUM(body_size), 0) FROM messages WHERE body_cached = 1",
                [],
                |row| row.get(0),
            )?
            .unwrap_or(0);
        let attachments: i64 = self
            .query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM attachments WHERE cached = 1",
                [],
                |row| row.get(0),
            )?
            .unwrap_or(0);
        Ok((bodies + attachments).max(0) as u64)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a JSON-encoded setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let raw: Option<String> = self.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| DbError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Store a JSON-encoded setting value
    pub fn set_setting<T: serde::Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let raw = serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.execute(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, raw],
        )?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
