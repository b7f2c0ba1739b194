use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::dav::types::DIR_MIME_TYPE;
use crate::util::path as remote_path;

/// Local persistence failures. A failed batch always rolls back whole.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("storage error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// One file or folder known to the client, a row in `file_records`.
#[derive(Debug, Clone)]
pub struct FileRecord {
    /// Local id, assigned by the database on insert (0 before that).
    pub id: i64,
    /// Unique hierarchical key; folders end with `/`.
    pub remote_path: String,
    /// Local id of the containing folder record. None only for the root.
    pub parent_id: Option<i64>,
    /// Opaque server-issued id, stable across renames.
    pub remote_id: Option<String>,
    /// Server change token from the last accepted state.
    pub etag: Option<String>,
    /// Set when the server moved on while the local copy holds edits;
    /// cleared whenever a server state is accepted.
    pub etag_in_conflict: Option<String>,
    pub mime_type: String,
    pub length: i64,
    pub creation_timestamp: i64,
    /// Server-reported mtime, or for downloaded files the local mtime.
    pub modification_timestamp: i64,
    /// Snapshot of the local mtime at the last successful sync; the
    /// conflict resolver compares against it to detect local edits.
    pub modification_timestamp_at_last_sync: i64,
    pub permissions: Option<String>,
    pub last_sync_for_properties: Option<i64>,
    pub last_sync_for_data: Option<i64>,
    /// None means the file has never been downloaded (metadata-only).
    pub local_storage_path: Option<String>,
    pub needs_update_thumbnail: bool,
    pub is_downloading: bool,
    pub is_uploading: bool,
    /// The last listing carried missing or unparseable fields for this entry.
    pub partial_data: bool,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.mime_type == DIR_MIME_TYPE
    }

    pub fn is_downloaded(&self) -> bool {
        self.local_storage_path.is_some()
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            remote_path: row.get("remote_path"),
            parent_id: row.get("parent_id"),
            remote_id: row.get("remote_id"),
            etag: row.get("etag"),
            etag_in_conflict: row.get("etag_in_conflict"),
            mime_type: row.get("mime_type"),
            length: row.get("length"),
            creation_timestamp: row.get("creation_timestamp"),
            modification_timestamp: row.get("modification_timestamp"),
            modification_timestamp_at_last_sync: row.get("modification_timestamp_at_last_sync"),
            permissions: row.get("permissions"),
            last_sync_for_properties: row.get("last_sync_for_properties"),
            last_sync_for_data: row.get("last_sync_for_data"),
            local_storage_path: row.get("local_storage_path"),
            needs_update_thumbnail: row.get("needs_update_thumbnail"),
            is_downloading: row.get("is_downloading"),
            is_uploading: row.get("is_uploading"),
            partial_data: row.get("partial_data"),
        }
    }
}

/// An update to an existing record. `previous_path` is set when the record
/// moved; folder moves cascade the prefix rename to all descendants inside
/// the same transaction.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub record: FileRecord,
    pub previous_path: Option<String>,
}

/// The full outcome of one reconciliation pass over one folder, committed
/// atomically: a later read sees either none of it or all of it.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub creates: Vec<FileRecord>,
    pub updates: Vec<RecordUpdate>,
    pub deletes: Vec<FileRecord>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Durable index mapping remote paths to [`FileRecord`]s.
///
/// Explicitly constructed around an injected pool; all mutation funnels
/// through [`FileIndex::apply_batch`], the single serialization point.
#[derive(Clone)]
pub struct FileIndex {
    pool: SqlitePool,
}

impl FileIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the root folder record if it does not exist yet, and return it.
    pub async fn ensure_root(&self) -> Result<FileRecord, IndexError> {
        sqlx::query(
            "INSERT OR IGNORE INTO file_records (remote_path, mime_type, length) \
             VALUES ('/', ?, 0)",
        )
        .bind(DIR_MIME_TYPE)
        .execute(&self.pool)
        .await?;

        let root = self
            .get_by_path("/")
            .await?
            .expect("root record exists after ensure_root");
        Ok(root)
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query("SELECT * FROM file_records WHERE remote_path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(FileRecord::from_row))
    }

    /// Rename detection: same remote id seen under a different path.
    pub async fn get_by_remote_id(
        &self,
        remote_id: &str,
    ) -> Result<Option<FileRecord>, IndexError> {
        let row = sqlx::query("SELECT * FROM file_records WHERE remote_id = ? LIMIT 1")
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(FileRecord::from_row))
    }

    pub async fn get_children(&self, parent_id: i64) -> Result<Vec<FileRecord>, IndexError> {
        let rows = sqlx::query("SELECT * FROM file_records WHERE parent_id = ?")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(FileRecord::from_row).collect())
    }

    /// A folder record plus all of its descendants.
    pub async fn get_subtree(&self, folder_path: &str) -> Result<Vec<FileRecord>, IndexError> {
        let prefix = remote_path::as_folder_path(folder_path);
        let rows = sqlx::query(
            "SELECT * FROM file_records \
             WHERE remote_path = ? OR remote_path LIKE ? ESCAPE '\\'",
        )
        .bind(&prefix)
        .bind(format!("{}_%", escape_like(&prefix)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(FileRecord::from_row).collect())
    }

    /// Commit one reconciliation outcome as a single transaction.
    ///
    /// Folder renames rewrite descendant paths; folder deletes remove the
    /// whole subtree. Any failure rolls the entire batch back.
    pub async fn apply_batch(&self, batch: &ChangeBatch) -> Result<(), IndexError> {
        let mut tx = self.pool.begin().await?;

        for rec in &batch.creates {
            sqlx::query(
                "INSERT INTO file_records (
                    remote_path, parent_id, remote_id, etag, etag_in_conflict,
                    mime_type, length, creation_timestamp, modification_timestamp,
                    modification_timestamp_at_last_sync, permissions,
                    last_sync_for_properties, last_sync_for_data, local_storage_path,
                    needs_update_thumbnail, is_downloading, is_uploading, partial_data
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&rec.remote_path)
            .bind(rec.parent_id)
            .bind(&rec.remote_id)
            .bind(&rec.etag)
            .bind(&rec.etag_in_conflict)
            .bind(&rec.mime_type)
            .bind(rec.length)
            .bind(rec.creation_timestamp)
            .bind(rec.modification_timestamp)
            .bind(rec.modification_timestamp_at_last_sync)
            .bind(&rec.permissions)
            .bind(rec.last_sync_for_properties)
            .bind(rec.last_sync_for_data)
            .bind(&rec.local_storage_path)
            .bind(rec.needs_update_thumbnail)
            .bind(rec.is_downloading)
            .bind(rec.is_uploading)
            .bind(rec.partial_data)
            .execute(&mut *tx)
            .await?;
        }

        for upd in &batch.updates {
            let rec = &upd.record;

            // Folder move: rewrite descendant paths before the folder's own
            // row changes, so the old prefix still matches.
            if let Some(prev) = &upd.previous_path
                && prev != &rec.remote_path
                && rec.is_folder()
            {
                sqlx::query(
                    "UPDATE file_records \
                     SET remote_path = ? || substr(remote_path, length(?) + 1) \
                     WHERE remote_path LIKE ? ESCAPE '\\'",
                )
                .bind(&rec.remote_path)
                .bind(prev)
                .bind(format!("{}_%", escape_like(prev)))
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query(
                "UPDATE file_records SET
                    remote_path = ?, parent_id = ?, remote_id = ?, etag = ?,
                    etag_in_conflict = ?, mime_type = ?, length = ?,
                    creation_timestamp = ?, modification_timestamp = ?,
                    modification_timestamp_at_last_sync = ?, permissions = ?,
                    last_sync_for_properties = ?, last_sync_for_data = ?,
                    local_storage_path = ?, needs_update_thumbnail = ?,
                    is_downloading = ?, is_uploading = ?, partial_data = ?
                 WHERE id = ?",
            )
            .bind(&rec.remote_path)
            .bind(rec.parent_id)
            .bind(&rec.remote_id)
            .bind(&rec.etag)
            .bind(&rec.etag_in_conflict)
            .bind(&rec.mime_type)
            .bind(rec.length)
            .bind(rec.creation_timestamp)
            .bind(rec.modification_timestamp)
            .bind(rec.modification_timestamp_at_last_sync)
            .bind(&rec.permissions)
            .bind(rec.last_sync_for_properties)
            .bind(rec.last_sync_for_data)
            .bind(&rec.local_storage_path)
            .bind(rec.needs_update_thumbnail)
            .bind(rec.is_downloading)
            .bind(rec.is_uploading)
            .bind(rec.partial_data)
            .bind(rec.id)
            .execute(&mut *tx)
            .await?;
        }

        for rec in &batch.deletes {
            if rec.is_folder() {
                sqlx::query(
                    "DELETE FROM file_records \
                     WHERE remote_path = ? OR remote_path LIKE ? ESCAPE '\\'",
                )
                .bind(&rec.remote_path)
                .bind(format!("{}_%", escape_like(&rec.remote_path)))
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query("DELETE FROM file_records WHERE id = ?")
                    .bind(rec.id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove a folder record and everything under it. Returns the removed
    /// records so the caller can report them as deletions.
    pub async fn delete_subtree(
        &self,
        folder_path: &str,
    ) -> Result<Vec<FileRecord>, IndexError> {
        let doomed = self.get_subtree(folder_path).await?;
        if doomed.is_empty() {
            return Ok(doomed);
        }

        let prefix = remote_path::as_folder_path(folder_path);
        sqlx::query(
            "DELETE FROM file_records \
             WHERE remote_path = ? OR remote_path LIKE ? ESCAPE '\\'",
        )
        .bind(&prefix)
        .bind(format!("{}_%", escape_like(&prefix)))
        .execute(&self.pool)
        .await?;

        Ok(doomed)
    }

    /// Stamp a folder as property-synced, whether or not anything changed.
    /// Distinguishes "synced, no changes" from "never synced".
    pub async fn stamp_folder_synced(&self, path: &str, at: i64) -> Result<(), IndexError> {
        sqlx::query("UPDATE file_records SET last_sync_for_properties = ? WHERE remote_path = ?")
            .bind(at)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_records(&self) -> Result<(i64, i64), IndexError> {
        let files: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM file_records WHERE mime_type != ?")
                .bind(DIR_MIME_TYPE)
                .fetch_one(&self.pool)
                .await?;
        let folders: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM file_records WHERE mime_type = ?")
                .bind(DIR_MIME_TYPE)
                .fetch_one(&self.pool)
                .await?;
        Ok((files.0, folders.0))
    }

    pub async fn get_conflicts(&self) -> Result<Vec<FileRecord>, IndexError> {
        let rows = sqlx::query(
            "SELECT * FROM file_records WHERE etag_in_conflict IS NOT NULL \
             ORDER BY remote_path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(FileRecord::from_row).collect())
    }
}

/// Escape LIKE wildcards so stored paths containing `%` or `_` cannot
/// widen a prefix match.
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
