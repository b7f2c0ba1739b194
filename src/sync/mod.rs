pub mod conflict;
pub mod index;
pub mod reconciler;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::dav::types::DIR_MIME_TYPE;
use crate::dav::{DavReader, FetchError};
use crate::util::path as remote_path;

use index::{ChangeBatch, FileIndex, FileRecord, IndexError};

/// What one runner invocation should do.
#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Descend into child folders.
    pub recursive: bool,
    /// Also flag downloaded content for refresh, not just metadata.
    pub sync_data: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            sync_data: false,
        }
    }
}

/// Retry bounds for transient listing failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// A folder whose pass failed; its local records are untouched.
#[derive(Debug, Clone)]
pub struct FolderFailure {
    pub remote_path: String,
    pub error: String,
}

/// Aggregated outcome of one (possibly recursive) runner invocation.
///
/// Partial results from folders processed before a failure are retained;
/// `failed` lists the folders whose records were left exactly as they were.
#[derive(Debug, Default)]
pub struct ReconciliationResult {
    pub created: Vec<FileRecord>,
    pub updated: Vec<FileRecord>,
    pub deleted: Vec<FileRecord>,
    pub conflicted: Vec<FileRecord>,
    pub failed: Vec<FolderFailure>,
    pub folders_synced: usize,
    /// The walk stopped at a folder boundary on request.
    pub cancelled: bool,
}

impl ReconciliationResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Why a single folder pass failed. `Auth` aborts the whole walk; the
/// others fail the folder and let siblings proceed.
enum PassError {
    Auth(String),
    Fetch(String),
    Storage(String),
}

impl PassError {
    fn message(&self) -> &str {
        match self {
            PassError::Auth(m) | PassError::Fetch(m) | PassError::Storage(m) => m,
        }
    }
}

impl From<IndexError> for PassError {
    fn from(e: IndexError) -> Self {
        PassError::Storage(e.to_string())
    }
}

/// Orchestrates reconciliation passes: fetch, diff, commit, with retry and
/// optional recursion. Holds an injected index and reader; callers must
/// serialize overlapping invocations for the same subtree themselves.
pub struct SyncRunner<R: DavReader> {
    reader: R,
    index: FileIndex,
    retry: RetryPolicy,
}

impl<R: DavReader> SyncRunner<R> {
    pub fn new(reader: R, index: FileIndex) -> Self {
        Self {
            reader,
            index,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run one reconciliation request rooted at `folder`.
    ///
    /// Cancellation is honored between folder passes only: a pass that has
    /// started always runs to commit or rollback, never half-way.
    pub async fn run(
        &self,
        folder: &str,
        opts: &SyncOptions,
        cancel: &CancellationToken,
    ) -> ReconciliationResult {
        let start = remote_path::as_folder_path(&remote_path::normalize(folder));
        let mut result = ReconciliationResult::default();
        let mut queue: VecDeque<String> = VecDeque::from([start]);

        while let Some(folder_path) = queue.pop_front() {
            if cancel.is_cancelled() {
                tracing::info!(folder = %folder_path, "sync cancelled before folder pass");
                result.cancelled = true;
                break;
            }

            match self.sync_folder(&folder_path, opts, &mut result).await {
                Ok(child_folders) => {
                    result.folders_synced += 1;
                    if opts.recursive {
                        queue.extend(child_folders);
                    }
                }
                Err(PassError::Auth(msg)) => {
                    tracing::error!(folder = %folder_path, error = %msg, "authentication failed, aborting pass");
                    result.failed.push(FolderFailure {
                        remote_path: folder_path,
                        error: msg,
                    });
                    break;
                }
                Err(e) => {
                    tracing::error!(folder = %folder_path, error = %e.message(), "folder pass failed");
                    result.failed.push(FolderFailure {
                        remote_path: folder_path,
                        error: e.message().to_string(),
                    });
                }
            }
        }

        result
    }

    /// One folder pass: fetch listing, diff against local children, commit
    /// the batch, stamp the sync time. Returns child folder paths for the
    /// recursive walk.
    async fn sync_folder(
        &self,
        folder_path: &str,
        opts: &SyncOptions,
        result: &mut ReconciliationResult,
    ) -> Result<Vec<String>, PassError> {
        let folder = self.ensure_folder_record(folder_path).await?;

        let listing = match self.fetch_with_retry(folder_path).await {
            Ok(entries) => entries,
            Err(FetchError::NotFound(_)) => {
                // The folder is gone remotely: the local subtree follows.
                tracing::info!(folder = %folder_path, "remote folder gone, removing local subtree");
                let removed = self.index.delete_subtree(folder_path).await?;
                result.deleted.extend(removed);
                return Ok(Vec::new());
            }
            Err(FetchError::Auth(msg)) => return Err(PassError::Auth(msg)),
            Err(e) => return Err(PassError::Fetch(e.to_string())),
        };

        let children = self.index.get_children(folder.id).await?;

        // Records matching the listing's remote ids, wherever they live in
        // the tree; the reconciler uses them to recognize renames.
        let mut by_remote_id: HashMap<String, FileRecord> = HashMap::new();
        for entry in &listing {
            if let Some(rid) = &entry.remote_id
                && let Some(rec) = self.index.get_by_remote_id(rid).await?
            {
                by_remote_id.insert(rid.clone(), rec);
            }
        }

        let mut diff = reconciler::reconcile(&folder, &listing, &children, &by_remote_id);

        if opts.sync_data {
            // Accepted server updates of downloaded files invalidate the
            // local content; signal the transfer pipeline.
            for upd in &mut diff.updates {
                let rec = &mut upd.record;
                if rec.is_downloaded()
                    && rec.etag_in_conflict.is_none()
                    && rec.needs_update_thumbnail
                {
                    rec.last_sync_for_data = None;
                }
            }
        }

        if !diff.is_empty() {
            tracing::info!(
                folder = %folder_path,
                creates = diff.creates.len(),
                updates = diff.updates.len(),
                deletes = diff.deletes.len(),
                conflicts = diff.conflicts.len(),
                "committing reconciliation batch"
            );
            self.index.apply_batch(&diff.to_batch()).await?;
        } else {
            tracing::debug!(folder = %folder_path, "folder in sync");
        }

        // Stamped even when nothing changed: "synced, no changes" must be
        // distinguishable from "never synced".
        self.index
            .stamp_folder_synced(folder_path, Utc::now().timestamp())
            .await?;

        let conflict_paths: Vec<&str> = diff
            .conflicts
            .iter()
            .map(|r| r.remote_path.as_str())
            .collect();
        result.created.extend(diff.creates.iter().cloned());
        result.updated.extend(
            diff.updates
                .iter()
                .filter(|u| !conflict_paths.contains(&u.record.remote_path.as_str()))
                .map(|u| u.record.clone()),
        );
        result.deleted.extend(diff.deletes.iter().cloned());
        result.conflicted.extend(diff.conflicts.iter().cloned());

        Ok(listing
            .iter()
            .filter(|e| e.is_directory)
            .map(|e| e.path.clone())
            .collect())
    }

    /// Fetch one listing, retrying transient failures with exponential
    /// backoff plus jitter. Auth and not-found surface immediately.
    async fn fetch_with_retry(&self, folder_path: &str) -> Result<Vec<crate::dav::RemoteEntry>, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.reader.list_folder(folder_path).await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let backoff = self.retry.base_delay * 2u32.pow(attempt) + jitter();
                    tracing::warn!(
                        folder = %folder_path,
                        attempt = attempt + 1,
                        error = %e,
                        "transient listing failure, retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Make sure a folder record (and its ancestor chain) exists, so a
    /// configured sync folder below the root can be synced on first run.
    async fn ensure_folder_record(&self, folder_path: &str) -> Result<FileRecord, IndexError> {
        let mut current = self.index.ensure_root().await?;
        if folder_path == "/" {
            return Ok(current);
        }

        let mut prefix = String::from("/");
        let trimmed = folder_path.trim_matches('/');
        for segment in trimmed.split('/') {
            prefix.push_str(segment);
            prefix.push('/');

            current = match self.index.get_by_path(&prefix).await? {
                Some(rec) => rec,
                None => {
                    let batch = ChangeBatch {
                        creates: vec![placeholder_folder(&prefix, current.id)],
                        ..Default::default()
                    };
                    self.index.apply_batch(&batch).await?;
                    self.index
                        .get_by_path(&prefix)
                        .await?
                        .expect("folder record exists after insert")
                }
            };
        }
        Ok(current)
    }
}

/// A folder record known only by path, before its first listing arrives.
fn placeholder_folder(path: &str, parent_id: i64) -> FileRecord {
    FileRecord {
        id: 0,
        remote_path: path.to_string(),
        parent_id: Some(parent_id),
        remote_id: None,
        etag: None,
        etag_in_conflict: None,
        mime_type: DIR_MIME_TYPE.to_string(),
        length: 0,
        creation_timestamp: 0,
        modification_timestamp: 0,
        modification_timestamp_at_last_sync: 0,
        permissions: None,
        last_sync_for_properties: None,
        last_sync_for_data: None,
        local_storage_path: None,
        needs_update_thumbnail: false,
        is_downloading: false,
        is_uploading: false,
        partial_data: false,
    }
}

fn jitter() -> Duration {
    let ms: u64 = rand::random::<u64>() % 250;
    Duration::from_millis(ms)
}
