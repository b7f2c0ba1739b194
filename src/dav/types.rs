use thiserror::Error;

/// Mime-type sentinel stored for folder records.
pub const DIR_MIME_TYPE: &str = "DIR";

/// Content type assumed when the server reports none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One entry parsed from a directory-listing (PROPFIND) response.
///
/// Transient: consumed by the reconciler right after parsing, never stored.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Absolute decoded remote path; folders end with `/`.
    pub path: String,
    pub name: String,
    /// Server change token, surrounding quotes already stripped.
    pub etag: Option<String>,
    pub content_type: String,
    pub length: i64,
    /// Epoch seconds; 0 when the server value was missing or unparseable.
    pub creation_timestamp: i64,
    /// Epoch seconds; 0 when the server value was missing or unparseable.
    pub modification_timestamp: i64,
    pub is_directory: bool,
    /// Opaque server-issued id (`oc:fileid`), used for rename detection.
    pub remote_id: Option<String>,
    /// Opaque capability string (`oc:permissions`).
    pub permissions: Option<String>,
    /// Set when size or timestamps had to fall back to sentinel defaults.
    pub partial_data: bool,
}

/// Failure classes for a remote listing fetch.
///
/// The sync runner branches on these: `Transient` is retried with backoff,
/// `NotFound` turns into a local subtree deletion, `Auth` aborts the pass.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("remote folder not found: {0}")]
    NotFound(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Server dialect settled once at session setup; the sync path never
/// inspects version strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavCapability {
    /// `remote.php/dav/files/{user}` layout with oc: property extensions.
    Nextcloud,
    /// Plain RFC 4918 server under a `/webdav` prefix.
    Generic,
}
