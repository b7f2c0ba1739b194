pub mod client;
pub mod propfind;
pub mod types;

pub use client::DavClient;
pub use types::{DavCapability, FetchError, RemoteEntry};

/// Seam between the sync runner and the remote store. The production
/// implementation is [`DavClient`]; tests drive the runner with a fake.
pub trait DavReader {
    /// One-level listing of the immediate children of `remote_path`.
    /// The folder's own entry is not included. Order is not significant.
    fn list_folder(
        &self,
        remote_path: &str,
    ) -> impl std::future::Future<Output = Result<Vec<RemoteEntry>, FetchError>> + Send;
}
