use crate::dav::types::RemoteEntry;

use super::index::FileRecord;

/// Outcome of the conflict decision for a record whose remote etag changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Server state can be applied safely.
    AcceptServer,
    /// The local copy holds edits; stage the server etag as a conflict and
    /// leave the local state untouched until the user resolves it.
    Conflict,
}

/// Decide whether a changed server etag can overwrite the local record.
///
/// A local copy counts as edited when its mtime moved past the snapshot
/// taken at the last successful sync. The comparison is skew-prone, so
/// the rule errs toward flagging a conflict: a spurious conflict costs a
/// user decision, a missed one loses data.
pub fn resolve(local: &FileRecord, _remote: &RemoteEntry) -> Resolution {
    if !local.is_downloaded() {
        // Metadata-only record: nothing local to diverge.
        return Resolution::AcceptServer;
    }

    if local.modification_timestamp > local.modification_timestamp_at_last_sync {
        return Resolution::Conflict;
    }

    Resolution::AcceptServer
}
