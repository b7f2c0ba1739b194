use std::collections::{HashMap, HashSet};

use crate::dav::types::{DIR_MIME_TYPE, RemoteEntry};

use super::conflict::{self, Resolution};
use super::index::{ChangeBatch, FileRecord, RecordUpdate};

/// Changes one reconciliation pass computed for one folder.
///
/// Conflicted records also appear in `updates` (the write that stages the
/// conflict etag); `conflicts` is the per-record report for the caller.
#[derive(Debug, Clone, Default)]
pub struct FolderDiff {
    pub creates: Vec<FileRecord>,
    pub updates: Vec<RecordUpdate>,
    pub deletes: Vec<FileRecord>,
    pub conflicts: Vec<FileRecord>,
}

impl FolderDiff {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Batch to hand to the index; the remote listing is authoritative,
    /// so all three sets commit as one unit.
    pub fn to_batch(&self) -> ChangeBatch {
        ChangeBatch {
            creates: self.creates.clone(),
            updates: self.updates.clone(),
            deletes: self.deletes.clone(),
        }
    }
}

/// Diff one remote folder listing against the folder's local children.
///
/// `by_remote_id` holds index records matching the listing's remote ids
/// (from anywhere in the tree) so moves are recognized as renames instead
/// of delete-plus-create. Pure: the caller applies the returned diff.
pub fn reconcile(
    folder: &FileRecord,
    remote: &[RemoteEntry],
    local_children: &[FileRecord],
    by_remote_id: &HashMap<String, FileRecord>,
) -> FolderDiff {
    let local_by_path: HashMap<&str, &FileRecord> = local_children
        .iter()
        .map(|r| (r.remote_path.as_str(), r))
        .collect();

    // Server contract says child paths are unique. If a listing violates
    // it anyway, the later entry wins; log the anomaly and move on.
    let mut order: Vec<&str> = Vec::with_capacity(remote.len());
    let mut winners: HashMap<&str, &RemoteEntry> = HashMap::with_capacity(remote.len());
    for entry in remote {
        if winners.insert(entry.path.as_str(), entry).is_some() {
            tracing::warn!(path = %entry.path, "duplicate path in remote listing, later entry wins");
        } else {
            order.push(entry.path.as_str());
        }
    }

    let mut diff = FolderDiff::default();
    let mut visited: HashSet<&str> = HashSet::with_capacity(remote.len());

    for path in order {
        let entry = winners[path];
        visited.insert(path);

        match local_by_path.get(path) {
            None => {
                // Rename: the remote id is already known under another path.
                let known_elsewhere = entry
                    .remote_id
                    .as_deref()
                    .and_then(|rid| by_remote_id.get(rid))
                    .filter(|prev| prev.remote_path != entry.path);

                if let Some(prev) = known_elsewhere {
                    // The old path is accounted for by the rename; it must
                    // not fall through to the tombstone scan.
                    visited.insert(prev.remote_path.as_str());
                    let previous_path = prev.remote_path.clone();
                    let mut rec = prev.clone();
                    rec.remote_path = entry.path.clone();
                    rec.parent_id = Some(folder.id);
                    reconcile_existing(&mut rec, entry, &mut diff.conflicts);
                    diff.updates.push(RecordUpdate {
                        record: rec,
                        previous_path: Some(previous_path),
                    });
                } else {
                    diff.creates.push(record_from_entry(entry, folder.id));
                }
            }
            Some(local) => {
                // Fast path: unchanged etag means no write at all.
                if local.etag == entry.etag {
                    continue;
                }
                let mut rec = (*local).clone();
                reconcile_existing(&mut rec, entry, &mut diff.conflicts);
                diff.updates.push(RecordUpdate {
                    record: rec,
                    previous_path: None,
                });
            }
        }
    }

    // Tombstone-by-absence: the listing is authoritative for membership.
    for child in local_children {
        if child.remote_path == "/" {
            // The root record is never deleted by its own reconciliation.
            continue;
        }
        if !visited.contains(child.remote_path.as_str()) {
            diff.deletes.push(child.clone());
        }
    }

    diff
}

/// Apply a changed server etag to an existing record: either accept the
/// server state or stage the etag as a conflict, per the resolver.
fn reconcile_existing(rec: &mut FileRecord, entry: &RemoteEntry, conflicts: &mut Vec<FileRecord>) {
    if rec.etag == entry.etag {
        return;
    }
    match conflict::resolve(rec, entry) {
        Resolution::AcceptServer => apply_server_state(rec, entry),
        Resolution::Conflict => {
            rec.etag_in_conflict = entry.etag.clone();
            conflicts.push(rec.clone());
        }
    }
}

/// Overwrite a record with the server's view. Accepting the server always
/// clears a stale conflict marker; the two states are mutually exclusive.
fn apply_server_state(rec: &mut FileRecord, entry: &RemoteEntry) {
    rec.etag = entry.etag.clone();
    rec.etag_in_conflict = None;
    rec.length = entry.length;
    rec.modification_timestamp = entry.modification_timestamp;
    if entry.creation_timestamp > 0 {
        rec.creation_timestamp = entry.creation_timestamp;
    }
    if entry.remote_id.is_some() {
        rec.remote_id = entry.remote_id.clone();
    }
    rec.permissions = entry.permissions.clone();
    rec.partial_data = entry.partial_data;
    if rec.is_downloaded() {
        // The local copy no longer matches the server content.
        rec.needs_update_thumbnail = true;
    }
}

/// Build a fresh record for a remote entry never seen before.
fn record_from_entry(entry: &RemoteEntry, parent_id: i64) -> FileRecord {
    FileRecord {
        id: 0,
        remote_path: entry.path.clone(),
        parent_id: Some(parent_id),
        remote_id: entry.remote_id.clone(),
        etag: entry.etag.clone(),
        etag_in_conflict: None,
        mime_type: if entry.is_directory {
            DIR_MIME_TYPE.to_string()
        } else {
            entry.content_type.clone()
        },
        length: entry.length.max(0),
        creation_timestamp: entry.creation_timestamp,
        modification_timestamp: entry.modification_timestamp,
        modification_timestamp_at_last_sync: 0,
        permissions: entry.permissions.clone(),
        last_sync_for_properties: None,
        last_sync_for_data: None,
        local_storage_path: None,
        needs_update_thumbnail: false,
        is_downloading: false,
        is_uploading: false,
        partial_data: entry.partial_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::index::tests::{file_record, folder_record};

    fn remote_file(path: &str, etag: &str) -> RemoteEntry {
        RemoteEntry {
            path: path.to_string(),
            name: crate::util::path::name_of(path).to_string(),
            etag: Some(etag.to_string()),
            content_type: "text/plain".into(),
            length: 10,
            creation_timestamp: 1_000,
            modification_timestamp: 2_000,
            is_directory: false,
            remote_id: None,
            permissions: None,
            partial_data: false,
        }
    }

    fn remote_dir(path: &str, etag: &str) -> RemoteEntry {
        RemoteEntry {
            path: path.to_string(),
            name: crate::util::path::name_of(path).to_string(),
            etag: Some(etag.to_string()),
            content_type: DIR_MIME_TYPE.into(),
            length: 0,
            creation_timestamp: 0,
            modification_timestamp: 0,
            is_directory: true,
            remote_id: None,
            permissions: None,
            partial_data: false,
        }
    }

    fn root() -> FileRecord {
        FileRecord {
            id: 1,
            parent_id: None,
            ..folder_record("/", 0)
        }
    }

    #[test]
    fn unchanged_listing_is_a_no_op() {
        let folder = root();
        let remote = vec![remote_file("/a.txt", "e1"), remote_dir("/docs/", "d1")];
        let locals = vec![
            FileRecord {
                id: 2,
                ..file_record("/a.txt", 1, "e1")
            },
            FileRecord {
                id: 3,
                etag: Some("d1".into()),
                ..folder_record("/docs/", 1)
            },
        ];

        let diff = reconcile(&folder, &remote, &locals, &HashMap::new());
        assert!(diff.is_empty(), "expected empty diff, got: {diff:?}");
        assert!(diff.conflicts.is_empty());
    }

    #[test]
    fn new_remote_entry_emits_create() {
        let folder = root();
        let remote = vec![remote_file("/doc.txt", "e1")];

        let diff = reconcile(&folder, &remote, &[], &HashMap::new());
        assert_eq!(diff.creates.len(), 1);
        assert!(diff.updates.is_empty());
        assert!(diff.deletes.is_empty());

        let rec = &diff.creates[0];
        assert_eq!(rec.remote_path, "/doc.txt");
        assert_eq!(rec.etag.as_deref(), Some("e1"));
        assert_eq!(rec.parent_id, Some(1));
        assert!(!rec.is_folder());
    }

    #[test]
    fn empty_listing_tombstones_all_children() {
        let folder = root();
        let locals = vec![
            FileRecord {
                id: 2,
                ..file_record("/a.txt", 1, "e1")
            },
            FileRecord {
                id: 3,
                ..file_record("/b.txt", 1, "e2")
            },
            FileRecord {
                id: 4,
                ..folder_record("/c/", 1)
            },
        ];

        let diff = reconcile(&folder, &[], &locals, &HashMap::new());
        assert_eq!(diff.deletes.len(), 3);
        assert!(diff.creates.is_empty());
        assert!(diff.updates.is_empty());
    }

    #[test]
    fn present_children_are_never_tombstoned() {
        let folder = root();
        let remote = vec![remote_file("/a.txt", "e9")];
        let locals = vec![FileRecord {
            id: 2,
            ..file_record("/a.txt", 1, "e1")
        }];

        let diff = reconcile(&folder, &remote, &locals, &HashMap::new());
        assert!(diff.deletes.is_empty());
        assert_eq!(diff.updates.len(), 1);
    }

    #[test]
    fn metadata_only_record_updates_without_conflict() {
        let folder = root();
        let mut remote = remote_file("/doc.txt", "e2");
        remote.length = 42;
        let locals = vec![FileRecord {
            id: 2,
            local_storage_path: None,
            ..file_record("/doc.txt", 1, "e1")
        }];

        let diff = reconcile(&folder, &[remote], &locals, &HashMap::new());
        assert_eq!(diff.updates.len(), 1);
        assert!(diff.conflicts.is_empty());

        let rec = &diff.updates[0].record;
        assert_eq!(rec.etag.as_deref(), Some("e2"));
        assert_eq!(rec.length, 42);
        assert!(rec.etag_in_conflict.is_none());
    }

    #[test]
    fn local_edit_produces_conflict_not_silent_update() {
        let folder = root();
        let remote = vec![remote_file("/doc.txt", "e2")];
        let locals = vec![FileRecord {
            id: 2,
            local_storage_path: Some("/home/alice/sync/doc.txt".into()),
            modification_timestamp: 9_000,
            modification_timestamp_at_last_sync: 2_000,
            ..file_record("/doc.txt", 1, "e1")
        }];

        let diff = reconcile(&folder, &remote, &locals, &HashMap::new());
        assert_eq!(diff.conflicts.len(), 1);
        assert_eq!(diff.updates.len(), 1);

        // Local copy and its etag stay untouched; the server etag is staged.
        let rec = &diff.updates[0].record;
        assert_eq!(rec.etag.as_deref(), Some("e1"));
        assert_eq!(rec.etag_in_conflict.as_deref(), Some("e2"));
        assert_eq!(rec.modification_timestamp, 9_000);
    }

    #[test]
    fn accepting_server_clears_stale_conflict() {
        let folder = root();
        let remote = vec![remote_file("/doc.txt", "e3")];
        let locals = vec![FileRecord {
            id: 2,
            etag_in_conflict: Some("e2".into()),
            local_storage_path: Some("/home/alice/sync/doc.txt".into()),
            ..file_record("/doc.txt", 1, "e1")
        }];

        let diff = reconcile(&folder, &remote, &locals, &HashMap::new());
        let rec = &diff.updates[0].record;
        assert_eq!(rec.etag.as_deref(), Some("e3"));
        assert!(rec.etag_in_conflict.is_none());
    }

    #[test]
    fn rename_is_one_update_no_create_no_delete() {
        let folder = FileRecord {
            id: 5,
            etag: Some("fe".into()),
            ..folder_record("/a/", 1)
        };
        let mut entry = remote_file("/a/new.txt", "e1");
        entry.remote_id = Some("X".into());

        let moved = FileRecord {
            id: 7,
            remote_id: Some("X".into()),
            ..file_record("/a/old.txt", 5, "e1")
        };
        let by_remote_id = HashMap::from([("X".to_string(), moved.clone())]);

        let diff = reconcile(&folder, &[entry], &[moved], &by_remote_id);
        assert_eq!(diff.updates.len(), 1);
        assert!(diff.creates.is_empty());
        assert!(diff.deletes.is_empty());

        let upd = &diff.updates[0];
        assert_eq!(upd.record.remote_path, "/a/new.txt");
        assert_eq!(upd.previous_path.as_deref(), Some("/a/old.txt"));
        // Same id: the record moved, it was not recreated.
        assert_eq!(upd.record.id, 7);
    }

    #[test]
    fn folder_rename_carries_previous_path_for_cascade() {
        let folder = root();
        let mut entry = remote_dir("/new-name/", "d2");
        entry.remote_id = Some("F1".into());

        let old = FileRecord {
            id: 3,
            remote_id: Some("F1".into()),
            etag: Some("d1".into()),
            ..folder_record("/old-name/", 1)
        };
        let by_remote_id = HashMap::from([("F1".to_string(), old.clone())]);

        let diff = reconcile(&folder, &[entry], &[old], &by_remote_id);
        assert_eq!(diff.updates.len(), 1);
        let upd = &diff.updates[0];
        assert!(upd.record.is_folder());
        assert_eq!(upd.previous_path.as_deref(), Some("/old-name/"));
        assert_eq!(upd.record.etag.as_deref(), Some("d2"));
    }

    #[test]
    fn rename_with_local_edit_still_conflicts() {
        let folder = root();
        let mut entry = remote_file("/renamed.txt", "e2");
        entry.remote_id = Some("X".into());

        let moved = FileRecord {
            id: 7,
            remote_id: Some("X".into()),
            local_storage_path: Some("/home/alice/sync/orig.txt".into()),
            modification_timestamp: 9_000,
            modification_timestamp_at_last_sync: 2_000,
            ..file_record("/orig.txt", 1, "e1")
        };
        let by_remote_id = HashMap::from([("X".to_string(), moved.clone())]);

        let diff = reconcile(&folder, &[entry], &[moved], &by_remote_id);
        assert_eq!(diff.conflicts.len(), 1);
        let upd = &diff.updates[0];
        assert_eq!(upd.record.remote_path, "/renamed.txt");
        assert_eq!(upd.record.etag.as_deref(), Some("e1"));
        assert_eq!(upd.record.etag_in_conflict.as_deref(), Some("e2"));
    }

    #[test]
    fn reconcile_is_idempotent() {
        let folder = root();
        let remote = vec![remote_file("/a.txt", "e1"), remote_dir("/d/", "d1")];

        let first = reconcile(&folder, &remote, &[], &HashMap::new());
        assert_eq!(first.creates.len(), 2);

        // Simulate the commit: creates become the local children.
        let locals: Vec<FileRecord> = first
            .creates
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, mut r)| {
                r.id = 10 + i as i64;
                r
            })
            .collect();

        let second = reconcile(&folder, &remote, &locals, &HashMap::new());
        assert!(second.is_empty(), "second pass should be a no-op: {second:?}");
    }

    #[test]
    fn duplicate_paths_later_entry_wins() {
        let folder = root();
        let remote = vec![remote_file("/dup.txt", "e1"), remote_file("/dup.txt", "e2")];

        let diff = reconcile(&folder, &remote, &[], &HashMap::new());
        assert_eq!(diff.creates.len(), 1);
        assert_eq!(diff.creates[0].etag.as_deref(), Some("e2"));
    }

    #[test]
    fn partial_entry_recorded_with_sentinels() {
        let folder = root();
        let mut entry = remote_file("/odd.bin", "e1");
        entry.length = 0;
        entry.modification_timestamp = 0;
        entry.partial_data = true;

        let diff = reconcile(&folder, &[entry], &[], &HashMap::new());
        assert_eq!(diff.creates.len(), 1);
        let rec = &diff.creates[0];
        assert_eq!(rec.length, 0);
        assert_eq!(rec.modification_timestamp, 0);
        assert!(rec.partial_data);
    }
}
