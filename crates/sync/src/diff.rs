//! Reconciliation diffing
//!
//! Pure functions computing what a worker must apply, plus the
//! deterministic ordering contract: within each directory, deletes land
//! before writes and writes before renames.

use std::collections::HashMap;

use vaulthalla_store::model::FsEntry;
use vaulthalla_store::paths;
use vaulthalla_storage::ObjectMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Delete,
    Write,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: String,
}

impl Change {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self { kind, path: path.into() }
    }
}

/// Deterministic apply order: directories in path order; within one
/// directory deletes, then writes, then renames; paths break ties.
pub fn order_changes(mut changes: Vec<Change>) -> Vec<Change> {
    changes.sort_by(|a, b| {
        let dir_a = paths::parent(&a.path).unwrap_or_default();
        let dir_b = paths::parent(&b.path).unwrap_or_default();
        dir_a
            .cmp(&dir_b)
            .then(a.kind.cmp(&b.kind))
            .then(a.path.cmp(&b.path))
    });
    changes
}

/// Three-way split of logical file entries against a remote listing.
#[derive(Debug, Default)]
pub struct RemoteDiff {
    /// Entries with no remote object
    pub local_only: Vec<FsEntry>,
    /// Remote objects with no entry
    pub remote_only: Vec<ObjectMeta>,
    /// Entries whose remote object size disagrees with the expected size
    pub modified: Vec<(FsEntry, ObjectMeta)>,
}

/// Compare file entries against the remote listing. `expected_size`
/// returns the byte size an entry's upstream object should have (payload
/// size, or payload + tag when the upstream copy is encrypted).
pub fn diff_remote<F>(entries: &[FsEntry], remote: &[ObjectMeta], expected_size: F) -> RemoteDiff
where
    F: Fn(&FsEntry) -> u64,
{
    let mut by_key: HashMap<&str, &ObjectMeta> =
        remote.iter().map(|o| (o.key.as_str(), o)).collect();

    let mut diff = RemoteDiff::default();
    for entry in entries {
        let key = entry.path.trim_start_matches('/');
        match by_key.remove(key) {
            None => diff.local_only.push(entry.clone()),
            Some(object) => {
                if object.size != expected_size(entry) {
                    diff.modified.push((entry.clone(), object.clone()));
                }
            }
        }
    }
    let mut remote_only: Vec<_> = by_key.into_values().cloned().collect();
    remote_only.sort_by(|a, b| a.key.cmp(&b.key));
    diff.remote_only = remote_only;
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vaulthalla_store::model::{EntryKind, FileMeta};

    fn file(path: &str, size: u64) -> FsEntry {
        FsEntry {
            id: 1,
            vault_id: 1,
            parent_id: Some(0),
            name: paths::file_name(path).unwrap_or_default().to_string(),
            path: path.to_string(),
            inode: 1,
            mode: 0o640,
            owner_uid: 0,
            group_gid: 0,
            base32_alias: "AAAA".into(),
            kind: EntryKind::File,
            created_by: 1,
            last_modified_by: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            file: Some(FileMeta {
                size_bytes: size,
                mime_type: "application/octet-stream".into(),
                content_hash: String::new(),
                encryption_iv: String::new(),
                encrypted_with_key_version: 1,
                quarantined: false,
            }),
        }
    }

    fn object(key: &str, size: u64) -> ObjectMeta {
        ObjectMeta { key: key.to_string(), size, last_modified: None }
    }

    #[test]
    fn test_order_groups_by_directory_then_kind() {
        let ordered = order_changes(vec![
            Change::new(ChangeKind::Rename, "/a/r"),
            Change::new(ChangeKind::Write, "/b/w"),
            Change::new(ChangeKind::Write, "/a/w2"),
            Change::new(ChangeKind::Delete, "/b/d"),
            Change::new(ChangeKind::Write, "/a/w1"),
            Change::new(ChangeKind::Delete, "/a/d"),
        ]);

        let got: Vec<(&ChangeKind, &str)> =
            ordered.iter().map(|c| (&c.kind, c.path.as_str())).collect();
        assert_eq!(
            got,
            vec![
                (&ChangeKind::Delete, "/a/d"),
                (&ChangeKind::Write, "/a/w1"),
                (&ChangeKind::Write, "/a/w2"),
                (&ChangeKind::Rename, "/a/r"),
                (&ChangeKind::Delete, "/b/d"),
                (&ChangeKind::Write, "/b/w"),
            ]
        );
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let input = vec![
            Change::new(ChangeKind::Write, "/x/b"),
            Change::new(ChangeKind::Write, "/x/a"),
        ];
        let mut reversed = input.clone();
        reversed.reverse();
        assert_eq!(order_changes(input), order_changes(reversed));
    }

    #[test]
    fn test_diff_remote_partitions() {
        let entries = vec![file("/a.txt", 5), file("/b.txt", 5), file("/c.txt", 5)];
        let remote = vec![object("a.txt", 5), object("c.txt", 9), object("d.txt", 2)];

        let diff = diff_remote(&entries, &remote, |e| {
            e.file.as_ref().map(|f| f.size_bytes).unwrap_or(0)
        });

        assert_eq!(diff.local_only.len(), 1);
        assert_eq!(diff.local_only[0].path, "/b.txt");
        assert_eq!(diff.remote_only.len(), 1);
        assert_eq!(diff.remote_only[0].key, "d.txt");
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].0.path, "/c.txt");
    }

    #[test]
    fn test_diff_respects_expected_size_transform() {
        // With an encrypted upstream the remote object carries the GCM tag.
        let entries = vec![file("/a.txt", 5)];
        let remote = vec![object("a.txt", 21)];

        let diff = diff_remote(&entries, &remote, |e| {
            e.file.as_ref().map(|f| f.size_bytes + 16).unwrap_or(0)
        });
        assert!(diff.modified.is_empty());
        assert!(diff.local_only.is_empty());
        assert!(diff.remote_only.is_empty());
    }
}
