//! Conflict detection and resolution for pulled records.

use serde::{Deserialize, Serialize};

use crate::journal::RecordStatus;
use crate::row::Row;
use crate::schema::ID_COLUMN;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Take the remote row, but keep every column changed locally since the
    /// last push. The row stays pending so the local columns get pushed.
    #[default]
    MergeLocalChanges,
    /// Keep the local row as is; it stays pending.
    PreferLocal,
    /// Overwrite with the remote row and drop local pending changes.
    PreferRemote,
}

/// Result of resolving one conflicted row.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Row contents to store.
    pub row: Row,
    /// Whether the row still has changes to push.
    pub keep_pending: bool,
}

/// Conflict detector and resolver. The strategy is chosen per call by the
/// sync configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// A remote update conflicts with a local row that has unpushed edits.
    /// Local tombstones are not conflicts: the deletion wins and is pushed.
    pub fn detect_conflict(&self, local_status: RecordStatus) -> bool {
        matches!(local_status, RecordStatus::Created | RecordStatus::Updated)
    }

    /// Resolve a conflict with `strategy`.
    pub fn resolve(
        &self,
        local: &Row,
        remote: &Row,
        changed_columns: &[String],
        strategy: ConflictStrategy,
    ) -> Resolution {
        match strategy {
            ConflictStrategy::PreferRemote => Resolution {
                row: remote.clone(),
                keep_pending: false,
            },
            ConflictStrategy::PreferLocal => Resolution {
                row: local.clone(),
                keep_pending: true,
            },
            ConflictStrategy::MergeLocalChanges => {
                let mut merged = remote.clone();
                for column in changed_columns {
                    if let Some(value) = local.get(column) {
                        merged.insert(column.clone(), value.clone());
                    }
                }
                if let Some(id) = local.get(ID_COLUMN) {
                    merged.insert(ID_COLUMN.to_string(), id.clone());
                }
                Resolution {
                    row: merged,
                    keep_pending: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_conflict_detection() {
        let resolver = ConflictResolver;
        assert!(resolver.detect_conflict(RecordStatus::Updated));
        assert!(resolver.detect_conflict(RecordStatus::Created));
        assert!(!resolver.detect_conflict(RecordStatus::Synced));
        assert!(!resolver.detect_conflict(RecordStatus::Deleted));
    }

    #[test]
    fn test_merge_keeps_locally_changed_columns() {
        let local = row(json!({ "id": "p1", "name": "Road trip", "is_public": false }));
        let remote = row(json!({ "id": "p1", "name": "Old name", "is_public": true }));

        let resolution = ConflictResolver.resolve(
            &local,
            &remote,
            &["name".to_string()],
            ConflictStrategy::default(),
        );

        assert!(resolution.keep_pending);
        assert_eq!(resolution.row["name"], json!("Road trip"));
        assert_eq!(resolution.row["is_public"], json!(true));
    }

    #[test]
    fn test_prefer_remote_discards_local() {
        let local = row(json!({ "id": "p1", "name": "mine" }));
        let remote = row(json!({ "id": "p1", "name": "theirs" }));

        let resolution = ConflictResolver.resolve(
            &local,
            &remote,
            &["name".to_string()],
            ConflictStrategy::PreferRemote,
        );

        assert!(!resolution.keep_pending);
        assert_eq!(resolution.row["name"], json!("theirs"));
    }

    #[test]
    fn test_prefer_local_keeps_row() {
        let local = row(json!({ "id": "p1", "name": "mine" }));
        let remote = row(json!({ "id": "p1", "name": "theirs" }));

        let resolution = ConflictResolver.resolve(&local, &remote, &[], ConflictStrategy::PreferLocal);

        assert!(resolution.keep_pending);
        assert_eq!(resolution.row, local);
    }
}
