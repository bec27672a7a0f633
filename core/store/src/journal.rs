//! Change journal types shared by the store and the sync wire format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use musichub_common::{Error, Result};

use crate::row::Row;

/// Sync status of a single row.
///
/// A row carries exactly one status, so it can never sit in two journal
/// sets at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Row matches the server.
    Synced,
    /// Row was created locally and never pushed.
    Created,
    /// Row was modified locally since the last push.
    Updated,
    /// Row was deleted locally; kept as a tombstone until pushed.
    Deleted,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Synced => "synced",
            RecordStatus::Created => "created",
            RecordStatus::Updated => "updated",
            RecordStatus::Deleted => "deleted",
        }
    }

    /// Parse the stored representation.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "synced" => Ok(RecordStatus::Synced),
            "created" => Ok(RecordStatus::Created),
            "updated" => Ok(RecordStatus::Updated),
            "deleted" => Ok(RecordStatus::Deleted),
            other => Err(Error::Storage(format!("Unknown record status '{}'", other))),
        }
    }

    /// Whether the row has changes the server has not seen.
    pub fn is_pending(self) -> bool {
        !matches!(self, RecordStatus::Synced)
    }
}

/// Changes for one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    #[serde(default)]
    pub created: Vec<Row>,
    #[serde(default)]
    pub updated: Vec<Row>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl TableChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of records touched.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Per-table change sets, as exchanged with the sync endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    tables: BTreeMap<String, TableChanges>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no table carries any change.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableChanges::is_empty)
    }

    pub fn table(&self, name: &str) -> Option<&TableChanges> {
        self.tables.get(name)
    }

    /// Changes for `name`, created empty on first access.
    pub fn table_mut(&mut self, name: &str) -> &mut TableChanges {
        self.tables.entry(name.to_string()).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableChanges)> {
        self.tables.iter().map(|(name, changes)| (name.as_str(), changes))
    }

    /// Created plus updated plus deleted records.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(TableChanges::len).sum()
    }

    /// Created plus updated records.
    pub fn upsert_count(&self) -> usize {
        self.tables
            .values()
            .map(|t| t.created.len() + t.updated.len())
            .sum()
    }
}

/// Version stamp of a journaled row at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JournalStamp {
    pub table: String,
    pub id: String,
    pub version: i64,
    pub status: RecordStatus,
}

/// The pending changes read for one push, plus what is needed to clear
/// exactly those changes afterwards.
#[derive(Debug, Clone, Default)]
pub struct JournalSnapshot {
    pub changes: ChangeSet,
    pub(crate) stamps: Vec<JournalStamp>,
}

impl JournalSnapshot {
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Number of records in the snapshot.
    pub fn record_count(&self) -> usize {
        self.stamps.len()
    }
}

/// Outcome of applying a remote change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    /// Rows that did not exist locally.
    pub inserted: usize,
    /// Synced rows overwritten by the remote version.
    pub replaced: usize,
    /// Rows removed by remote deletions.
    pub deleted: usize,
    /// Locally modified rows merged with the remote version.
    pub merged: usize,
    /// Records ignored (local tombstone, unknown table, missing id).
    pub skipped: usize,
}
