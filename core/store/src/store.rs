//! SQLite-backed local record store.
//!
//! Every table carries three bookkeeping columns next to the user columns:
//! `_status` (synced / created / updated / deleted), `_changed` (columns
//! edited since the last push) and `_version` (bumped on every local write).
//! Together they form the change journal the sync engine pushes.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use musichub_common::{Error, Result};

use crate::conflict::{ConflictResolver, ConflictStrategy};
use crate::entities::{app_migrations, app_schema, Entity};
use crate::journal::{ApplyStats, ChangeSet, JournalSnapshot, JournalStamp, RecordStatus};
use crate::migrations::{migrate, sql_error, Migration};
use crate::row::{accepts, from_sql, row_id, to_sql, Row};
use crate::schema::{
    quote, AppSchema, Association, TableSchema, CHANGED_COLUMN, ID_COLUMN, STATUS_COLUMN,
    VERSION_COLUMN,
};

/// A row as stored, with its bookkeeping columns.
struct StoredRow {
    row: Row,
    status: RecordStatus,
    changed: Vec<String>,
    version: i64,
}

/// Local record store.
pub struct LocalStore {
    conn: Mutex<Connection>,
    schema: AppSchema,
    resolver: ConflictResolver,
    /// Rows handed out by the latest `pending_changes` call and not yet
    /// acknowledged. Deleting one of these that is still `created` must
    /// leave a tombstone, since the server may already have it.
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl LocalStore {
    /// Create or open a store database and migrate it to `schema`.
    ///
    /// # Errors
    /// - Invalid schema
    /// - Database open or migration failure
    pub fn open(
        db_path: impl AsRef<Path>,
        schema: AppSchema,
        migrations: &[Migration],
    ) -> Result<Self> {
        schema.validate()?;
        let mut conn = Connection::open(db_path.as_ref()).map_err(sql_error)?;
        migrate(&mut conn, &schema, migrations)?;

        info!(
            "Local store opened at {} (schema v{})",
            db_path.as_ref().display(),
            schema.version
        );
        Ok(Self {
            conn: Mutex::new(conn),
            schema,
            resolver: ConflictResolver::default(),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Open with the MusicHub schema and migrations.
    pub fn open_app(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open(db_path, app_schema(), &app_migrations())
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(schema: AppSchema) -> Result<Self> {
        Self::open(":memory:", schema, &[])
    }

    pub fn schema(&self) -> &AppSchema {
        &self.schema
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Local store lock poisoned".to_string()))
    }

    fn in_flight(&self) -> Result<MutexGuard<'_, HashSet<(String, String)>>> {
        self.in_flight
            .lock()
            .map_err(|_| Error::Storage("Local store lock poisoned".to_string()))
    }

    /// Insert a new local record.
    ///
    /// # Preconditions
    /// - `table` is part of the schema
    ///
    /// # Postconditions
    /// - The row is journaled as created
    /// - Returns the row id (generated when `row` has none)
    ///
    /// # Errors
    /// - Unknown table or column, or a value of the wrong type
    /// - A row with the same id exists
    pub fn create(&self, table: &str, row: Row) -> Result<String> {
        let table = self.schema.require(table)?;
        check_columns(table, &row)?;

        let id = match row.get(ID_COLUMN) {
            None | Some(Value::Null) => Uuid::new_v4().simple().to_string(),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => {
                return Err(Error::InvalidInput(
                    "Record id must be a non-empty string".to_string(),
                ))
            }
        };

        let conn = self.lock()?;
        if fetch(&conn, table, &id)?.is_some() {
            return Err(Error::AlreadyExists(format!("{}/{}", table.name, id)));
        }
        write_row(&conn, table, &id, &row, RecordStatus::Created, &[], 1)?;

        debug!("Created {}/{}", table.name, id);
        Ok(id)
    }

    /// Apply a partial update to a local record.
    ///
    /// # Postconditions
    /// - Patched columns are recorded as changed
    /// - A synced row becomes updated; a created row stays created
    ///
    /// # Errors
    /// - Unknown table or column, a value of the wrong type, or an attempt to
    ///   change `id`
    /// - Record missing or deleted
    pub fn update(&self, table: &str, id: &str, patch: Row) -> Result<()> {
        let table = self.schema.require(table)?;
        check_columns(table, &patch)?;
        if let Some(new_id) = patch.get(ID_COLUMN) {
            if new_id.as_str() != Some(id) {
                return Err(Error::InvalidInput("Record id cannot change".to_string()));
            }
        }

        let conn = self.lock()?;
        let stored = live(fetch(&conn, table, id)?)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table.name, id)))?;

        let mut row = stored.row;
        let mut changed = stored.changed;
        for (column, value) in patch {
            if column == ID_COLUMN {
                continue;
            }
            if !changed.contains(&column) {
                changed.push(column.clone());
            }
            row.insert(column, value);
        }

        let status = match stored.status {
            RecordStatus::Created => RecordStatus::Created,
            _ => RecordStatus::Updated,
        };
        write_row(&conn, table, id, &row, status, &changed, stored.version + 1)?;

        debug!("Updated {}/{} ({:?})", table.name, id, changed);
        Ok(())
    }

    /// Delete a local record.
    ///
    /// A record that was never pushed disappears immediately; anything the
    /// server knows about is kept as a tombstone until the deletion is pushed.
    pub fn delete(&self, table: &str, id: &str) -> Result<()> {
        let table = self.schema.require(table)?;
        let conn = self.lock()?;
        let stored = live(fetch(&conn, table, id)?)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table.name, id)))?;

        let unpushed = stored.status == RecordStatus::Created
            && !self
                .in_flight()?
                .contains(&(table.name.clone(), id.to_string()));

        if unpushed {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", quote(&table.name)),
                [id],
            )
            .map_err(sql_error)?;
        } else {
            conn.execute(
                &format!(
                    "UPDATE {} SET {} = ?2, {} = {} + 1 WHERE id = ?1",
                    quote(&table.name),
                    quote(STATUS_COLUMN),
                    quote(VERSION_COLUMN),
                    quote(VERSION_COLUMN)
                ),
                params![id, RecordStatus::Deleted.as_str()],
            )
            .map_err(sql_error)?;
        }

        debug!("Deleted {}/{} (tombstone: {})", table.name, id, !unpushed);
        Ok(())
    }

    /// Find a live record by id.
    pub fn find(&self, table: &str, id: &str) -> Result<Option<Row>> {
        let table = self.schema.require(table)?;
        let conn = self.lock()?;
        Ok(live(fetch(&conn, table, id)?).map(|s| s.row))
    }

    /// Journal status of a record, including tombstones.
    pub fn status(&self, table: &str, id: &str) -> Result<Option<RecordStatus>> {
        let table = self.schema.require(table)?;
        let conn = self.lock()?;
        Ok(fetch(&conn, table, id)?.map(|s| s.status))
    }

    /// All live records of a table, ordered by id.
    pub fn all(&self, table: &str) -> Result<Vec<Row>> {
        let table = self.schema.require(table)?;
        let conn = self.lock()?;
        select(
            &conn,
            table,
            &format!("{} != 'deleted' ORDER BY id", quote(STATUS_COLUMN)),
            Vec::new(),
        )
        .map(|rows| rows.into_iter().map(|s| s.row).collect())
    }

    /// Live records whose `column` equals `value`.
    ///
    /// # Errors
    /// - Unknown table or column
    pub fn query(&self, table: &str, column: &str, value: &Value) -> Result<Vec<Row>> {
        let table = self.schema.require(table)?;
        if column != ID_COLUMN && table.column_named(column).is_none() {
            return Err(Error::InvalidInput(format!(
                "Unknown column '{}' in table '{}'",
                column, table.name
            )));
        }

        let (predicate, args) = match query_value(value) {
            Some(v) => (format!("{} = ?1", quote(column)), vec![v]),
            None => (format!("{} IS NULL", quote(column)), Vec::new()),
        };

        let conn = self.lock()?;
        select(
            &conn,
            table,
            &format!(
                "{} AND {} != 'deleted' ORDER BY id",
                predicate,
                quote(STATUS_COLUMN)
            ),
            args,
        )
        .map(|rows| rows.into_iter().map(|s| s.row).collect())
    }

    /// Records of `other` associated with `table/id`, resolved through the
    /// table descriptor.
    ///
    /// # Errors
    /// - No association between the two tables
    pub fn related(&self, table: &str, id: &str, other: &str) -> Result<Vec<Row>> {
        let association = self
            .schema
            .require(table)?
            .association_to(other)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidInput(format!("'{}' has no association to '{}'", table, other))
            })?;

        match association {
            Association::BelongsTo { key, .. } => {
                let parent_id = self
                    .find(table, id)?
                    .and_then(|row| row.get(&key).and_then(Value::as_str).map(str::to_string));
                match parent_id {
                    Some(parent_id) => Ok(self.find(other, &parent_id)?.into_iter().collect()),
                    None => Ok(Vec::new()),
                }
            }
            Association::HasMany { foreign_key, .. } => {
                self.query(other, &foreign_key, &Value::String(id.to_string()))
            }
        }
    }

    /// Insert a typed record.
    pub fn insert<E: Entity>(&self, entity: &E) -> Result<String> {
        self.create(E::TABLE, entity_row(entity)?)
    }

    /// Fetch a typed record.
    pub fn get<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        self.find(E::TABLE, id)?
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Error::from))
            .transpose()
    }

    /// Save all columns of a typed record as a local update.
    pub fn save<E: Entity>(&self, entity: &E) -> Result<()> {
        self.update(E::TABLE, entity.id(), entity_row(entity)?)
    }

    /// All live records of a type.
    pub fn list<E: Entity>(&self) -> Result<Vec<E>> {
        self.all(E::TABLE)?
            .into_iter()
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Error::from))
            .collect()
    }

    /// Whether any table has unpushed changes.
    pub fn has_pending_changes(&self) -> Result<bool> {
        let conn = self.lock()?;
        for table in self.schema.tables() {
            let pending: bool = conn
                .query_row(
                    &format!(
                        "SELECT EXISTS(SELECT 1 FROM {} WHERE {} != 'synced')",
                        quote(&table.name),
                        quote(STATUS_COLUMN)
                    ),
                    [],
                    |row| row.get(0),
                )
                .map_err(sql_error)?;
            if pending {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Snapshot every unpushed change.
    ///
    /// Changes made after the snapshot stay pending after
    /// [`mark_synced`](Self::mark_synced) and go out with the next push.
    pub fn pending_changes(&self) -> Result<JournalSnapshot> {
        let conn = self.lock()?;
        let mut snapshot = JournalSnapshot::default();

        for table in self.schema.tables() {
            let rows = select(
                &conn,
                table,
                &format!("{} != 'synced' ORDER BY id", quote(STATUS_COLUMN)),
                Vec::new(),
            )?;
            for stored in rows {
                let id = row_id(&stored.row).unwrap_or_default().to_string();
                snapshot.stamps.push(JournalStamp {
                    table: table.name.clone(),
                    id: id.clone(),
                    version: stored.version,
                    status: stored.status,
                });
                let changes = snapshot.changes.table_mut(&table.name);
                match stored.status {
                    RecordStatus::Created => changes.created.push(stored.row),
                    RecordStatus::Updated => changes.updated.push(stored.row),
                    RecordStatus::Deleted => changes.deleted.push(id),
                    RecordStatus::Synced => {}
                }
            }
        }

        *self.in_flight()? = snapshot
            .stamps
            .iter()
            .map(|s| (s.table.clone(), s.id.clone()))
            .collect();

        Ok(snapshot)
    }

    /// Clear the journal entries of a pushed snapshot.
    ///
    /// Rows written after the snapshot was taken keep their pending state.
    pub fn mark_synced(&self, snapshot: &JournalSnapshot) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_error)?;

        for stamp in &snapshot.stamps {
            let table = quote(&stamp.table);
            match stamp.status {
                RecordStatus::Deleted => {
                    tx.execute(
                        &format!(
                            "DELETE FROM {} WHERE id = ?1 AND {} = 'deleted'",
                            table,
                            quote(STATUS_COLUMN)
                        ),
                        [&stamp.id],
                    )
                    .map_err(sql_error)?;
                }
                RecordStatus::Created | RecordStatus::Updated => {
                    tx.execute(
                        &format!(
                            "UPDATE {t} SET {s} = 'synced', {c} = '' \
                             WHERE id = ?1 AND {v} = ?2 AND {s} != 'deleted'",
                            t = table,
                            s = quote(STATUS_COLUMN),
                            c = quote(CHANGED_COLUMN),
                            v = quote(VERSION_COLUMN)
                        ),
                        params![stamp.id, stamp.version],
                    )
                    .map_err(sql_error)?;
                    // The server has the row now; later edits are updates.
                    tx.execute(
                        &format!(
                            "UPDATE {t} SET {s} = 'updated' WHERE id = ?1 AND {s} = 'created'",
                            t = table,
                            s = quote(STATUS_COLUMN)
                        ),
                        [&stamp.id],
                    )
                    .map_err(sql_error)?;
                }
                RecordStatus::Synced => {}
            }
        }

        tx.commit().map_err(sql_error)?;
        self.in_flight()?.clear();

        debug!("Marked {} records as synced", snapshot.record_count());
        Ok(())
    }

    /// Apply pulled changes in one transaction.
    ///
    /// # Postconditions
    /// - Either every record is applied or none is
    /// - Remote deletions remove rows regardless of local state
    /// - Local tombstones ignore remote updates
    /// - Locally modified rows are resolved with `strategy`
    /// - Records holding a value of the wrong type for a known column are
    ///   skipped; columns the schema does not know are ignored
    pub fn apply_remote_changes(
        &self,
        changes: &ChangeSet,
        strategy: ConflictStrategy,
    ) -> Result<ApplyStats> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_error)?;
        let mut stats = ApplyStats::default();

        for (name, table_changes) in changes.iter() {
            let Some(table) = self.schema.get(name) else {
                warn!("Skipping changes for unknown table '{}'", name);
                stats.skipped += table_changes.len();
                continue;
            };

            for id in &table_changes.deleted {
                stats.deleted += tx
                    .execute(&format!("DELETE FROM {} WHERE id = ?1", quote(name)), [id])
                    .map_err(sql_error)?;
            }

            for remote in table_changes.created.iter().chain(&table_changes.updated) {
                let Some(id) = row_id(remote).filter(|id| !id.is_empty()) else {
                    warn!("Skipping remote '{}' record without id", name);
                    stats.skipped += 1;
                    continue;
                };
                if let Err(e) = check_types(table, remote) {
                    warn!("Skipping remote {}/{}: {}", name, id, e);
                    stats.skipped += 1;
                    continue;
                }

                match fetch(&tx, table, id)? {
                    None => {
                        write_row(&tx, table, id, remote, RecordStatus::Synced, &[], 0)?;
                        stats.inserted += 1;
                    }
                    Some(local) if local.status == RecordStatus::Deleted => {
                        stats.skipped += 1;
                    }
                    Some(local) if self.resolver.detect_conflict(local.status) => {
                        let resolution =
                            self.resolver
                                .resolve(&local.row, remote, &local.changed, strategy);
                        if resolution.keep_pending {
                            let status = if resolution.row == local.row {
                                local.status
                            } else {
                                RecordStatus::Updated
                            };
                            write_row(
                                &tx,
                                table,
                                id,
                                &resolution.row,
                                status,
                                &local.changed,
                                local.version,
                            )?;
                        } else {
                            write_row(
                                &tx,
                                table,
                                id,
                                &resolution.row,
                                RecordStatus::Synced,
                                &[],
                                local.version + 1,
                            )?;
                        }
                        debug!("Resolved conflict on {}/{} with {:?}", name, id, strategy);
                        stats.merged += 1;
                    }
                    Some(local) => {
                        write_row(&tx, table, id, remote, RecordStatus::Synced, &[], local.version)?;
                        stats.replaced += 1;
                    }
                }
            }
        }

        tx.commit().map_err(sql_error)?;

        info!(
            "Applied remote changes: {} inserted, {} replaced, {} deleted, {} merged, {} skipped",
            stats.inserted, stats.replaced, stats.deleted, stats.merged, stats.skipped
        );
        Ok(stats)
    }
}

fn entity_row<E: Entity>(entity: &E) -> Result<Row> {
    match serde_json::to_value(entity)? {
        Value::Object(row) => Ok(row),
        _ => Err(Error::Serialization(format!(
            "{} record did not serialize to an object",
            E::TABLE
        ))),
    }
}

fn live(stored: Option<StoredRow>) -> Option<StoredRow> {
    stored.filter(|s| s.status != RecordStatus::Deleted)
}

/// Every column must exist and hold a value of its type.
fn check_columns(table: &TableSchema, row: &Row) -> Result<()> {
    for column in row.keys() {
        if column != ID_COLUMN && table.column_named(column).is_none() {
            return Err(Error::InvalidInput(format!(
                "Unknown column '{}' in table '{}'",
                column, table.name
            )));
        }
    }
    check_types(table, row)
}

/// Values of known columns must have the column's type.
fn check_types(table: &TableSchema, row: &Row) -> Result<()> {
    for (name, value) in row {
        let Some(column) = table.column_named(name) else {
            continue;
        };
        if !accepts(column, value) {
            return Err(Error::InvalidInput(format!(
                "Column '{}.{}' expects {:?}, got {}",
                table.name, column.name, column.kind, value
            )));
        }
    }
    Ok(())
}

fn query_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real)),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

fn select_list(table: &TableSchema) -> String {
    let mut columns = vec![
        quote(ID_COLUMN),
        quote(STATUS_COLUMN),
        quote(CHANGED_COLUMN),
        quote(VERSION_COLUMN),
    ];
    columns.extend(table.columns.iter().map(|c| quote(&c.name)));
    columns.join(", ")
}

fn select(
    conn: &Connection,
    table: &TableSchema,
    predicate: &str,
    args: Vec<SqlValue>,
) -> Result<Vec<StoredRow>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        select_list(table),
        quote(&table.name),
        predicate
    );
    let mut stmt = conn.prepare(&sql).map_err(sql_error)?;
    let raw = stmt
        .query_map(params_from_iter(args), |r| {
            let id: String = r.get(0)?;
            let status: String = r.get(1)?;
            let changed: String = r.get(2)?;
            let version: i64 = r.get(3)?;

            let mut row = Row::new();
            row.insert(ID_COLUMN.to_string(), Value::String(id));
            for (i, column) in table.columns.iter().enumerate() {
                row.insert(column.name.clone(), from_sql(column.kind, r.get_ref(i + 4)?));
            }
            Ok((row, status, changed, version))
        })
        .map_err(sql_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error)?;

    raw.into_iter()
        .map(|(row, status, changed, version)| {
            Ok(StoredRow {
                row,
                status: RecordStatus::parse(&status)?,
                changed: changed
                    .split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect(),
                version,
            })
        })
        .collect()
}

fn fetch(conn: &Connection, table: &TableSchema, id: &str) -> Result<Option<StoredRow>> {
    let mut rows = select(
        conn,
        table,
        "id = ?1",
        vec![SqlValue::Text(id.to_string())],
    )?;
    Ok(rows.pop())
}

fn write_row(
    conn: &Connection,
    table: &TableSchema,
    id: &str,
    row: &Row,
    status: RecordStatus,
    changed: &[String],
    version: i64,
) -> Result<()> {
    let mut values = vec![
        SqlValue::Text(id.to_string()),
        SqlValue::Text(status.as_str().to_string()),
        SqlValue::Text(changed.join(",")),
        SqlValue::Integer(version),
    ];
    values.extend(table.columns.iter().map(|c| to_sql(c, row.get(&c.name))));

    let placeholders = (1..=values.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote(&table.name),
            select_list(table),
            placeholders
        ),
        params_from_iter(values),
    )
    .map_err(sql_error)?;
    Ok(())
}
