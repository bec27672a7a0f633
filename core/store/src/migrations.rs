//! Ordered schema migrations.
//!
//! The database records its schema version in `PRAGMA user_version`. A fresh
//! database gets the whole current schema at once; an older one is brought
//! forward by running every migration between its version and the current
//! one inside a single transaction.

use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use tracing::info;

use musichub_common::{Error, Result};

use crate::schema::{
    column_definition, index_statement, quote, validate_identifier, AppSchema, ColumnSchema,
    TableSchema,
};

/// One schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationStep {
    CreateTable(TableSchema),
    AddColumns {
        table: String,
        columns: Vec<ColumnSchema>,
    },
}

/// Steps that move the database to `to_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub to_version: u32,
    pub steps: Vec<MigrationStep>,
}

impl Migration {
    pub fn new(to_version: u32) -> Self {
        Self {
            to_version,
            steps: Vec::new(),
        }
    }

    pub fn create_table(mut self, table: TableSchema) -> Self {
        self.steps.push(MigrationStep::CreateTable(table));
        self
    }

    pub fn add_columns(mut self, table: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        self.steps.push(MigrationStep::AddColumns {
            table: table.into(),
            columns,
        });
        self
    }

    fn apply(&self, tx: &Transaction<'_>) -> Result<()> {
        for step in &self.steps {
            match step {
                MigrationStep::CreateTable(table) => {
                    for statement in table.create_statements() {
                        tx.execute_batch(&statement).map_err(sql_error)?;
                    }
                }
                MigrationStep::AddColumns { table, columns } => {
                    validate_identifier(table)?;
                    for column in columns {
                        validate_identifier(&column.name)?;
                        tx.execute_batch(&format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            quote(table),
                            column_definition(column)
                        ))
                        .map_err(sql_error)?;
                        if column.indexed {
                            tx.execute_batch(&index_statement(table, &column.name))
                                .map_err(sql_error)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Read the stored schema version (0 for a fresh database).
pub(crate) fn stored_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(sql_error)?;
    u32::try_from(version)
        .map_err(|_| Error::Storage(format!("Invalid stored schema version {}", version)))
}

fn set_version(tx: &Transaction<'_>, version: u32) -> Result<()> {
    tx.execute_batch(&format!("PRAGMA user_version = {}", version))
        .map_err(sql_error)
}

/// Bring the database up to `schema.version`.
///
/// # Errors
/// - The database is newer than the schema
/// - A migration for some intermediate version is missing
/// - Any statement fails (nothing is committed in that case)
pub(crate) fn migrate(
    conn: &mut Connection,
    schema: &AppSchema,
    migrations: &[Migration],
) -> Result<()> {
    let current = stored_version(conn)?;
    let target = schema.version;

    if current == target {
        return Ok(());
    }
    if current > target {
        return Err(Error::Storage(format!(
            "Database schema v{} is newer than supported v{}",
            current, target
        )));
    }

    let tx = conn.transaction().map_err(sql_error)?;

    if current == 0 {
        for table in schema.tables() {
            for statement in table.create_statements() {
                tx.execute_batch(&statement).map_err(sql_error)?;
            }
        }
        set_version(&tx, target)?;
        tx.commit().map_err(sql_error)?;
        info!("Created local store schema v{}", target);
        return Ok(());
    }

    for version in (current + 1)..=target {
        let migration = migrations
            .iter()
            .find(|m| m.to_version == version)
            .ok_or_else(|| {
                Error::Storage(format!(
                    "No migration path from schema v{} to v{}",
                    version - 1,
                    version
                ))
            })?;
        migration.apply(&tx)?;
        set_version(&tx, version)?;
    }
    tx.commit().map_err(sql_error)?;

    info!("Migrated local store schema v{} -> v{}", current, target);
    Ok(())
}

pub(crate) fn sql_error(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> AppSchema {
        AppSchema::new(1).table(TableSchema::new("notes").column(ColumnSchema::string("body")))
    }

    fn v2() -> AppSchema {
        AppSchema::new(2)
            .table(
                TableSchema::new("notes")
                    .column(ColumnSchema::string("body"))
                    .column(ColumnSchema::boolean("pinned").indexed()),
            )
            .table(TableSchema::new("tags").column(ColumnSchema::string("label")))
    }

    fn to_v2() -> Migration {
        Migration::new(2)
            .add_columns("notes", vec![ColumnSchema::boolean("pinned").indexed()])
            .create_table(TableSchema::new("tags").column(ColumnSchema::string("label")))
    }

    #[test]
    fn test_fresh_database_gets_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, &v2(), &[]).unwrap();
        assert_eq!(stored_version(&conn).unwrap(), 2);
        conn.execute("INSERT INTO tags (id, label) VALUES ('t1', 'x')", [])
            .unwrap();
    }

    #[test]
    fn test_upgrade_runs_migrations() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, &v1(), &[]).unwrap();
        conn.execute("INSERT INTO notes (id, body) VALUES ('n1', 'hi')", [])
            .unwrap();

        migrate(&mut conn, &v2(), &[to_v2()]).unwrap();

        assert_eq!(stored_version(&conn).unwrap(), 2);
        let pinned: i64 = conn
            .query_row("SELECT COUNT(*) FROM notes WHERE pinned IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pinned, 1);
    }

    #[test]
    fn test_missing_migration_is_an_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, &v1(), &[]).unwrap();
        assert!(migrate(&mut conn, &v2(), &[]).is_err());
        assert_eq!(stored_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_downgrade_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, &v2(), &[]).unwrap();
        assert!(migrate(&mut conn, &v1(), &[]).is_err());
    }
}
