//! Table descriptors and the application schema.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use musichub_common::{Error, Result};

/// Bookkeeping columns present on every table.
pub const ID_COLUMN: &str = "id";
pub const STATUS_COLUMN: &str = "_status";
pub const CHANGED_COLUMN: &str = "_changed";
pub const VERSION_COLUMN: &str = "_version";

/// Value type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
}

impl ColumnType {
    /// SQLite declared type. `NUMERIC` keeps integers exact and stores
    /// fractional values as REAL.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::String => "TEXT",
            ColumnType::Number => "NUMERIC",
            ColumnType::Boolean => "INTEGER",
        }
    }
}

/// A single user column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: ColumnType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub indexed: bool,
}

impl ColumnSchema {
    fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            indexed: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::String)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    /// Allow null values.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Create an index on this column.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// Relation from one table to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Association {
    /// This table holds `key`, referencing the other table's `id`.
    BelongsTo { table: String, key: String },
    /// The other table holds `foreign_key`, referencing this table's `id`.
    HasMany { table: String, foreign_key: String },
}

impl Association {
    pub fn belongs_to(table: impl Into<String>, key: impl Into<String>) -> Self {
        Association::BelongsTo {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn has_many(table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Association::HasMany {
            table: table.into(),
            foreign_key: foreign_key.into(),
        }
    }

    /// Name of the associated table.
    pub fn table(&self) -> &str {
        match self {
            Association::BelongsTo { table, .. } | Association::HasMany { table, .. } => table,
        }
    }
}

/// Descriptor of one table: its columns and associations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    #[serde(default)]
    pub associations: Vec<Association>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            associations: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSchema) -> Self {
        self.columns.push(column);
        self
    }

    pub fn belongs_to(mut self, table: impl Into<String>, key: impl Into<String>) -> Self {
        self.associations.push(Association::belongs_to(table, key));
        self
    }

    pub fn has_many(mut self, table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        self.associations.push(Association::has_many(table, foreign_key));
        self
    }

    /// Look up a user column.
    pub fn column_named(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up the association towards `table`.
    pub fn association_to(&self, table: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.table() == table)
    }

    /// `CREATE TABLE` plus index statements.
    pub fn create_statements(&self) -> Vec<String> {
        let mut defs = vec![
            format!("{} TEXT PRIMARY KEY NOT NULL", quote(ID_COLUMN)),
            format!("{} TEXT NOT NULL DEFAULT 'synced'", quote(STATUS_COLUMN)),
            format!("{} TEXT NOT NULL DEFAULT ''", quote(CHANGED_COLUMN)),
            format!("{} INTEGER NOT NULL DEFAULT 0", quote(VERSION_COLUMN)),
        ];
        defs.extend(self.columns.iter().map(column_definition));

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(&self.name),
            defs.join(", ")
        )];
        statements.push(index_statement(&self.name, STATUS_COLUMN));
        statements.extend(
            self.columns
                .iter()
                .filter(|c| c.indexed)
                .map(|c| index_statement(&self.name, &c.name)),
        );
        statements
    }

    fn validate_columns(&self) -> Result<()> {
        validate_identifier(&self.name)?;
        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if column.name == ID_COLUMN {
                return Err(Error::InvalidInput(format!(
                    "Table '{}' must not declare the reserved column '{}'",
                    self.name, column.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// The full versioned schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSchema {
    pub version: u32,
    tables: Vec<TableSchema>,
}

impl AppSchema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: Vec::new(),
        }
    }

    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    /// Look up a table descriptor.
    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Look up a table descriptor, failing for unknown names.
    pub fn require(&self, name: &str) -> Result<&TableSchema> {
        self.get(name)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown table '{}'", name)))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.iter()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Check identifiers, duplicates and that every association points at
    /// an existing table and column.
    ///
    /// # Errors
    /// - Schema version is zero
    /// - Invalid or duplicate names
    /// - Dangling associations
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(Error::InvalidInput(
                "Schema version must be at least 1".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            table.validate_columns()?;
            if !names.insert(table.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "Duplicate table '{}'",
                    table.name
                )));
            }
        }

        for table in &self.tables {
            for association in &table.associations {
                let other = self.get(association.table()).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "Table '{}' is associated with unknown table '{}'",
                        table.name,
                        association.table()
                    ))
                })?;
                let (holder, key) = match association {
                    Association::BelongsTo { key, .. } => (table, key),
                    Association::HasMany { foreign_key, .. } => (other, foreign_key),
                };
                if holder.column_named(key).is_none() {
                    return Err(Error::InvalidInput(format!(
                        "Association key '{}' missing from table '{}'",
                        key, holder.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Quote an identifier for SQL. Names are validated before they get here.
pub(crate) fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

pub(crate) fn column_definition(column: &ColumnSchema) -> String {
    format!("{} {}", quote(&column.name), column.kind.sql_type())
}

pub(crate) fn index_statement(table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote(&format!("{}_{}", table, column)),
        quote(table),
        quote(column)
    )
}

/// Identifiers are ASCII letters, digits and underscores, starting with a
/// letter. The leading underscore is reserved for bookkeeping columns.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid identifier '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> AppSchema {
        AppSchema::new(1)
            .table(
                TableSchema::new("shelves")
                    .column(ColumnSchema::string("label"))
                    .has_many("books", "shelf_id"),
            )
            .table(
                TableSchema::new("books")
                    .column(ColumnSchema::string("title").indexed())
                    .column(ColumnSchema::string("shelf_id").indexed())
                    .column(ColumnSchema::number("pages").optional())
                    .belongs_to("shelves", "shelf_id"),
            )
    }

    #[test]
    fn test_valid_schema() {
        library().validate().unwrap();
    }

    #[test]
    fn test_dangling_association_rejected() {
        let schema = AppSchema::new(1).table(
            TableSchema::new("books")
                .column(ColumnSchema::string("title"))
                .belongs_to("shelves", "shelf_id"),
        );
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_missing_foreign_key_rejected() {
        let schema = AppSchema::new(1)
            .table(TableSchema::new("shelves").has_many("books", "shelf_id"))
            .table(TableSchema::new("books").column(ColumnSchema::string("title")));
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_reserved_and_invalid_names_rejected() {
        let reserved = AppSchema::new(1).table(TableSchema::new("t").column(ColumnSchema::string("id")));
        assert!(reserved.validate().is_err());

        let injected = AppSchema::new(1)
            .table(TableSchema::new("t").column(ColumnSchema::string("a\" TEXT); DROP")));
        assert!(injected.validate().is_err());

        let underscore = AppSchema::new(1).table(TableSchema::new("t").column(ColumnSchema::string("_status")));
        assert!(underscore.validate().is_err());
    }

    #[test]
    fn test_create_statements_quote_keywords() {
        let table = TableSchema::new("playlist_tracks").column(ColumnSchema::number("order"));
        let statements = table.create_statements();
        assert!(statements[0].contains("\"order\" NUMERIC"));
        assert!(statements[0].contains("\"_status\" TEXT NOT NULL DEFAULT 'synced'"));
    }

    #[test]
    fn test_association_lookup() {
        let schema = library();
        let books = schema.require("books").unwrap();
        assert_eq!(
            books.association_to("shelves"),
            Some(&Association::belongs_to("shelves", "shelf_id"))
        );
        assert!(schema.require("nope").is_err());
    }
}
