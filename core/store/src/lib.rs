//! MusicHub Local Store
//!
//! Schema-versioned, relation-aware record storage on SQLite:
//! - Table descriptors with belongs-to / has-many associations
//! - Ordered schema migrations
//! - A per-row change journal (created / updated / deleted)
//! - Transactional application of remote change sets with conflict merging

pub mod conflict;
pub mod entities;
pub mod journal;
pub mod migrations;
pub mod row;
pub mod schema;
pub mod store;

pub use conflict::{ConflictResolver, ConflictStrategy, Resolution};
pub use entities::{
    app_migrations, app_schema, Album, Artist, Entity, Event, Favorite, Playlist, PlaylistTrack,
    Track, User, Venue, SCHEMA_VERSION,
};
pub use journal::{ApplyStats, ChangeSet, JournalSnapshot, RecordStatus, TableChanges};
pub use migrations::{Migration, MigrationStep};
pub use row::Row;
pub use schema::{AppSchema, Association, ColumnSchema, ColumnType, TableSchema};
pub use store::LocalStore;
