//! MusicHub domain records and their table descriptors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::migrations::Migration;
use crate::schema::{AppSchema, ColumnSchema, TableSchema};

/// Current schema version of the application database.
pub const SCHEMA_VERSION: u32 = 1;

/// A typed record stored in one table.
pub trait Entity: Serialize + DeserializeOwned {
    /// Table holding this record type.
    const TABLE: &'static str;

    /// Record id.
    fn id(&self) -> &str;
}

macro_rules! entity {
    ($ty:ty, $table:literal) => {
        impl Entity for $ty {
            const TABLE: &'static str = $table;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub username: Option<String>,
    pub role: String,
    pub avatar_url: Option<String>,
    pub created_at: i64,
    pub has_completed_onboarding: bool,
    pub last_synced_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub cover_image_url: Option<String>,
    pub is_public: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    /// Display duration, e.g. "3:45".
    pub duration: String,
    pub audio_url: String,
    pub cover_image_url: Option<String>,
    pub genre: Option<String>,
    pub release_date: Option<i64>,
    pub created_at: i64,
    pub artist_id: String,
    pub album_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub cover_image_url: Option<String>,
    pub genre: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub title: String,
    pub cover_image_url: Option<String>,
    pub release_date: i64,
    pub created_at: i64,
    pub artist_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistTrack {
    pub id: String,
    pub playlist_id: String,
    pub track_id: String,
    pub order: i64,
    pub added_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_date: i64,
    pub end_date: i64,
    pub location: String,
    pub image_url: Option<String>,
    pub ticket_price: Option<f64>,
    pub created_at: i64,
    pub user_id: String,
    pub artist_id: Option<String>,
    pub venue_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: String,
    pub name: String,
    pub address: String,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub capacity: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub id: String,
    pub user_id: String,
    pub track_id: String,
    pub created_at: i64,
}

entity!(User, "users");
entity!(Playlist, "playlists");
entity!(Track, "tracks");
entity!(Artist, "artists");
entity!(Album, "albums");
entity!(PlaylistTrack, "playlist_tracks");
entity!(Event, "events");
entity!(Venue, "venues");
entity!(Favorite, "favorites");

/// Table descriptors for every MusicHub record type.
pub fn app_schema() -> AppSchema {
    AppSchema::new(SCHEMA_VERSION)
        .table(
            TableSchema::new(User::TABLE)
                .column(ColumnSchema::string("email").indexed())
                .column(ColumnSchema::string("name"))
                .column(ColumnSchema::string("username").optional())
                .column(ColumnSchema::string("role"))
                .column(ColumnSchema::string("avatar_url").optional())
                .column(ColumnSchema::number("created_at"))
                .column(ColumnSchema::boolean("has_completed_onboarding"))
                .column(ColumnSchema::number("last_synced_at").optional())
                .has_many(Playlist::TABLE, "user_id")
                .has_many(Favorite::TABLE, "user_id")
                .has_many(Event::TABLE, "user_id"),
        )
        .table(
            TableSchema::new(Playlist::TABLE)
                .column(ColumnSchema::string("name"))
                .column(ColumnSchema::string("description").optional())
                .column(ColumnSchema::string("cover_image_url").optional())
                .column(ColumnSchema::boolean("is_public"))
                .column(ColumnSchema::number("created_at"))
                .column(ColumnSchema::number("updated_at"))
                .column(ColumnSchema::string("user_id").indexed())
                .belongs_to(User::TABLE, "user_id")
                .has_many(PlaylistTrack::TABLE, "playlist_id"),
        )
        .table(
            TableSchema::new(Track::TABLE)
                .column(ColumnSchema::string("title"))
                .column(ColumnSchema::string("duration"))
                .column(ColumnSchema::string("audio_url"))
                .column(ColumnSchema::string("cover_image_url").optional())
                .column(ColumnSchema::string("genre").optional())
                .column(ColumnSchema::number("release_date").optional())
                .column(ColumnSchema::number("created_at"))
                .column(ColumnSchema::string("artist_id").indexed())
                .column(ColumnSchema::string("album_id").optional().indexed())
                .belongs_to(Artist::TABLE, "artist_id")
                .belongs_to(Album::TABLE, "album_id")
                .has_many(PlaylistTrack::TABLE, "track_id")
                .has_many(Favorite::TABLE, "track_id"),
        )
        .table(
            TableSchema::new(Artist::TABLE)
                .column(ColumnSchema::string("name"))
                .column(ColumnSchema::string("bio").optional())
                .column(ColumnSchema::string("avatar_url").optional())
                .column(ColumnSchema::string("cover_image_url").optional())
                .column(ColumnSchema::string("genre").optional())
                .column(ColumnSchema::number("created_at"))
                .has_many(Track::TABLE, "artist_id")
                .has_many(Album::TABLE, "artist_id")
                .has_many(Event::TABLE, "artist_id"),
        )
        .table(
            TableSchema::new(Album::TABLE)
                .column(ColumnSchema::string("title"))
                .column(ColumnSchema::string("cover_image_url").optional())
                .column(ColumnSchema::number("release_date"))
                .column(ColumnSchema::number("created_at"))
                .column(ColumnSchema::string("artist_id").indexed())
                .belongs_to(Artist::TABLE, "artist_id")
                .has_many(Track::TABLE, "album_id"),
        )
        .table(
            TableSchema::new(PlaylistTrack::TABLE)
                .column(ColumnSchema::string("playlist_id").indexed())
                .column(ColumnSchema::string("track_id").indexed())
                .column(ColumnSchema::number("order"))
                .column(ColumnSchema::number("added_at"))
                .belongs_to(Playlist::TABLE, "playlist_id")
                .belongs_to(Track::TABLE, "track_id"),
        )
        .table(
            TableSchema::new(Event::TABLE)
                .column(ColumnSchema::string("title"))
                .column(ColumnSchema::string("description").optional())
                .column(ColumnSchema::number("start_date"))
                .column(ColumnSchema::number("end_date"))
                .column(ColumnSchema::string("location"))
                .column(ColumnSchema::string("image_url").optional())
                .column(ColumnSchema::number("ticket_price").optional())
                .column(ColumnSchema::number("created_at"))
                .column(ColumnSchema::string("user_id").indexed())
                .column(ColumnSchema::string("artist_id").optional().indexed())
                .column(ColumnSchema::string("venue_id").optional().indexed())
                .belongs_to(User::TABLE, "user_id")
                .belongs_to(Artist::TABLE, "artist_id")
                .belongs_to(Venue::TABLE, "venue_id"),
        )
        .table(
            TableSchema::new(Venue::TABLE)
                .column(ColumnSchema::string("name"))
                .column(ColumnSchema::string("address"))
                .column(ColumnSchema::string("description").optional())
                .column(ColumnSchema::string("image_url").optional())
                .column(ColumnSchema::number("capacity").optional())
                .column(ColumnSchema::number("created_at"))
                .has_many(Event::TABLE, "venue_id"),
        )
        .table(
            TableSchema::new(Favorite::TABLE)
                .column(ColumnSchema::string("user_id").indexed())
                .column(ColumnSchema::string("track_id").indexed())
                .column(ColumnSchema::number("created_at"))
                .belongs_to(User::TABLE, "user_id")
                .belongs_to(Track::TABLE, "track_id"),
        )
}

/// Migrations from earlier schema versions, in any order.
pub fn app_migrations() -> Vec<Migration> {
    Vec::new()
}
