//! Core database infrastructure
//!
//! This module provides the foundational database components used throughout songbase:
//! - `DatabaseConn`: Core SQLite connection wrapper with configuration
//! - `SchemaMigrator`: Versioned schema scripts and their application
//! - `AttachedDatabaseRegistry`: Satellite databases attached to every connection

mod attach;
mod connection;
mod schema;

pub use attach::{
    attach_one, detach_one, AttachFailure, AttachedDatabase, AttachedDatabaseRegistry,
};
pub use connection::DatabaseConn;
pub use schema::{
    exec_commands, read_version, script_name, songs_tables, url_encode_filename_column,
    EmbeddedSchemas, InlineSchemas, MigrationOutcome, SchemaMigrator, SchemaSource, SchemaStatus,
    COMMAND_SEPARATOR, MAGIC_ALL_SONGS_TABLES,
};
