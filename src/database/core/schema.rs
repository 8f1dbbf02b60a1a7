//! Versioned schema migration
//!
//! The library schema is a chain of numbered SQL scripts. Version 0 is the
//! base script (`schema`), every later version `v` is `schema-<v>`. A script
//! is a list of statements separated by a semicolon followed by a blank line.
//!
//! Statements containing [`MAGIC_ALL_SONGS_TABLES`] are expanded into one
//! statement per songs table, across the main database and every attached
//! database, so per-source copies of the songs table keep the same shape.

use std::borrow::Cow;
use std::collections::HashMap;

use anyhow::{anyhow, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use url::Url;

use super::connection::{distinct_attached_aliases, list_tables, table_exists_in};
use crate::tasks::{TaskGuard, TaskManager};

/// Placeholder expanded into every songs table name
pub const MAGIC_ALL_SONGS_TABLES: &str = "%allsongstables";

/// Separator between statements of one script
pub const COMMAND_SEPARATOR: &str = ";\n\n";

/// Name of the script bringing the schema to `version`
pub fn script_name(version: u32) -> String {
    if version == 0 {
        "schema".to_string()
    } else {
        format!("schema-{}", version)
    }
}

/// Lookup of versioned schema scripts and satellite bootstrap scripts
pub trait SchemaSource: Send + Sync {
    /// Version the main database is migrated to
    fn target_version(&self) -> u32;

    /// Script text by resource name (see [`script_name`])
    fn script(&self, name: &str) -> Option<Cow<'static, str>>;

    /// Version whose step first rewrites plain file names into `file://` URLs
    fn url_encode_version(&self) -> Option<u32> {
        None
    }

    /// Schema version from which `playlist_items` counts as a songs table
    fn playlist_items_songs_since(&self) -> Option<u32> {
        None
    }
}

/// The library's schema chain, compiled into the binary
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedSchemas;

impl EmbeddedSchemas {
    pub const TARGET_VERSION: u32 = 6;
    pub const URL_ENCODE_VERSION: u32 = 4;
    pub const PLAYLIST_ITEMS_SONGS_SINCE: u32 = 3;
}

impl SchemaSource for EmbeddedSchemas {
    fn target_version(&self) -> u32 {
        Self::TARGET_VERSION
    }

    fn script(&self, name: &str) -> Option<Cow<'static, str>> {
        let sql = match name {
            "schema" => include_str!("../schema/schema.sql"),
            "schema-1" => include_str!("../schema/schema-1.sql"),
            "schema-2" => include_str!("../schema/schema-2.sql"),
            "schema-3" => include_str!("../schema/schema-3.sql"),
            "schema-4" => include_str!("../schema/schema-4.sql"),
            "schema-5" => include_str!("../schema/schema-5.sql"),
            "schema-6" => include_str!("../schema/schema-6.sql"),
            "jamendo" => include_str!("../schema/jamendo.sql"),
            _ => return None,
        };
        Some(Cow::Borrowed(sql))
    }

    fn url_encode_version(&self) -> Option<u32> {
        Some(Self::URL_ENCODE_VERSION)
    }

    fn playlist_items_songs_since(&self) -> Option<u32> {
        Some(Self::PLAYLIST_ITEMS_SONGS_SINCE)
    }
}

/// Schema chain assembled in code
#[derive(Debug, Clone, Default)]
pub struct InlineSchemas {
    target_version: u32,
    scripts: HashMap<String, String>,
    url_encode_version: Option<u32>,
    playlist_items_songs_since: Option<u32>,
}

impl InlineSchemas {
    pub fn new(target_version: u32) -> Self {
        Self {
            target_version,
            ..Default::default()
        }
    }

    pub fn with_script(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), sql.into());
        self
    }

    pub fn with_url_encode_version(mut self, version: u32) -> Self {
        self.url_encode_version = Some(version);
        self
    }

    pub fn with_playlist_items_songs_since(mut self, version: u32) -> Self {
        self.playlist_items_songs_since = Some(version);
        self
    }
}

impl SchemaSource for InlineSchemas {
    fn target_version(&self) -> u32 {
        self.target_version
    }

    fn script(&self, name: &str) -> Option<Cow<'static, str>> {
        self.scripts.get(name).cloned().map(Cow::Owned)
    }

    fn url_encode_version(&self) -> Option<u32> {
        self.url_encode_version
    }

    fn playlist_items_songs_since(&self) -> Option<u32> {
        self.playlist_items_songs_since
    }
}

/// Schema status of a database relative to a target version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SchemaStatus {
    /// Database is not initialized (fresh database)
    NotInitialized,

    /// Schema is at the target version
    Current,

    /// Schema needs migration from an older version
    NeedsMigration { from: u32, to: u32 },

    /// Database is from a newer version (incompatible)
    Incompatible {
        database_version: u32,
        required_version: u32,
    },
}

impl SchemaStatus {
    pub fn from_versions(database_version: Option<u32>, target_version: u32) -> Self {
        match database_version {
            None => SchemaStatus::NotInitialized,
            Some(v) if v == target_version => SchemaStatus::Current,
            Some(v) if v < target_version => SchemaStatus::NeedsMigration {
                from: v,
                to: target_version,
            },
            Some(v) => SchemaStatus::Incompatible {
                database_version: v,
                required_version: target_version,
            },
        }
    }
}

/// Result of one migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationOutcome {
    /// The schema was created from scratch
    Created { version: u32 },

    /// The schema was upgraded through one or more steps
    Upgraded { from: u32, to: u32 },

    /// Nothing to do
    Current { version: u32 },

    /// The file was written by a newer release; the schema was left untouched
    NewerThanExpected {
        database_version: u32,
        target_version: u32,
    },
}

impl MigrationOutcome {
    /// Schema version recorded on disk after the run
    pub fn version(&self) -> u32 {
        match *self {
            MigrationOutcome::Created { version } | MigrationOutcome::Current { version } => {
                version
            }
            MigrationOutcome::Upgraded { to, .. } => to,
            MigrationOutcome::NewerThanExpected {
                database_version, ..
            } => database_version,
        }
    }
}

/// Read the recorded schema version, `None` when the version table is missing
pub fn read_version(conn: &Connection) -> Result<Option<u32>> {
    if !table_exists_in(conn, "main", "schema_version")? {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()
        .map_err(|e| anyhow!("Failed to read schema version: {}", e))?;

    Ok(Some(version.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)))
}

/// Applies the schema chain to a connection
///
/// Each version step runs in its own transaction together with the version
/// bump, so a failed step leaves the database at the previous version.
pub struct SchemaMigrator<'a> {
    conn: &'a Connection,
    source: &'a dyn SchemaSource,
    tasks: Option<&'a dyn TaskManager>,
}

impl<'a> SchemaMigrator<'a> {
    pub fn new(conn: &'a Connection, source: &'a dyn SchemaSource) -> Self {
        Self {
            conn,
            source,
            tasks: None,
        }
    }

    /// Report step progress to `tasks`
    pub fn with_tasks(mut self, tasks: &'a dyn TaskManager) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Status of the main database without modifying it
    pub fn status(&self) -> Result<SchemaStatus> {
        Ok(SchemaStatus::from_versions(
            read_version(self.conn)?,
            self.source.target_version(),
        ))
    }

    /// Bring the main database to the target version
    ///
    /// An error means a step failed; the schema is then at the last
    /// successfully committed version and must not be used further.
    pub fn migrate(&self) -> Result<MigrationOutcome> {
        let target = self.source.target_version();
        let current = read_version(self.conn)?;

        let first_step = match current {
            Some(v) if v > target => {
                warn!(
                    "Database schema version {} is newer than expected {}; leaving it untouched",
                    v, target
                );
                return Ok(MigrationOutcome::NewerThanExpected {
                    database_version: v,
                    target_version: target,
                });
            }
            Some(v) if v == target => {
                debug!("Database schema is current at version {}", v);
                return Ok(MigrationOutcome::Current { version: v });
            }
            Some(v) => v + 1,
            None => 0,
        };

        let steps = u64::from(target - first_step) + 1;
        let guard = self
            .tasks
            .map(|tasks| TaskGuard::start(tasks, "Updating database schema"));

        for (done, version) in (first_step..=target).enumerate() {
            self.apply_version(version)?;
            if let Some(guard) = &guard {
                guard.progress(done as u64 + 1, steps);
            }
        }

        Ok(match current {
            None => {
                info!("Created database schema at version {}", target);
                MigrationOutcome::Created { version: target }
            }
            Some(from) => {
                info!("Upgraded database schema from version {} to {}", from, target);
                MigrationOutcome::Upgraded { from, to: target }
            }
        })
    }

    /// Apply one version step in its own transaction
    pub fn apply_version(&self, version: u32) -> Result<()> {
        let name = script_name(version);
        let script = self
            .source
            .script(&name)
            .ok_or_else(|| anyhow!("Couldn't find schema script '{}'", name))?;

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))?;

        // Captured before any statement of this step runs
        let previous = version.checked_sub(1);
        let tables = songs_tables(self.conn, previous, self.source)?;

        if self.source.url_encode_version() == Some(version) {
            self.url_encode_filenames()?;
        }

        debug!("Applying database schema update {} from {}", version, name);
        exec_commands(self.conn, &script, &tables)?;

        tx.execute("UPDATE schema_version SET version=?1", [version])
            .map_err(|e| anyhow!("Failed to record schema version {}: {}", version, e))?;

        tx.commit()
            .map_err(|e| anyhow!("Failed to commit schema version {}: {}", version, e))
    }

    fn url_encode_filenames(&self) -> Result<()> {
        let mut tables = vec!["songs".to_string(), "playlist_items".to_string()];
        tables.extend(
            list_tables(self.conn, "main")?
                .into_iter()
                .filter(|t| t.starts_with("device_") && t.ends_with("_songs")),
        );

        for table in tables {
            if table_exists_in(self.conn, "main", &table)? {
                url_encode_filename_column(self.conn, &table)?;
            }
        }
        Ok(())
    }
}

/// Songs tables visible on `conn` for a schema at `version`
///
/// Main database: `songs` and every table ending in `_songs`. Attached
/// databases are scanned with the long-standing selection query, whose
/// unparenthesized `AND`/`OR` also picks up non-table objects named like
/// songs tables. An alias sharing a file with `main` or an earlier alias is
/// not scanned, so each table is listed once.
pub fn songs_tables(
    conn: &Connection,
    version: Option<u32>,
    source: &dyn SchemaSource,
) -> Result<Vec<String>> {
    let mut tables: Vec<String> = list_tables(conn, "main")?
        .into_iter()
        .filter(|t| t == "songs" || t.ends_with("_songs"))
        .collect();

    for alias in distinct_attached_aliases(conn)? {
        let query = format!(
            "SELECT name FROM {}.sqlite_master WHERE type='table' AND name='songs' OR name LIKE '%songs'",
            alias
        );
        let names = conn.prepare(&query).and_then(|mut stmt| {
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        });
        match names {
            Ok(names) => tables.extend(names.into_iter().map(|n| format!("{}.{}", alias, n))),
            Err(e) => warn!("Couldn't list songs tables in '{}': {}", alias, e),
        }
    }

    if let (Some(v), Some(since)) = (version, source.playlist_items_songs_since()) {
        if v >= since {
            tables.push("playlist_items".to_string());
        }
    }

    Ok(tables)
}

/// Execute every statement of `script`, expanding the songs-table placeholder
/// over `tables`
pub fn exec_commands(conn: &Connection, script: &str, tables: &[String]) -> Result<()> {
    for command in script.split(COMMAND_SEPARATOR) {
        if command.trim().is_empty() {
            continue;
        }

        if command.contains(MAGIC_ALL_SONGS_TABLES) {
            for table in tables {
                info!("Updating {} for {}", table, MAGIC_ALL_SONGS_TABLES);
                exec_one(conn, &command.replace(MAGIC_ALL_SONGS_TABLES, table))?;
            }
        } else {
            exec_one(conn, command)?;
        }
    }
    Ok(())
}

fn exec_one(conn: &Connection, command: &str) -> Result<()> {
    conn.execute_batch(command).map_err(|e| {
        error!("db error: {}", e);
        error!("faulty query: {}", command.trim());
        anyhow!("Unable to update music library database: {}", e)
    })
}

/// Rewrite plain absolute file names in `table` as `file://` URLs
pub fn url_encode_filename_column(conn: &Connection, table: &str) -> Result<usize> {
    let rows: Vec<(i64, Option<String>)> = {
        let mut stmt = conn
            .prepare(&format!("SELECT ROWID, filename FROM {}", table))
            .map_err(|e| anyhow!("Failed to read file names from '{}': {}", table, e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| anyhow!("Failed to read file names from '{}': {}", table, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| anyhow!("Failed to read file names from '{}': {}", table, e))?;
        rows
    };

    let mut update = conn
        .prepare(&format!("UPDATE {} SET filename=?1 WHERE ROWID=?2", table))
        .map_err(|e| anyhow!("Failed to prepare file name update for '{}': {}", table, e))?;

    let mut rewritten = 0;
    for (rowid, filename) in rows {
        let Some(filename) = filename else { continue };
        if filename.is_empty() || filename.contains("://") {
            continue;
        }

        match Url::from_file_path(&filename) {
            Ok(url) => {
                update
                    .execute(rusqlite::params![url.as_str(), rowid])
                    .map_err(|e| anyhow!("Failed to update file name in '{}': {}", table, e))?;
                rewritten += 1;
            }
            Err(()) => warn!("Leaving relative file name '{}' in {} unchanged", filename, table),
        }
    }

    debug!("Rewrote {} file names in {} as URLs", rewritten, table);
    Ok(rewritten)
}
