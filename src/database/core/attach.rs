//! Satellite databases attached to every library connection
//!
//! A satellite is declared once with an alias, a file and the name of its
//! bootstrap script. Every new connection attaches all of them; a satellite
//! whose file holds no tables is bootstrapped from its script.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connection::{distinct_attached_aliases, list_tables};
use super::schema::{exec_commands, songs_tables, SchemaSource};

/// A declared satellite database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachedDatabase {
    /// Schema name the file is attached under
    pub alias: String,
    /// Backing file
    pub filename: PathBuf,
    /// Name of the bootstrap script run when the file holds no tables
    pub script: String,
}

/// A satellite that could not be attached to a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachFailure {
    pub alias: String,
    pub message: String,
}

/// Declared satellites, shared by every connection of one library
#[derive(Debug, Default)]
pub struct AttachedDatabaseRegistry {
    entries: Mutex<Vec<AttachedDatabase>>,
}

fn valid_alias(alias: &str) -> bool {
    let mut chars = alias.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !alias.eq_ignore_ascii_case("main")
        && !alias.eq_ignore_ascii_case("temp")
}

impl AttachedDatabaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a satellite; aliases are unique within the registry
    pub fn declare(
        &self,
        alias: &str,
        filename: impl Into<PathBuf>,
        script: &str,
    ) -> Result<AttachedDatabase> {
        if !valid_alias(alias) {
            return Err(anyhow!("Invalid attached database alias '{}'", alias));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Attached database registry lock poisoned"))?;

        if entries.iter().any(|e| e.alias.eq_ignore_ascii_case(alias)) {
            return Err(anyhow!("Attached database '{}' is already declared", alias));
        }

        let entry = AttachedDatabase {
            alias: alias.to_string(),
            filename: filename.into(),
            script: script.to_string(),
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Look up a declared satellite by alias
    pub fn get(&self, alias: &str) -> Option<AttachedDatabase> {
        self.entries
            .lock()
            .ok()?
            .iter()
            .find(|e| e.alias.eq_ignore_ascii_case(alias))
            .cloned()
    }

    /// Snapshot of every declared satellite in declaration order
    pub fn all(&self) -> Vec<AttachedDatabase> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.all().into_iter().map(|e| e.alias).collect()
    }

    /// Attach every declared satellite to `conn`
    ///
    /// `injected` replaces every satellite's file, like it replaces the main
    /// database file. A satellite that fails to attach is skipped and
    /// reported; the connection stays usable.
    pub fn attach_all(&self, conn: &Connection, injected: Option<&Path>) -> Vec<AttachFailure> {
        let mut failures = Vec::new();

        for entry in self.all() {
            let path = injected.unwrap_or(&entry.filename);
            if let Err(e) = attach_one(conn, &entry.alias, path) {
                warn!("{}", e);
                failures.push(AttachFailure {
                    alias: entry.alias.clone(),
                    message: e.to_string(),
                });
            }
        }

        failures
    }

    /// Run the bootstrap script of every attached satellite holding no tables
    ///
    /// Returns the aliases that were bootstrapped. A script failure is an
    /// error; the satellite is then left empty.
    pub fn bootstrap_empty(
        &self,
        conn: &Connection,
        source: &dyn SchemaSource,
    ) -> Result<Vec<String>> {
        // An alias sharing its file with another database is populated through it
        let attached = distinct_attached_aliases(conn)?;
        let mut bootstrapped = Vec::new();

        for entry in self.all() {
            if !attached.iter().any(|a| a.eq_ignore_ascii_case(&entry.alias)) {
                continue;
            }
            if !list_tables(conn, &entry.alias)?.is_empty() {
                continue;
            }

            let script = source.script(&entry.script).ok_or_else(|| {
                anyhow!(
                    "Couldn't find bootstrap script '{}' for attached database '{}'",
                    entry.script,
                    entry.alias
                )
            })?;

            info!(
                "Bootstrapping attached database '{}' from '{}'",
                entry.alias, entry.script
            );

            let tx = conn
                .unchecked_transaction()
                .map_err(|e| anyhow!("Failed to begin transaction: {}", e))?;
            let tables = songs_tables(conn, Some(0), source)?;
            exec_commands(conn, &script, &tables)?;
            tx.commit().map_err(|e| {
                anyhow!(
                    "Failed to commit bootstrap of attached database '{}': {}",
                    entry.alias,
                    e
                )
            })?;

            bootstrapped.push(entry.alias);
        }

        Ok(bootstrapped)
    }
}

/// Attach the file at `path` under `alias`
pub fn attach_one(conn: &Connection, alias: &str, path: &Path) -> Result<()> {
    debug!("Attaching {} as '{}'", path.display(), alias);
    conn.execute(
        &format!("ATTACH DATABASE ?1 AS \"{}\"", alias),
        [path.to_string_lossy()],
    )
    .map_err(|e| {
        anyhow!(
            "Failed to attach database {} as '{}': {}",
            path.display(),
            alias,
            e
        )
    })?;
    Ok(())
}

/// Detach `alias` from `conn`
pub fn detach_one(conn: &Connection, alias: &str) -> Result<()> {
    conn.execute(&format!("DETACH DATABASE \"{}\"", alias), [])
        .map_err(|e| anyhow!("Failed to detach database '{}': {}", alias, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::{DatabaseConn, InlineSchemas};

    const SATELLITE: &str = "CREATE TABLE cache.songs (title TEXT, filename TEXT);

CREATE TABLE cache.track_ids (songs_id INTEGER PRIMARY KEY, track_id INTEGER);
";

    #[test]
    fn test_declare_rejects_duplicates() {
        let registry = AttachedDatabaseRegistry::new();
        registry.declare("cache", "/tmp/cache.db", "cache").unwrap();

        assert!(registry.declare("cache", "/tmp/other.db", "cache").is_err());
        assert!(registry.declare("CACHE", "/tmp/other.db", "cache").is_err());
        assert_eq!(registry.aliases(), vec!["cache"]);
        assert_eq!(
            registry.get("cache").unwrap().filename,
            PathBuf::from("/tmp/cache.db")
        );
    }

    #[test]
    fn test_declare_rejects_bad_aliases() {
        let registry = AttachedDatabaseRegistry::new();
        for alias in ["", "main", "temp", "1abc", "a b", "x\"y"] {
            assert!(registry.declare(alias, "/tmp/x.db", "x").is_err(), "{}", alias);
        }
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_attach_and_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open_path(&dir.path().join("main.db")).unwrap();
        let registry = AttachedDatabaseRegistry::new();
        registry
            .declare("cache", dir.path().join("cache.db"), "cache")
            .unwrap();
        let source = InlineSchemas::new(0).with_script("cache", SATELLITE);

        assert!(registry.attach_all(&db.conn, None).is_empty());
        assert_eq!(
            registry.bootstrap_empty(&db.conn, &source).unwrap(),
            vec!["cache"]
        );
        assert_eq!(db.tables("cache").unwrap(), vec!["songs", "track_ids"]);

        // Already populated
        assert!(registry.bootstrap_empty(&db.conn, &source).unwrap().is_empty());
    }

    #[test]
    fn test_attach_failure_keeps_connection_usable() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open_path(&dir.path().join("main.db")).unwrap();
        let registry = AttachedDatabaseRegistry::new();
        registry
            .declare("broken", dir.path().join("missing/dir/broken.db"), "x")
            .unwrap();
        registry
            .declare("cache", dir.path().join("cache.db"), "cache")
            .unwrap();

        let failures = registry.attach_all(&db.conn, None);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].alias, "broken");

        assert_eq!(db.attached_aliases().unwrap(), vec!["cache"]);
        db.execute("CREATE TABLE t (id INTEGER)").unwrap();
        assert!(db.table_exists("t").unwrap());
    }

    #[test]
    fn test_missing_bootstrap_script() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open_path(&dir.path().join("main.db")).unwrap();
        let registry = AttachedDatabaseRegistry::new();
        registry
            .declare("cache", dir.path().join("cache.db"), "nowhere")
            .unwrap();
        registry.attach_all(&db.conn, None);

        let source = InlineSchemas::new(0);
        assert!(registry.bootstrap_empty(&db.conn, &source).is_err());
    }

    #[test]
    fn test_injected_path_overrides_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let injected = dir.path().join("injected.db");
        let db = DatabaseConn::open_path(&injected).unwrap();
        db.execute("CREATE TABLE songs (title TEXT)").unwrap();

        let registry = AttachedDatabaseRegistry::new();
        registry
            .declare("cache", dir.path().join("cache.db"), "cache")
            .unwrap();
        assert!(registry.attach_all(&db.conn, Some(&injected)).is_empty());

        assert_eq!(db.tables("cache").unwrap(), vec!["songs"]);
        assert!(!dir.path().join("cache.db").exists());
    }

    #[test]
    fn test_detach() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open_path(&dir.path().join("main.db")).unwrap();
        attach_one(&db.conn, "cache", &dir.path().join("cache.db")).unwrap();
        detach_one(&db.conn, "cache").unwrap();
        assert!(db.attached_aliases().unwrap().is_empty());
    }
}
