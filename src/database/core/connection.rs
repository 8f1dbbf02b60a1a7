//! Database connection management
//!
//! This module provides the engine handle wrapper used by every other part of
//! the storage core.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use rusqlite::{Connection, OpenFlags};
use tracing::warn;

use crate::config::DEFAULT_BUSY_TIMEOUT_MS;
use crate::database::tokenizer::{
    register_tokenizer, UNICODE_TOKENIZER_MODULE, UNICODE_TOKENIZER_NAME,
};

/// Core database connection wrapper
///
/// `DatabaseConn` owns one engine handle. Every handle gets the same pragma
/// configuration and the unicode FTS3 tokenizer, so full-text tables can be
/// created and queried through any of them.
pub struct DatabaseConn {
    pub conn: Connection,
    path: Option<PathBuf>,
}

impl DatabaseConn {
    /// Open a database at the specified path
    ///
    /// If the path is `None`, an in-memory database is created.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Open a database, waiting up to `busy_timeout` on locks held by other handles
    pub fn open_with_timeout(path: Option<&Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| anyhow!("Failed to open database at '{}': {}", p.display(), e))?,
            None => Connection::open_in_memory()
                .map_err(|e| anyhow!("Failed to create in-memory database: {}", e))?,
        };

        conn.busy_timeout(busy_timeout)
            .map_err(|e| anyhow!("Failed to set busy timeout: {}", e))?;

        let db = DatabaseConn {
            conn,
            path: path.map(Path::to_path_buf),
        };
        db.configure()?;
        Ok(db)
    }

    /// Open a database at the specified path (convenience method)
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Some(path))
    }

    /// Create an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::open(None)
    }

    /// Open a bare handle to an existing file, bypassing pragma and tokenizer setup
    ///
    /// Used by maintenance operations that work below the pooled handles.
    pub fn open_raw_existing(path: &Path) -> Result<Connection> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| anyhow!("Failed to open database at '{}': {}", path.display(), e))
    }

    /// Path of the backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Configure the database with the library's settings
    fn configure(&self) -> Result<()> {
        // WAL lets readers on other threads proceed while one thread writes
        let _: String = self
            .conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to set journal mode: {}", e))?;

        self.conn
            .execute("PRAGMA synchronous=NORMAL", [])
            .map_err(|e| anyhow!("Failed to set synchronous mode: {}", e))?;

        // Store temp tables in memory
        self.conn
            .execute("PRAGMA temp_store=MEMORY", [])
            .map_err(|e| anyhow!("Failed to set temp store: {}", e))?;

        // A missing tokenizer only breaks full-text queries, not the handle
        if let Err(e) = register_tokenizer(
            &self.conn,
            UNICODE_TOKENIZER_NAME,
            &UNICODE_TOKENIZER_MODULE,
        ) {
            warn!("Couldn't register FTS3 tokenizer: {}", e);
        }

        Ok(())
    }

    /// Execute a SQL statement
    pub fn execute(&self, sql: &str) -> Result<usize> {
        self.conn
            .execute(sql, [])
            .map_err(|e| anyhow!("Failed to execute SQL: {}", e))
    }

    /// Execute a SQL statement with parameters
    pub fn execute_with_params<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.conn
            .execute(sql, params)
            .map_err(|e| anyhow!("Failed to execute SQL with params: {}", e))
    }

    /// Check if a table exists in the main database
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        table_exists_in(&self.conn, "main", table_name)
    }

    /// Names of all tables in the given schema (`main` or an attachment alias)
    pub fn tables(&self, schema: &str) -> Result<Vec<String>> {
        list_tables(&self.conn, schema)
    }

    /// Get the row count for a table
    pub fn table_count(&self, table_name: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", table_name);
        let count: u64 = self
            .conn
            .query_row(&query, [], |row| row.get(0))
            .map_err(|e| anyhow!("Failed to get table count: {}", e))?;
        Ok(count)
    }

    /// Aliases of every attached database, excluding `main` and `temp`
    pub fn attached_aliases(&self) -> Result<Vec<String>> {
        attached_aliases(&self.conn)
    }
}

/// Aliases of every database attached to `conn`, excluding `main` and `temp`
pub(crate) fn attached_aliases(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("PRAGMA database_list")
        .map_err(|e| anyhow!("Failed to list databases: {}", e))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| anyhow!("Failed to list databases: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| anyhow!("Failed to read database list: {}", e))?;
    Ok(names
        .into_iter()
        .filter(|n| n != "main" && n != "temp")
        .collect())
}

/// Attached aliases backed by a file of their own
///
/// Skips every alias whose file is `main`'s file or the file of an alias
/// listed before it. In-memory databases have no file and are always distinct.
pub(crate) fn distinct_attached_aliases(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("PRAGMA database_list")
        .map_err(|e| anyhow!("Failed to list databases: {}", e))?;
    let databases = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            ))
        })
        .map_err(|e| anyhow!("Failed to list databases: {}", e))?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()
        .map_err(|e| anyhow!("Failed to read database list: {}", e))?;

    let mut seen: Vec<String> = Vec::new();
    let mut aliases = Vec::new();
    for (name, file) in databases {
        if name == "temp" {
            continue;
        }
        let shared = !file.is_empty() && seen.contains(&file);
        if !file.is_empty() {
            seen.push(file);
        }
        if name != "main" && !shared {
            aliases.push(name);
        }
    }
    Ok(aliases)
}

/// Check if a table exists in `schema`
pub(crate) fn table_exists_in(conn: &Connection, schema: &str, table_name: &str) -> Result<bool> {
    let query = format!(
        "SELECT COUNT(*) FROM {}.sqlite_master WHERE type='table' AND name=?1",
        schema
    );
    let count: i32 = conn
        .query_row(&query, [table_name], |row| row.get(0))
        .map_err(|e| anyhow!("Failed to check table existence: {}", e))?;
    Ok(count > 0)
}

/// Names of all tables in `schema`, in creation order
pub(crate) fn list_tables(conn: &Connection, schema: &str) -> Result<Vec<String>> {
    let query = format!(
        "SELECT name FROM {}.sqlite_master WHERE type='table' ORDER BY rowid",
        schema
    );
    let mut stmt = conn
        .prepare(&query)
        .map_err(|e| anyhow!("Failed to list tables in '{}': {}", schema, e))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| anyhow!("Failed to list tables in '{}': {}", schema, e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| anyhow!("Failed to read table names in '{}': {}", schema, e))?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = DatabaseConn::open_in_memory();
        assert!(db.is_ok());
        assert!(db.unwrap().path().is_none());
    }

    #[test]
    fn test_execute() {
        let db = DatabaseConn::open_in_memory().unwrap();
        let result = db.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_table_exists() {
        let db = DatabaseConn::open_in_memory().unwrap();
        db.execute("CREATE TABLE test_table (id INTEGER PRIMARY KEY)")
            .unwrap();

        assert!(db.table_exists("test_table").unwrap());
        assert!(!db.table_exists("nonexistent_table").unwrap());
    }

    #[test]
    fn test_tables_in_creation_order() {
        let db = DatabaseConn::open_in_memory().unwrap();
        db.execute("CREATE TABLE b (id INTEGER)").unwrap();
        db.execute("CREATE TABLE a (id INTEGER)").unwrap();
        db.execute("CREATE INDEX idx_a ON a (id)").unwrap();

        assert_eq!(db.tables("main").unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn test_table_count() {
        let db = DatabaseConn::open_in_memory().unwrap();
        db.execute("CREATE TABLE test_table (id INTEGER PRIMARY KEY)")
            .unwrap();
        db.execute("INSERT INTO test_table (id) VALUES (1), (2), (3)")
            .unwrap();

        assert_eq!(db.table_count("test_table").unwrap(), 3);
    }

    #[test]
    fn test_tokenizer_registered_on_open() {
        let db = DatabaseConn::open_in_memory().unwrap();
        db.execute("CREATE VIRTUAL TABLE t USING fts3(body, tokenize=unicode)")
            .unwrap();
        db.execute("INSERT INTO t (body) VALUES ('Sigur Rós')")
            .unwrap();
        let hits: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM t WHERE t MATCH 'ros'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_attached_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open_path(&dir.path().join("main.db")).unwrap();
        let other = dir.path().join("other.db");
        db.execute_with_params(
            "ATTACH DATABASE ?1 AS other",
            [other.to_string_lossy().to_string()],
        )
        .unwrap();

        assert_eq!(db.attached_aliases().unwrap(), vec!["other"]);
    }

    #[test]
    fn test_distinct_attached_aliases_skip_shared_files() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.db");
        let other = dir.path().join("other.db");
        let db = DatabaseConn::open_path(&main).unwrap();
        for (alias, path) in [("again", &main), ("other", &other), ("twin", &other)] {
            db.execute_with_params(
                &format!("ATTACH DATABASE ?1 AS {}", alias),
                [path.to_string_lossy().to_string()],
            )
            .unwrap();
        }
        db.execute("ATTACH DATABASE ':memory:' AS scratch").unwrap();
        db.execute("ATTACH DATABASE ':memory:' AS scratch2").unwrap();

        assert_eq!(
            db.attached_aliases().unwrap(),
            vec!["again", "other", "twin", "scratch", "scratch2"]
        );
        assert_eq!(
            distinct_attached_aliases(&db.conn).unwrap(),
            vec!["other", "scratch", "scratch2"]
        );
    }
}
