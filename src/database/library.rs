//! The library database and its per-thread connections
//!
//! Engine handles cannot be shared between threads, so [`Database`] keeps one
//! handle per thread in thread-local storage and hands out `Rc`s to it. The
//! first connection of a `Database` migrates the main schema; every new
//! connection attaches the declared satellites and bootstraps the empty ones.
//!
//! ```rust,ignore
//! use songbase::{Database, SongbaseConfig};
//!
//! let db = Database::new(SongbaseConfig::with_data_dir("/srv/music"));
//! let conn = db.connect()?;
//! let count = conn.table_count("songs")?;
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, Result};
use tracing::{debug, error, info, warn};

use super::backup::{BackupEngine, BackupOutcome};
use super::core::{
    detach_one, read_version, AttachedDatabase, AttachedDatabaseRegistry, DatabaseConn,
    EmbeddedSchemas, MigrationOutcome, SchemaMigrator, SchemaSource, SchemaStatus,
};
use super::integrity::{IntegrityChecker, IntegrityReport};
use crate::config::SongbaseConfig;
use crate::tasks::{ErrorSink, LogErrorSink, LogTaskManager, TaskManager};

/// Alias of the catalogue cache satellite declared by [`Database::new`]
pub const JAMENDO_ALIAS: &str = "jamendo";

/// File name of the catalogue cache inside the data directory
pub const JAMENDO_FILENAME: &str = "jamendo.db";

/// Bootstrap script of the catalogue cache
pub const JAMENDO_SCRIPT: &str = "jamendo";

/// Path naming a private in-memory database
pub const IN_MEMORY_PATH: &str = ":memory:";

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

/// A handle cached by one thread for one [`Database`]
struct CachedHandle {
    generation: u64,
    /// Cleared when the owning `Database` is dropped
    alive: Arc<AtomicBool>,
    conn: Rc<DatabaseConn>,
}

thread_local! {
    /// Handles of the current thread, keyed by database id
    static CONNECTIONS: RefCell<HashMap<u64, CachedHandle>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Default)]
struct MigrationState {
    done: bool,
    startup_version: Option<u32>,
    outcome: Option<MigrationOutcome>,
}

/// The music library database
///
/// `Database` is `Send + Sync`; share it behind an `Arc` and call
/// [`connect`](Database::connect) from each worker thread.
pub struct Database {
    id: u64,
    config: SongbaseConfig,
    injected: Option<PathBuf>,
    schemas: Arc<dyn SchemaSource>,
    tasks: Arc<dyn TaskManager>,
    errors: Arc<dyn ErrorSink>,
    attachments: AttachedDatabaseRegistry,
    generation: AtomicU64,
    migration: Mutex<MigrationState>,
    fatal: OnceLock<String>,
    alive: Arc<AtomicBool>,
}

impl Database {
    /// Library in `config.data_dir` with the catalogue cache satellite declared
    pub fn new(config: SongbaseConfig) -> Self {
        let db = Self::empty(config);
        let filename = db.config.data_path().join(JAMENDO_FILENAME);
        if let Err(e) = db
            .attachments
            .declare(JAMENDO_ALIAS, filename, JAMENDO_SCRIPT)
        {
            warn!("{}", e);
        }
        db
    }

    /// Library without any satellite
    pub fn empty(config: SongbaseConfig) -> Self {
        Self {
            id: NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            injected: None,
            schemas: Arc::new(EmbeddedSchemas),
            tasks: Arc::new(LogTaskManager::new()),
            errors: Arc::new(LogErrorSink),
            attachments: AttachedDatabaseRegistry::new(),
            generation: AtomicU64::new(0),
            migration: Mutex::new(MigrationState::default()),
            fatal: OnceLock::new(),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_task_manager(mut self, tasks: Arc<dyn TaskManager>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_schemas(mut self, schemas: Arc<dyn SchemaSource>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Use `path` for the main database and every satellite
    ///
    /// [`IN_MEMORY_PATH`] gives every handle and every satellite its own
    /// private in-memory database.
    pub fn with_injected_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.injected = Some(path.into());
        self
    }

    pub fn config(&self) -> &SongbaseConfig {
        &self.config
    }

    /// Path of the main database file
    pub fn path(&self) -> PathBuf {
        self.injected
            .clone()
            .unwrap_or_else(|| self.config.sqlite_path())
    }

    fn in_memory(&self) -> bool {
        self.injected
            .as_deref()
            .is_some_and(|p| p == Path::new(IN_MEMORY_PATH))
    }

    /// Declare a satellite attached to every connection opened from now on
    ///
    /// Handles cached before the call are reopened on their next use.
    pub fn declare_attachment(
        &self,
        alias: &str,
        filename: impl Into<PathBuf>,
        script: &str,
    ) -> Result<AttachedDatabase> {
        let entry = self.attachments.declare(alias, filename, script)?;
        self.invalidate();
        Ok(entry)
    }

    pub fn attachments(&self) -> Vec<AttachedDatabase> {
        self.attachments.all()
    }

    /// Handle for the calling thread
    ///
    /// Opens, attaches and, on the first call of this `Database`, migrates.
    /// After a failed migration or satellite bootstrap every call fails.
    pub fn connect(&self) -> Result<Rc<DatabaseConn>> {
        if let Some(cause) = self.fatal.get() {
            return Err(anyhow!(
                "Database unusable after a failed schema update: {}",
                cause
            ));
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let cached = CONNECTIONS.with(|c| {
            let mut handles = c.borrow_mut();
            // Close what this thread still holds for dropped databases
            handles.retain(|_, h| h.alive.load(Ordering::Acquire));
            handles
                .get(&self.id)
                .filter(|h| h.generation == generation)
                .map(|h| h.conn.clone())
        });
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self.open_connection().map_err(|e| {
            self.errors.add_error(&format!("Database: {}", e));
            e
        })?;

        let conn = Rc::new(conn);
        CONNECTIONS.with(|c| {
            c.borrow_mut().insert(
                self.id,
                CachedHandle {
                    generation,
                    alive: self.alive.clone(),
                    conn: conn.clone(),
                },
            );
        });
        Ok(conn)
    }

    fn open_connection(&self) -> Result<DatabaseConn> {
        if self.injected.is_none() {
            let dir = self.config.data_path();
            std::fs::create_dir_all(&dir).map_err(|e| {
                anyhow!(
                    "Failed to create data directory '{}': {}",
                    dir.display(),
                    e
                )
            })?;
        }

        let path = self.path();
        debug!("Opening library database at {}", path.display());
        let db = DatabaseConn::open_with_timeout(Some(&path), self.config.busy_timeout())?;

        for failure in self
            .attachments
            .attach_all(&db.conn, self.injected.as_deref())
        {
            self.errors.add_error(&format!("Database: {}", failure.message));
        }

        self.prepare_schema(&db)?;
        Ok(db)
    }

    /// Migrate the main schema once, then bootstrap empty satellites
    fn prepare_schema(&self, db: &DatabaseConn) -> Result<()> {
        let mut state = self
            .migration
            .lock()
            .map_err(|_| anyhow!("Schema migration lock poisoned"))?;

        // A private in-memory database starts empty on every handle
        if !state.done || self.in_memory() {
            let migrator =
                SchemaMigrator::new(&db.conn, self.schemas.as_ref()).with_tasks(self.tasks.as_ref());

            let startup = read_version(&db.conn).map_err(|e| self.poison(e))?;
            let outcome = migrator.migrate().map_err(|e| self.poison(e))?;

            if !state.done {
                state.startup_version = startup;
            }
            state.outcome = Some(outcome);
            state.done = true;
        }

        let bootstrapped = self
            .attachments
            .bootstrap_empty(&db.conn, self.schemas.as_ref())
            .map_err(|e| self.poison(e))?;
        if !bootstrapped.is_empty() {
            info!("Bootstrapped attached databases: {}", bootstrapped.join(", "));
        }

        Ok(())
    }

    fn poison(&self, e: anyhow::Error) -> anyhow::Error {
        error!("Unable to update music library database: {}", e);
        let _ = self.fatal.set(e.to_string());
        e
    }

    /// Whether a failed schema update made this database unusable
    pub fn is_poisoned(&self) -> bool {
        self.fatal.get().is_some()
    }

    /// Schema version found on disk by the first migration, `None` for a new file
    pub fn startup_schema_version(&self) -> Option<u32> {
        self.migration.lock().ok()?.startup_version
    }

    /// Outcome of the most recent migration run, if any ran yet
    pub fn migration_outcome(&self) -> Option<MigrationOutcome> {
        self.migration.lock().ok()?.outcome
    }

    /// Schema status of the main database without migrating it
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let target = self.schemas.target_version();
        if self.in_memory() {
            let conn = self.connect()?;
            return Ok(SchemaStatus::from_versions(read_version(&conn.conn)?, target));
        }

        let path = self.path();
        if !path.exists() {
            return Ok(SchemaStatus::NotInitialized);
        }
        let conn = DatabaseConn::open_raw_existing(&path)?;
        Ok(SchemaStatus::from_versions(read_version(&conn)?, target))
    }

    /// Detach `alias`, delete its file and make every thread reopen
    ///
    /// The next [`connect`](Database::connect) on any thread attaches a fresh
    /// file and runs the satellite's bootstrap script.
    pub fn reattach(&self, alias: &str) -> Result<()> {
        let entry = self
            .attachments
            .get(alias)
            .ok_or_else(|| anyhow!("No attached database named '{}'", alias))?;

        let cached = CONNECTIONS.with(|c| c.borrow_mut().remove(&self.id));
        if let Some(handle) = cached {
            if let Err(e) = detach_one(&handle.conn.conn, &entry.alias) {
                warn!("{}", e);
            }
        }

        remove_database_file(&entry.filename)?;
        self.invalidate();
        info!("Reattaching '{}' on next use", entry.alias);
        Ok(())
    }

    /// Drop every thread's cached handle; each reopens on its next use
    pub fn close_all(&self) {
        CONNECTIONS.with(|c| c.borrow_mut().remove(&self.id));
        self.invalidate();
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Check the main database and report problems to the error sink
    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        let conn = self.connect()?;
        Ok(IntegrityChecker::new(self.tasks.as_ref(), self.errors.as_ref())
            .with_max_errors(self.config.integrity_max_errors)
            .check(&conn.conn))
    }

    /// Check the main database, then copy it to `<path>.bak`
    pub fn backup(&self) -> BackupOutcome {
        self.run_backup(None)
    }

    /// Like [`backup`](Database::backup), stopping between increments once `cancel` is raised
    pub fn backup_cancellable(&self, cancel: Arc<AtomicBool>) -> BackupOutcome {
        self.run_backup(Some(cancel))
    }

    fn run_backup(&self, cancel: Option<Arc<AtomicBool>>) -> BackupOutcome {
        if self.in_memory() {
            return BackupOutcome::Failed {
                message: "Cannot back up an in-memory database".to_string(),
            };
        }

        let conn = match self.connect() {
            Ok(conn) => conn,
            Err(e) => {
                return BackupOutcome::Failed {
                    message: e.to_string(),
                }
            }
        };

        let mut engine = BackupEngine::new(self.tasks.as_ref(), self.errors.as_ref())
            .with_step_pages(self.config.backup_step_pages)
            .with_max_errors(self.config.integrity_max_errors);
        if let Some(flag) = cancel {
            engine = engine.with_cancel_flag(flag);
        }
        engine.backup_to(&conn.conn, &self.path())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Other threads close their handles on their next connect
        self.alive.store(false, Ordering::Release);
        let _ = CONNECTIONS.try_with(|c| c.borrow_mut().remove(&self.id));
    }
}

/// Delete a database file together with its journal files
fn remove_database_file(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm", "-journal"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        match std::fs::remove_file(PathBuf::from(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow!(
                    "Failed to delete database file '{}{}': {}",
                    path.display(),
                    suffix,
                    e
                ))
            }
        }
    }
    Ok(())
}
