//! Online backup of the library database
//!
//! The copy runs page by page through the engine's backup API on two
//! dedicated handles, so writers on pooled connections keep working while
//! it progresses.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::integrity::IntegrityChecker;
use crate::config::{DEFAULT_BACKUP_STEP_PAGES, DEFAULT_INTEGRITY_MAX_ERRORS};
use crate::tasks::{ErrorSink, TaskGuard, TaskManager};

/// First engine release shipping the online-backup API (3.6.11)
const BACKUP_API_MIN_VERSION: i32 = 3_006_011;

/// Pause before retrying a step that hit a lock held by another handle
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(25);

static BACKUP_SUPPORTED: OnceLock<bool> = OnceLock::new();

/// Whether the linked engine provides the online-backup API
///
/// Detected once per process.
pub fn backup_supported() -> bool {
    *BACKUP_SUPPORTED.get_or_init(|| {
        let version = rusqlite::version_number();
        let supported = version >= BACKUP_API_MIN_VERSION;
        if !supported {
            warn!(
                "SQLite {} has no online backup API; backups are disabled",
                rusqlite::version()
            );
        }
        supported
    })
}

/// Destination of a backup of `source`: `<source>.bak`
pub fn backup_path_for(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Result of one backup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BackupOutcome {
    /// Every page was copied
    Completed { destination: PathBuf, pages: u64 },

    /// The integrity check failed; nothing was written
    Corrupt { problems: Vec<String> },

    /// The linked engine has no backup API
    Unsupported,

    /// The cancel flag was raised between two increments
    Cancelled { copied: u64, total: u64 },

    /// Opening either side or copying failed; pages already written stay
    Failed { message: String },
}

impl BackupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BackupOutcome::Completed { .. })
    }
}

/// Page-stepped hot backup gated by an integrity check
pub struct BackupEngine<'a> {
    tasks: &'a dyn TaskManager,
    errors: &'a dyn ErrorSink,
    step_pages: i32,
    max_errors: u32,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a> BackupEngine<'a> {
    pub fn new(tasks: &'a dyn TaskManager, errors: &'a dyn ErrorSink) -> Self {
        Self {
            tasks,
            errors,
            step_pages: DEFAULT_BACKUP_STEP_PAGES,
            max_errors: DEFAULT_INTEGRITY_MAX_ERRORS,
            cancel: None,
        }
    }

    /// Pages copied per increment
    pub fn with_step_pages(mut self, step_pages: i32) -> Self {
        self.step_pages = step_pages.max(1);
        self
    }

    /// Problem cap of the integrity check run before copying
    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Stop between increments once `flag` is raised
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Check `live`, then copy the database file at `source` to `<source>.bak`
    pub fn backup_to(&self, live: &Connection, source: &Path) -> BackupOutcome {
        if !backup_supported() {
            return BackupOutcome::Unsupported;
        }

        let report = IntegrityChecker::new(self.tasks, self.errors)
            .with_max_errors(self.max_errors)
            .check(live);
        if !report.is_ok() {
            warn!("Not backing up a database that failed its integrity check");
            return BackupOutcome::Corrupt {
                problems: report.problems,
            };
        }

        self.copy(source)
    }

    /// Copy without the integrity gate
    ///
    /// Both handles are closed and the task is finished on every return path.
    pub fn copy(&self, source: &Path) -> BackupOutcome {
        if !backup_supported() {
            return BackupOutcome::Unsupported;
        }

        debug!("Starting database backup");
        let destination = backup_path_for(source);
        let task = TaskGuard::start(self.tasks, "Backing up database");

        // No create flag: a missing source must not leave an empty file behind
        let src = match Connection::open_with_flags(
            source,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ) {
            Ok(conn) => conn,
            Err(e) => return self.fail(format!("Failed to open {}: {}", source.display(), e)),
        };

        let mut dst = match Connection::open(&destination) {
            Ok(conn) => conn,
            Err(e) => {
                return self.fail(format!("Failed to open {}: {}", destination.display(), e))
            }
        };

        let backup = match Backup::new(&src, &mut dst) {
            Ok(backup) => backup,
            Err(e) => return self.fail(format!("Failed to start database backup: {}", e)),
        };

        loop {
            if let Some(flag) = &self.cancel {
                if flag.load(Ordering::Relaxed) {
                    let p = backup.progress();
                    let total = p.pagecount.max(0) as u64;
                    let copied = (p.pagecount - p.remaining).max(0) as u64;
                    info!("Database backup cancelled at {}/{} pages", copied, total);
                    return BackupOutcome::Cancelled { copied, total };
                }
            }

            let result = backup.step(self.step_pages);

            let p = backup.progress();
            let total = p.pagecount.max(0) as u64;
            let copied = (p.pagecount - p.remaining).max(0) as u64;

            match result {
                Ok(StepResult::More) => task.progress(copied, total),
                Ok(StepResult::Done) => {
                    task.progress(copied, total);
                    info!(
                        "Backed up {} pages to {}",
                        total,
                        destination.display()
                    );
                    return BackupOutcome::Completed {
                        destination,
                        pages: total,
                    };
                }
                Ok(StepResult::Busy) | Ok(StepResult::Locked) => {
                    std::thread::sleep(BUSY_RETRY_DELAY);
                }
                Ok(other) => {
                    return self.fail(format!("Database backup failed: {:?}", other));
                }
                Err(e) => return self.fail(format!("Database backup failed: {}", e)),
            }
        }
    }

    fn fail(&self, message: String) -> BackupOutcome {
        error!("{}", message);
        BackupOutcome::Failed { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::integrity::tests::{corrupt, populate};
    use crate::tasks::{CollectingErrorSink, RecordingTaskManager};

    #[test]
    fn test_backup_path_for() {
        assert_eq!(
            backup_path_for(Path::new("/data/songbase.db")),
            PathBuf::from("/data/songbase.db.bak")
        );
    }

    #[test]
    fn test_capability_detected() {
        assert!(backup_supported());
    }

    #[test]
    fn test_backup_healthy_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        populate(&path);
        let source_pages: u64 = Connection::open(&path)
            .unwrap()
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap();

        let tasks = RecordingTaskManager::new();
        let sink = CollectingErrorSink::new();
        let live = Connection::open(&path).unwrap();
        let outcome = BackupEngine::new(tasks.as_ref(), sink.as_ref())
            .with_step_pages(4)
            .backup_to(&live, &path);

        assert_eq!(
            outcome,
            BackupOutcome::Completed {
                destination: dir.path().join("library.db.bak"),
                pages: source_pages
            }
        );

        let progress = tasks.progress_of("Backing up database");
        assert!(progress.len() > 1);
        let (last_copied, last_total) = *progress.last().unwrap();
        assert_eq!(last_total, source_pages);
        assert_eq!(last_copied, last_total);
        assert_eq!(progress.iter().filter(|(c, t)| c == t).count(), 1);

        let backup = Connection::open(dir.path().join("library.db.bak")).unwrap();
        let rows: i64 = backup
            .query_row("SELECT COUNT(*) FROM songs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 400);
        let backup_pages: u64 = backup
            .query_row("PRAGMA page_count", [], |row| row.get(0))
            .unwrap();
        assert_eq!(backup_pages, source_pages);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_backup_refuses_corrupt_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        let page_size = populate(&path);
        corrupt(&path, page_size);

        let tasks = RecordingTaskManager::new();
        let sink = CollectingErrorSink::new();
        let live = Connection::open(&path).unwrap();
        let outcome = BackupEngine::new(tasks.as_ref(), sink.as_ref()).backup_to(&live, &path);

        assert!(matches!(outcome, BackupOutcome::Corrupt { .. }));
        assert!(!dir.path().join("library.db.bak").exists());
        assert!(tasks.progress_of("Backing up database").is_empty());
        assert!(!sink.is_empty());
    }

    #[test]
    fn test_missing_source_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");

        let tasks = RecordingTaskManager::new();
        let sink = CollectingErrorSink::new();
        let outcome = BackupEngine::new(tasks.as_ref(), sink.as_ref()).copy(&path);

        assert!(matches!(outcome, BackupOutcome::Failed { .. }));
        assert!(!path.exists());
        assert!(!dir.path().join("absent.db.bak").exists());
    }

    #[test]
    fn test_cancelled_before_first_increment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        populate(&path);

        let tasks = RecordingTaskManager::new();
        let sink = CollectingErrorSink::new();
        let flag = Arc::new(AtomicBool::new(true));
        let outcome = BackupEngine::new(tasks.as_ref(), sink.as_ref())
            .with_cancel_flag(flag)
            .copy(&path);

        assert!(matches!(outcome, BackupOutcome::Cancelled { copied: 0, .. }));
        assert!(tasks.progress_of("Backing up database").is_empty());
    }
}
