//! Database consistency check

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error};

use crate::config::DEFAULT_INTEGRITY_MAX_ERRORS;
use crate::tasks::{ErrorSink, TaskGuard, TaskManager};

/// Message surfaced once when a check finds problems
pub const CORRUPTION_GUIDANCE: &str = "Database corruption detected. Please read \
https://github.com/clementine-player/Clementine/wiki/Database-Corruption \
for instructions on how to recover your database";

/// Outcome of one integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Problems reported by the engine, capped at the checker's limit
    pub problems: Vec<String>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Runs the engine's `integrity_check` pragma and reports its findings
pub struct IntegrityChecker<'a> {
    tasks: &'a dyn TaskManager,
    errors: &'a dyn ErrorSink,
    max_errors: u32,
}

impl<'a> IntegrityChecker<'a> {
    pub fn new(tasks: &'a dyn TaskManager, errors: &'a dyn ErrorSink) -> Self {
        Self {
            tasks,
            errors,
            max_errors: DEFAULT_INTEGRITY_MAX_ERRORS,
        }
    }

    pub fn with_max_errors(mut self, max_errors: u32) -> Self {
        self.max_errors = max_errors.max(1);
        self
    }

    /// Check the main database of `conn`
    ///
    /// Clean only if the engine returns the single `ok` row. A failing query
    /// counts as a problem.
    pub fn check(&self, conn: &Connection) -> IntegrityReport {
        debug!("Starting database integrity check");
        let _task = TaskGuard::start(self.tasks, "Integrity check");

        let mut report = IntegrityReport::default();
        let messages = self.run(conn);

        match messages {
            Ok(messages) => {
                for message in messages {
                    // A clean database yields a single "ok" row
                    if message == "ok" && report.problems.is_empty() {
                        break;
                    }
                    self.report(&mut report, message);
                }
            }
            Err(e) => self.report(&mut report, e.to_string()),
        }

        report
    }

    fn run(&self, conn: &Connection) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA integrity_check({})", self.max_errors))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect()
    }

    fn report(&self, report: &mut IntegrityReport, message: String) {
        if report.problems.is_empty() {
            self.errors.add_error(CORRUPTION_GUIDANCE);
        }
        error!("Integrity check: {}", message);
        self.errors.add_error(&format!("Database: {}", message));
        report.problems.push(message);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tasks::{CollectingErrorSink, RecordingTaskManager, TaskEvent};
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;

    /// Build a multi-page database at `path` and return its page size
    pub(crate) fn populate(path: &Path) -> u64 {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE songs (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
             CREATE INDEX idx_songs_title ON songs (title);",
        )
        .unwrap();
        for i in 0..400 {
            conn.execute(
                "INSERT INTO songs (title) VALUES (?1)",
                [format!("{:04} {}", i, "x".repeat(200))],
            )
            .unwrap();
        }
        conn.query_row("PRAGMA page_size", [], |row| row.get(0))
            .unwrap()
    }

    /// Overwrite page 3 of the file at `path` with garbage
    pub(crate) fn corrupt(path: &Path, page_size: u64) {
        let mut file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.seek(SeekFrom::Start(2 * page_size)).unwrap();
        file.write_all(&vec![0xFF; page_size as usize]).unwrap();
    }

    #[test]
    fn test_clean_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.db");
        populate(&path);

        let tasks = RecordingTaskManager::new();
        let sink = CollectingErrorSink::new();
        let conn = Connection::open(&path).unwrap();
        let report = IntegrityChecker::new(tasks.as_ref(), sink.as_ref()).check(&conn);

        assert!(report.is_ok());
        assert!(sink.is_empty());
        assert_eq!(
            tasks.events(),
            vec![
                TaskEvent::Started {
                    id: 1,
                    label: "Integrity check".to_string()
                },
                TaskEvent::Finished { id: 1 },
            ]
        );
    }

    #[test]
    fn test_corrupted_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.db");
        let page_size = populate(&path);
        corrupt(&path, page_size);

        let tasks = RecordingTaskManager::new();
        let sink = CollectingErrorSink::new();
        let conn = Connection::open(&path).unwrap();
        let report = IntegrityChecker::new(tasks.as_ref(), sink.as_ref())
            .with_max_errors(3)
            .check(&conn);

        assert!(!report.is_ok());
        assert!(report.problems.len() <= 3);

        let messages = sink.messages();
        assert_eq!(messages[0], CORRUPTION_GUIDANCE);
        assert_eq!(
            messages.iter().filter(|m| *m == CORRUPTION_GUIDANCE).count(),
            1
        );
        assert_eq!(messages.len(), report.problems.len() + 1);
        assert!(messages[1..].iter().all(|m| m.starts_with("Database: ")));
        assert!(matches!(
            tasks.events().last(),
            Some(TaskEvent::Finished { id: 1 })
        ));
    }
}
