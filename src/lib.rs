#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Songbase - embedded storage core for a music library
//!
//! Songbase keeps a music library in SQLite. It can be used as both a
//! command-line application and a library.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | (none) | Library: connections, migration, tokenizer, backup | `rusqlite`, `url`, `unicode-normalization` |
//! | `cli` | The `songbase` binary | `clap`, `indicatif`, `tracing-subscriber` |
//!
//! ```toml
//! # Library only
//! songbase = { version = "0.1", default-features = false }
//! ```
//!
//! # Architecture
//!
//! - **[`database`]**: All database functionality
//!   - `core`: SQLite handles, versioned schema scripts, attached satellites
//!   - `tokenizer`: Unicode-aware FTS3 tokenizer
//!   - `integrity`, `backup`: Consistency check and hot backup
//!   - `library`: [`Database`], the per-thread connection manager
//!
//! - **[`tasks`]**: Progress and error-reporting collaborators
//!
//! - **[`config`]**: Configuration management
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use songbase::{Database, SongbaseConfig};
//!
//! let config = SongbaseConfig::new(&None)?;
//! let db = Database::new(config);
//!
//! let conn = db.connect()?;
//! let hits: i64 = conn.conn.query_row(
//!     "SELECT COUNT(*) FROM songs_fts WHERE songs_fts MATCH 'motorhead'",
//!     [],
//!     |row| row.get(0),
//! )?;
//!
//! if db.check_integrity()?.is_ok() {
//!     db.backup();
//! }
//! ```

pub mod config;
pub mod database;
pub mod tasks;

// =============================================================================
// Configuration
// =============================================================================

pub use config::SongbaseConfig;

// =============================================================================
// Database Module - Re-export commonly used types
// =============================================================================

pub use database::{
    BackupOutcome, Database, DatabaseConn, IntegrityReport, MigrationOutcome, SchemaStatus,
};

// =============================================================================
// Collaborators
// =============================================================================

pub use tasks::{ErrorSink, TaskGuard, TaskId, TaskManager};
