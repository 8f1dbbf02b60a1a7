//! Database module
//!
//! This module provides all storage functionality for songbase, organized into:
//!
//! - **core**: Engine handles, versioned schema migration, satellite attachment
//! - **tokenizer**: The unicode FTS3 tokenizer and its engine registration
//! - **integrity** / **backup**: Consistency check and online hot backup
//! - **library**: [`Database`], handing out per-thread connections
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/           # Foundation
//! │   ├── connection  # SQLite DatabaseConn wrapper
//! │   ├── schema      # Versioned scripts and SchemaMigrator
//! │   └── attach      # AttachedDatabaseRegistry
//! │
//! ├── schema/         # Embedded SQL scripts (schema.sql, schema-N.sql, satellites)
//! ├── tokenizer/      # UnicodeTokenizer + C tokenizer module
//! ├── integrity       # PRAGMA integrity_check gate
//! ├── backup          # Page-stepped online backup
//! └── library         # Database: per-thread handles, migration guard, reattach
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use songbase::database::Database;
//! use songbase::SongbaseConfig;
//!
//! let db = Database::new(SongbaseConfig::with_data_dir("~/.songbase"));
//!
//! // Every worker thread gets its own handle
//! let conn = db.connect()?;
//! conn.execute("INSERT INTO songs (title, filename) VALUES ('x', 'file:///x.mp3')")?;
//!
//! // Force every thread to reopen a fresh catalogue cache
//! db.reattach("jamendo")?;
//!
//! // Integrity-gated hot backup to <db>.bak
//! let outcome = db.backup();
//! ```

pub mod backup;
pub mod core;
pub mod integrity;
pub mod library;
pub mod tokenizer;

// Core types
pub use core::{
    AttachFailure, AttachedDatabase, AttachedDatabaseRegistry, DatabaseConn, EmbeddedSchemas,
    InlineSchemas, MigrationOutcome, SchemaMigrator, SchemaSource, SchemaStatus,
};

// Maintenance
pub use backup::{backup_path_for, backup_supported, BackupEngine, BackupOutcome};
pub use integrity::{IntegrityChecker, IntegrityReport, CORRUPTION_GUIDANCE};

// Connection manager
pub use library::{Database, IN_MEMORY_PATH, JAMENDO_ALIAS, JAMENDO_FILENAME, JAMENDO_SCRIPT};

// Full-text search
pub use tokenizer::{FtsTokenizer, Token, UnicodeTokenizer, UNICODE_TOKENIZER_NAME};
