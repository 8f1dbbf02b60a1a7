use songbase::database::{BackupOutcome, Database, MigrationOutcome};

pub fn run_migrate(db: &Database) -> bool {
    if let Err(e) = db.connect() {
        eprintln!("Migration failed: {}", e);
        return false;
    }

    match db.migration_outcome() {
        Some(MigrationOutcome::Created { version }) => {
            println!("Created library schema at version {}", version)
        }
        Some(MigrationOutcome::Upgraded { from, to }) => {
            println!("Upgraded library schema from version {} to {}", from, to)
        }
        Some(MigrationOutcome::Current { version }) => {
            println!("Library schema is up to date (version {})", version)
        }
        Some(MigrationOutcome::NewerThanExpected {
            database_version,
            target_version,
        }) => println!(
            "Library schema version {} is newer than this release supports ({}); left untouched",
            database_version, target_version
        ),
        None => println!("No migration ran"),
    }
    true
}

pub fn run_check(db: &Database) -> bool {
    match db.check_integrity() {
        Ok(report) if report.is_ok() => {
            println!("ok");
            true
        }
        Ok(report) => {
            println!("{} problem(s) found", report.problems.len());
            false
        }
        Err(e) => {
            eprintln!("Integrity check failed: {}", e);
            false
        }
    }
}

pub fn run_backup(db: &Database) -> bool {
    match db.backup() {
        BackupOutcome::Completed { destination, pages } => {
            println!("Backed up {} pages to {}", pages, destination.display());
            true
        }
        BackupOutcome::Corrupt { problems } => {
            eprintln!(
                "Backup skipped: the database failed its integrity check ({} problem(s))",
                problems.len()
            );
            false
        }
        BackupOutcome::Unsupported => {
            eprintln!("Backup skipped: the linked SQLite has no online backup API");
            false
        }
        BackupOutcome::Cancelled { copied, total } => {
            eprintln!("Backup cancelled after {}/{} pages", copied, total);
            false
        }
        BackupOutcome::Failed { message } => {
            eprintln!("Backup failed: {}", message);
            false
        }
    }
}

pub fn run_recreate(db: &Database, alias: &str) -> bool {
    if let Err(e) = db.reattach(alias) {
        eprintln!("{}", e);
        return false;
    }

    match db.connect().and_then(|conn| conn.tables(alias)) {
        Ok(tables) => {
            println!("Recreated '{}' ({} tables)", alias, tables.len());
            true
        }
        Err(e) => {
            eprintln!("Failed to recreate '{}': {}", alias, e);
            false
        }
    }
}
