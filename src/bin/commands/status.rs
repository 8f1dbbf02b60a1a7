use serde::Serialize;
use songbase::database::{backup_supported, AttachedDatabase, Database, EmbeddedSchemas};
use songbase::SchemaStatus;

#[derive(Debug, Serialize)]
struct LibraryStatus {
    config_file: String,
    #[serde(skip)]
    settings: String,
    database: String,
    exists: bool,
    schema: Option<SchemaStatus>,
    target_version: u32,
    backup: String,
    backup_present: bool,
    backup_supported: bool,
    sqlite_version: String,
    attachments: Vec<AttachedDatabase>,
}

pub fn run(db: &Database, config_file: &str, json: bool) -> bool {
    let path = db.path();
    let schema = match db.schema_status() {
        Ok(status) => Some(status),
        Err(e) => {
            eprintln!("Error reading schema version: {}", e);
            None
        }
    };
    let backup = db.config().backup_path();

    let status = LibraryStatus {
        config_file: config_file.to_string(),
        settings: db.config().summary(),
        database: path.to_string_lossy().to_string(),
        exists: path.exists(),
        schema,
        target_version: EmbeddedSchemas::TARGET_VERSION,
        backup: backup.to_string_lossy().to_string(),
        backup_present: backup.exists(),
        backup_supported: backup_supported(),
        sqlite_version: rusqlite::version().to_string(),
        attachments: db.attachments(),
    };

    if json {
        match serde_json::to_string_pretty(&status) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing status: {}", e);
                return false;
            }
        }
    } else {
        print_status(&status);
    }

    status.schema.is_some()
}

fn print_status(status: &LibraryStatus) {
    println!("Songbase Library Status");
    println!("=======================\n");

    println!("Configuration:");
    println!("  Config File:        {}", status.config_file);
    for line in status.settings.lines() {
        println!("  {}", line);
    }
    println!();

    println!("Library Database:");
    println!("  Path:           {}", status.database);
    println!(
        "  Status:         {}",
        if status.exists { "exists" } else { "not created" }
    );
    let schema = match &status.schema {
        None => "unknown".to_string(),
        Some(SchemaStatus::NotInitialized) => "not initialized".to_string(),
        Some(SchemaStatus::Current) => format!("current (v{})", status.target_version),
        Some(SchemaStatus::NeedsMigration { from, to }) => {
            format!("v{} (run: songbase migrate to reach v{})", from, to)
        }
        Some(SchemaStatus::Incompatible {
            database_version,
            required_version,
        }) => format!(
            "v{} is newer than this release (v{})",
            database_version, required_version
        ),
    };
    println!("  Schema:         {}", schema);
    println!("  SQLite:         {}", status.sqlite_version);

    println!();
    println!("Attached Databases:");
    for entry in &status.attachments {
        println!(
            "  {:15} {} (bootstrap: {})",
            format!("{}:", entry.alias),
            entry.filename.display(),
            entry.script
        );
    }

    println!();
    println!("Backup:");
    println!("  Path:           {}", status.backup);
    println!(
        "  Status:         {}",
        if status.backup_present {
            "present"
        } else {
            "none"
        }
    );
    if !status.backup_supported {
        println!("  Note:           the linked SQLite has no online backup API");
    }
}
