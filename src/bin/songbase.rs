use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use songbase::database::Database;
use songbase::SongbaseConfig;
use tracing::Level;

mod commands;

use commands::{maintenance, status, tokenize, ProgressTaskManager, StderrErrorSink};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.songbase/songbase.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long)]
    debug: bool,

    /// Library database file, overriding the configured data directory
    #[clap(long, value_name = "PATH")]
    db: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show paths, schema version and attached databases without modifying anything
    Status {
        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Create or upgrade the library schema
    Migrate,

    /// Run the integrity check on the library database
    Check,

    /// Back up the library database to <database>.bak
    Backup,

    /// Delete an attached database and bootstrap it again
    Recreate {
        /// Alias of the attached database, e.g. jamendo
        alias: String,
    },

    /// Show how the full-text tokenizer splits a text
    Tokenize {
        /// Text to tokenize
        text: String,

        /// Output as JSON
        #[clap(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt()
            // filter spans/events with level DEBUG or higher.
            .with_max_level(Level::DEBUG)
            .init();
    }

    let mut config = match SongbaseConfig::new(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Some(path) = &cli.db {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            config.data_dir = parent.to_string_lossy().to_string();
        } else {
            config.data_dir = ".".to_string();
        }
        if let Some(name) = path.file_name() {
            config.database_filename = name.to_string_lossy().to_string();
        }
    }

    let db = Database::new(config)
        .with_task_manager(Arc::new(ProgressTaskManager::new()))
        .with_error_sink(Arc::new(StderrErrorSink));

    let success = match cli.command {
        Commands::Status { json } => {
            let config_file = cli
                .config
                .clone()
                .unwrap_or_else(SongbaseConfig::config_file_path);
            status::run(&db, &config_file, json)
        }
        Commands::Migrate => maintenance::run_migrate(&db),
        Commands::Check => maintenance::run_check(&db),
        Commands::Backup => maintenance::run_backup(&db),
        Commands::Recreate { alias } => maintenance::run_recreate(&db, &alias),
        Commands::Tokenize { text, json } => tokenize::run(&text, json),
    };

    if !success {
        std::process::exit(1);
    }
}
