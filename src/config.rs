use anyhow::{anyhow, Result};
use config::Config;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default name of the main library database file
pub const DEFAULT_DATABASE_FILENAME: &str = "songbase.db";

/// Default number of pages copied per backup increment
pub const DEFAULT_BACKUP_STEP_PAGES: i32 = 16;

/// Default cap on problems reported by the integrity check
pub const DEFAULT_INTEGRITY_MAX_ERRORS: u32 = 10;

/// Default time a handle waits on a locked database before failing
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, Serialize)]
pub struct SongbaseConfig {
    /// Path to the directory holding the library database and its satellites
    pub data_dir: String,

    /// File name of the main library database inside `data_dir`
    pub database_filename: String,

    /// Pages copied per backup increment (default: 16)
    pub backup_step_pages: i32,

    /// Maximum number of problems the integrity check reports (default: 10)
    pub integrity_max_errors: u32,

    /// Busy timeout applied to every handle in milliseconds (default: 5000)
    pub busy_timeout_ms: u64,
}

const EMPTY_CONFIG: &str = r#"### songbase configuration file

### directory holding the library database and attached satellite databases
# data_dir = "~/.songbase"

### file name of the main library database
# database_filename = "songbase.db"

### backup and integrity settings
# backup_step_pages = 16           # pages copied per backup increment
# integrity_max_errors = 10        # problems reported by the integrity check
# busy_timeout_ms = 5000           # wait on a locked database before failing
"#;

impl Default for SongbaseConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self::with_data_dir(format!("{}/.songbase", home_dir))
    }
}

impl SongbaseConfig {
    /// Function to create and initialize a new configuration
    pub fn new(path: &Option<String>) -> Result<SongbaseConfig> {
        let mut builder = Config::builder();

        // By default use $HOME/.songbase/songbase.toml as the configuration file path
        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .to_str()
            .ok_or_else(|| anyhow!("Could not convert home directory path to string"))?
            .to_owned();

        let songbase_dir = format!("{}/.songbase", home_dir.as_str());

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                std::fs::create_dir_all(songbase_dir.as_str())
                    .map_err(|e| anyhow!("Unable to create songbase directory: {}", e))?;
                let p = format!("{}/songbase.toml", songbase_dir.as_str());
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG).map_err(|e| {
                        anyhow!("Unable to create config file {}: {}", p.as_str(), e)
                    })?;
                }
            }
        }

        // E.g., `SONGBASE_DATA_DIR=/srv/music ./songbase status` overrides the data directory
        builder = builder.add_source(config::Environment::with_prefix("SONGBASE"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let config = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        Ok(Self::from_map(&config, &songbase_dir))
    }

    /// Build a configuration rooted at `data_dir` with every other setting at its default
    pub fn with_data_dir(data_dir: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            backup_step_pages: DEFAULT_BACKUP_STEP_PAGES,
            integrity_max_errors: DEFAULT_INTEGRITY_MAX_ERRORS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    fn from_map(config: &HashMap<String, String>, default_dir: &str) -> Self {
        let data_dir = config
            .get("data_dir")
            .map(|p| expand_home(p))
            .unwrap_or_else(|| default_dir.to_string());

        let mut cfg = Self::with_data_dir(data_dir);

        if let Some(name) = config.get("database_filename").filter(|s| !s.is_empty()) {
            cfg.database_filename = name.clone();
        }

        // Unparseable or non-positive values keep their defaults
        cfg.backup_step_pages = config
            .get("backup_step_pages")
            .and_then(|s| s.parse().ok())
            .filter(|v: &i32| *v > 0)
            .unwrap_or(DEFAULT_BACKUP_STEP_PAGES);

        cfg.integrity_max_errors = config
            .get("integrity_max_errors")
            .and_then(|s| s.parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(DEFAULT_INTEGRITY_MAX_ERRORS);

        cfg.busy_timeout_ms = config
            .get("busy_timeout_ms")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);

        cfg
    }

    /// Directory holding the library database
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(self.data_dir.trim_end_matches('/'))
    }

    /// Get the path to the main SQLite database file
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_path().join(&self.database_filename)
    }

    /// Get the path the hot backup writes to: `<sqlite_path>.bak`
    pub fn backup_path(&self) -> PathBuf {
        crate::database::backup_path_for(&self.sqlite_path())
    }

    /// Busy timeout as a Duration
    pub fn busy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.busy_timeout_ms)
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Data Directory:     {}", self.data_dir),
            format!("SQLite Path:        {}", self.sqlite_path().display()),
            format!("Backup Path:        {}", self.backup_path().display()),
            format!("Backup Step:        {} pages", self.backup_step_pages),
            format!("Integrity Cap:      {} problems", self.integrity_max_errors),
            format!("Busy Timeout:       {} ms", self.busy_timeout_ms),
        ];

        if self.backup_path().exists() {
            lines.push("Backup Present:     yes".to_string());
        }

        lines.join("\n")
    }

    /// Get the config file path
    pub fn config_file_path() -> String {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/.songbase/songbase.toml", home_dir)
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{}", home.to_string_lossy(), rest),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lists_paths_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SongbaseConfig::with_data_dir(dir.path().to_string_lossy().to_string());

        let summary = cfg.summary();
        assert!(summary.contains(&cfg.sqlite_path().display().to_string()));
        assert!(summary.contains(&format!("{} pages", DEFAULT_BACKUP_STEP_PAGES)));
        assert!(!summary.contains("Backup Present"));

        std::fs::write(cfg.backup_path(), b"").unwrap();
        assert!(cfg.summary().contains("Backup Present:     yes"));
        assert!(SongbaseConfig::config_file_path().ends_with("/.songbase/songbase.toml"));
    }

    #[test]
    fn test_with_data_dir_defaults() {
        let cfg = SongbaseConfig::with_data_dir("/tmp/songbase/");
        assert_eq!(cfg.sqlite_path(), PathBuf::from("/tmp/songbase/songbase.db"));
        assert_eq!(
            cfg.backup_path(),
            PathBuf::from("/tmp/songbase/songbase.db.bak")
        );
        assert_eq!(cfg.backup_step_pages, DEFAULT_BACKUP_STEP_PAGES);
        assert_eq!(cfg.integrity_max_errors, DEFAULT_INTEGRITY_MAX_ERRORS);
    }

    #[test]
    fn test_from_map_parses_and_falls_back() {
        let mut map = HashMap::new();
        map.insert("data_dir".to_string(), "/srv/music".to_string());
        map.insert("database_filename".to_string(), "library.db".to_string());
        map.insert("backup_step_pages".to_string(), "64".to_string());
        map.insert("integrity_max_errors".to_string(), "not-a-number".to_string());
        map.insert("busy_timeout_ms".to_string(), "250".to_string());

        let cfg = SongbaseConfig::from_map(&map, "/unused");
        assert_eq!(cfg.sqlite_path(), PathBuf::from("/srv/music/library.db"));
        assert_eq!(cfg.backup_step_pages, 64);
        assert_eq!(cfg.integrity_max_errors, DEFAULT_INTEGRITY_MAX_ERRORS);
        assert_eq!(cfg.busy_timeout(), std::time::Duration::from_millis(250));
    }

    #[test]
    fn test_from_map_rejects_zero_step() {
        let mut map = HashMap::new();
        map.insert("backup_step_pages".to_string(), "0".to_string());

        let cfg = SongbaseConfig::from_map(&map, "/data");
        assert_eq!(cfg.data_dir, "/data");
        assert_eq!(cfg.backup_step_pages, DEFAULT_BACKUP_STEP_PAGES);
    }
}
