/// CLI configuration
use hesi_scanner::{CoordinatorConfig, DEFAULT_BATCH_SIZE, DEFAULT_LISTING_PERMITS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, read from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "hesi.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CliConfig {
    /// Root of the persisted scan state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_listing_permits")]
    pub listing_permits: usize,

    #[serde(default = "default_error_debounce_ms")]
    pub error_debounce_ms: u64,

    #[serde(default)]
    pub compute_fingerprints: bool,

    /// Recover mis-decoded legacy tag text
    #[serde(default = "default_repair_charset")]
    pub repair_charset: bool,

    /// Always excluded, on top of `--exclude`
    #[serde(default)]
    pub excluded_paths: Vec<PathBuf>,
}

impl CliConfig {
    /// Load from `path` (or `hesi.toml` if present) and `HESI_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut settings = config::Config::builder();

        match path {
            Some(path) => {
                settings = settings.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    settings = settings.add_source(config::File::from(default_path));
                }
            }
        }

        // Override with environment variables (HESI_STATE_DIR, HESI_BATCH_SIZE, ...)
        settings = settings.add_source(config::Environment::with_prefix("HESI").try_parsing(true));

        settings.build()?.try_deserialize()
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig::new(&self.state_dir)
            .with_batch_size(self.batch_size)
            .with_listing_permits(self.listing_permits)
            .with_error_debounce(Duration::from_millis(self.error_debounce_ms))
            .compute_fingerprints(self.compute_fingerprints)
    }
}

// Default values
fn default_state_dir() -> PathBuf {
    PathBuf::from("./data/scans")
}

fn default_database_url() -> String {
    "sqlite://./data/hesi.db".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_listing_permits() -> usize {
    DEFAULT_LISTING_PERMITS
}

fn default_error_debounce_ms() -> u64 {
    2000
}

fn default_repair_charset() -> bool {
    true
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            database_url: default_database_url(),
            batch_size: default_batch_size(),
            listing_permits: default_listing_permits(),
            error_debounce_ms: default_error_debounce_ms(),
            compute_fingerprints: false,
            repair_charset: default_repair_charset(),
            excluded_paths: Vec::new(),
        }
    }
}
