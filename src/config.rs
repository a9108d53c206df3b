/*!
 * Configuration support for the supply-check library
 *
 * Provides runtime configuration: where the MHLW spreadsheet is cached,
 * where it is downloaded from, network timeouts, the recency window, and
 * the column pattern lists.
 */

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DAYS_BACK, ITEMS_PER_PAGE};
use crate::schema::ColumnPatterns;

/// Page on the MHLW site that links to the current supply-status workbook
pub const MHLW_MAIN_URL: &str =
    "https://www.mhlw.go.jp/stf/seisakunitsuite/bunya/kenkou_iryou/iryou/kouhatu-iyaku/04_00003.html";

/// Global configuration for the library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Directory holding the cached workbook and its metadata sidecar
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// File name of the cached workbook inside `cache_dir`
    #[serde(default = "default_excel_file_name")]
    pub excel_file_name: String,

    /// File name of the metadata sidecar inside `cache_dir`
    #[serde(default = "default_meta_file_name")]
    pub meta_file_name: String,

    /// Page scraped for the workbook link
    #[serde(default = "default_main_url")]
    pub mhlw_main_url: String,

    /// Timeout for fetching the MHLW page, in seconds
    #[serde(default = "default_scrape_timeout")]
    pub scrape_timeout_secs: u64,

    /// Timeout for the HEAD request that reads cache validators, in seconds
    #[serde(default = "default_meta_timeout")]
    pub meta_timeout_secs: u64,

    /// Timeout for downloading the workbook, in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Recency window in days
    #[serde(default = "default_days_back")]
    pub days_back: i64,

    /// Page size for reference table previews
    #[serde(default = "default_items_per_page")]
    pub items_per_page: usize,

    /// Wall-clock bound on parsing and matching one upload, in seconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// User agent sent to the MHLW site
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Column pattern lists
    #[serde(default)]
    pub patterns: ColumnPatterns,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            excel_file_name: default_excel_file_name(),
            meta_file_name: default_meta_file_name(),
            mhlw_main_url: default_main_url(),
            scrape_timeout_secs: default_scrape_timeout(),
            meta_timeout_secs: default_meta_timeout(),
            download_timeout_secs: default_download_timeout(),
            days_back: default_days_back(),
            items_per_page: default_items_per_page(),
            check_timeout_secs: default_check_timeout(),
            user_agent: None,
            patterns: ColumnPatterns::default(),
        }
    }
}

// Default value functions for serde
fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "supplycheck")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("cache"))
}

fn default_excel_file_name() -> String {
    "mhlw_latest.xlsx".to_string()
}

fn default_meta_file_name() -> String {
    "mhlw_meta.json".to_string()
}

fn default_main_url() -> String {
    MHLW_MAIN_URL.to_string()
}

fn default_scrape_timeout() -> u64 {
    10
}

fn default_meta_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    25
}

fn default_days_back() -> i64 {
    DEFAULT_DAYS_BACK
}

fn default_items_per_page() -> usize {
    ITEMS_PER_PAGE
}

fn default_check_timeout() -> u64 {
    60
}

impl CheckerConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the cached workbook
    pub fn excel_path(&self) -> PathBuf {
        self.cache_dir.join(&self.excel_file_name)
    }

    /// Path of the metadata sidecar
    pub fn meta_path(&self) -> PathBuf {
        self.cache_dir.join(&self.meta_file_name)
    }

    /// Upload check timeout as a [`Duration`]
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - `SUPPLYCHECK_CACHE_DIR`: directory path
    /// - `SUPPLYCHECK_MHLW_URL`: page URL
    /// - `SUPPLYCHECK_DAYS_BACK`: number of days
    /// - `SUPPLYCHECK_SCRAPE_TIMEOUT`, `SUPPLYCHECK_META_TIMEOUT`,
    ///   `SUPPLYCHECK_DOWNLOAD_TIMEOUT`, `SUPPLYCHECK_CHECK_TIMEOUT`: seconds
    /// - `SUPPLYCHECK_ITEMS_PER_PAGE`: number
    /// - `SUPPLYCHECK_USER_AGENT`: string
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SUPPLYCHECK_CACHE_DIR") {
            self.cache_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SUPPLYCHECK_MHLW_URL") {
            self.mhlw_main_url = val;
        }

        if let Ok(val) = std::env::var("SUPPLYCHECK_DAYS_BACK") {
            if let Ok(days) = val.parse() {
                self.days_back = days;
            }
        }

        for (var, field) in [
            ("SUPPLYCHECK_SCRAPE_TIMEOUT", &mut self.scrape_timeout_secs),
            ("SUPPLYCHECK_META_TIMEOUT", &mut self.meta_timeout_secs),
            ("SUPPLYCHECK_DOWNLOAD_TIMEOUT", &mut self.download_timeout_secs),
            ("SUPPLYCHECK_CHECK_TIMEOUT", &mut self.check_timeout_secs),
        ] {
            if let Some(secs) = std::env::var(var).ok().and_then(|v| v.parse().ok()) {
                *field = secs;
            }
        }

        if let Ok(val) = std::env::var("SUPPLYCHECK_ITEMS_PER_PAGE") {
            if let Ok(size) = val.parse() {
                self.items_per_page = size;
            }
        }

        if let Ok(val) = std::env::var("SUPPLYCHECK_USER_AGENT") {
            self.user_agent = Some(val);
        }

        self
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| crate::SupplyCheckError::Configuration {
                message: format!("Failed to parse config file: {}", e),
                suggestion: Some("Check that the file is valid TOML format".to_string()),
            })?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| crate::SupplyCheckError::Configuration {
                message: format!("Failed to serialize config: {}", e),
                suggestion: None,
            })?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/supplycheck/config.toml` on Unix-like systems
    /// or `%APPDATA%\supplycheck\config.toml` on Windows
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "supplycheck")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from the default location, then apply environment
    /// overrides
    ///
    /// Priority order:
    /// 1. Environment variables
    /// 2. Default config file (if exists)
    /// 3. Built-in defaults
    pub fn load() -> Self {
        let base = Self::default_config_path()
            .filter(|path| path.exists())
            .and_then(|path| match Self::from_file(&path) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                    None
                }
            })
            .unwrap_or_default();

        base.with_env_overrides()
    }
}

// Global configuration support
use std::sync::RwLock;

lazy_static::lazy_static! {
    static ref GLOBAL_CONFIG: RwLock<Option<CheckerConfig>> = RwLock::new(None);
}

/// Set the global configuration
pub fn set_global_config(config: CheckerConfig) {
    if let Ok(mut guard) = GLOBAL_CONFIG.write() {
        *guard = Some(config);
    }
}

/// Get the global configuration (or load one if not set)
pub fn global_config() -> CheckerConfig {
    GLOBAL_CONFIG
        .read()
        .ok()
        .and_then(|guard| guard.as_ref().cloned())
        .unwrap_or_else(CheckerConfig::load)
}

/// Clear the global configuration
pub fn clear_global_config() {
    if let Ok(mut guard) = GLOBAL_CONFIG.write() {
        *guard = None;
    }
}

/// Builder for customizing configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: CheckerConfig,
}

impl ConfigBuilder {
    /// Start building a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache directory
    pub fn cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.config.cache_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the MHLW page URL
    pub fn mhlw_main_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.mhlw_main_url = url.into();
        self
    }

    /// Set the recency window
    pub fn days_back(mut self, days: i64) -> Self {
        self.config.days_back = days;
        self
    }

    /// Set the upload check timeout
    pub fn check_timeout_secs(mut self, secs: u64) -> Self {
        self.config.check_timeout_secs = secs;
        self
    }

    /// Set the download timeout
    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Set the user agent
    pub fn user_agent<S: Into<String>>(mut self, agent: S) -> Self {
        self.config.user_agent = Some(agent.into());
        self
    }

    /// Replace the column pattern lists
    pub fn patterns(mut self, patterns: ColumnPatterns) -> Self {
        self.config.patterns = patterns;
        self
    }

    /// Build the configuration
    pub fn build(self) -> CheckerConfig {
        self.config
    }
}
