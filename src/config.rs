//! Enricher configuration model, defaults, and loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::LevelFilter;

const APP_DIR_NAME: &str = "artist-enricher";

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Media server connection.
    pub plex: PlexConfig,
    /// Catalog API credentials.
    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Batch pacing and reconciliation policy.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    /// Artwork validation thresholds and endpoint timeouts.
    #[serde(default)]
    pub artwork: ArtworkConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlexConfig {
    pub base_url: String,
    /// Empty means the token is read from the OS keyring.
    #[serde(default)]
    pub token: String,
    /// Music section title; empty selects the first music section.
    #[serde(default)]
    pub library_section: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SpotifyConfig {
    #[serde(default)]
    pub client_id: String,
    /// Empty means the secret is read from the OS keyring.
    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DatabaseConfig {
    /// Ledger location; defaults to the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LoggingConfig {
    /// Optional log file written alongside stderr.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Console (stderr) level.
    #[serde(default)]
    pub level: LogLevel,
    /// Level for the log file, when one is configured.
    #[serde(default = "default_file_level")]
    pub file_level: LogLevel,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentMode {
    Sequential,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub mode: EnrichmentMode,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    #[serde(default = "default_catalog_min_interval_ms")]
    pub catalog_min_interval_ms: u64,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_catalog_timeout_secs")]
    pub catalog_timeout_secs: u64,
    #[serde(default)]
    pub skip_complete_artists: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ArtworkConfig {
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_installed_timeout_secs")]
    pub installed_timeout_secs: u64,
    #[serde(default = "default_upload_min_edge_px")]
    pub upload_min_edge_px: u32,
    #[serde(default = "default_installed_min_edge_px")]
    pub installed_min_edge_px: u32,
    #[serde(default = "default_installed_min_bytes")]
    pub installed_min_bytes: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the platform {0} directory")]
    NoPlatformDir(&'static str),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("created default config at {}; fill in credentials and run again", .0.display())]
    CreatedDefault(PathBuf),
}

impl Default for PlexConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:32400".to_string(),
            token: String::new(),
            library_section: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            mode: EnrichmentMode::Parallel,
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            catalog_min_interval_ms: default_catalog_min_interval_ms(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            catalog_timeout_secs: default_catalog_timeout_secs(),
            skip_complete_artists: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: None,
            level: LogLevel::default(),
            file_level: default_file_level(),
        }
    }
}


impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            download_timeout_secs: default_download_timeout_secs(),
            installed_timeout_secs: default_installed_timeout_secs(),
            upload_min_edge_px: default_upload_min_edge_px(),
            installed_min_edge_px: default_installed_min_edge_px(),
            installed_min_bytes: default_installed_min_bytes(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

fn default_max_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    4
}

fn default_batch_pause_ms() -> u64 {
    500
}

fn default_catalog_min_interval_ms() -> u64 {
    1_000
}

fn default_max_rate_limit_retries() -> u32 {
    1
}

fn default_catalog_timeout_secs() -> u64 {
    30
}

fn default_download_timeout_secs() -> u64 {
    10
}

fn default_installed_timeout_secs() -> u64 {
    5
}

fn default_upload_min_edge_px() -> u32 {
    200
}

fn default_installed_min_edge_px() -> u32 {
    100
}

fn default_installed_min_bytes() -> usize {
    1_000
}

fn default_file_level() -> LogLevel {
    LogLevel::Debug
}

fn default_jpeg_quality() -> u8 {
    95
}

impl Config {
    /// Checks the settings a run cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.plex.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("plex.base_url"));
        }
        if self.spotify.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("spotify.client_id"));
        }
        Ok(())
    }
}

impl EnrichmentConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn catalog_min_interval(&self) -> Duration {
        Duration::from_millis(self.catalog_min_interval_ms)
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
        .ok_or(ConfigError::NoPlatformDir("config"))
}

pub fn default_database_path() -> Result<PathBuf, ConfigError> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join("ledger.db"))
        .ok_or(ConfigError::NoPlatformDir("data"))
}

/// Clamps values into ranges the runtime can work with.
pub fn sanitize_config(config: Config) -> Config {
    let enrichment = EnrichmentConfig {
        max_workers: config.enrichment.max_workers.clamp(1, 32),
        batch_size: config.enrichment.batch_size.clamp(1, 256),
        catalog_min_interval_ms: config.enrichment.catalog_min_interval_ms.clamp(1, 60_000),
        max_rate_limit_retries: config.enrichment.max_rate_limit_retries.min(5),
        catalog_timeout_secs: config.enrichment.catalog_timeout_secs.clamp(1, 300),
        ..config.enrichment
    };
    let artwork = ArtworkConfig {
        download_timeout_secs: config.artwork.download_timeout_secs.clamp(1, 120),
        installed_timeout_secs: config.artwork.installed_timeout_secs.clamp(1, 120),
        upload_min_edge_px: config.artwork.upload_min_edge_px.max(1),
        installed_min_edge_px: config.artwork.installed_min_edge_px.max(1),
        jpeg_quality: config.artwork.jpeg_quality.clamp(1, 100),
        ..config.artwork
    };
    let plex = PlexConfig {
        request_timeout_secs: config.plex.request_timeout_secs.clamp(1, 300),
        ..config.plex
    };
    Config {
        plex,
        enrichment,
        artwork,
        ..config
    }
}

/// Reads and sanitizes the config at `path`. A missing file is created
/// from defaults and reported as `ConfigError::CreatedDefault`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let text = toml::to_string(&sanitize_config(Config::default()))?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        return Err(ConfigError::CreatedDefault(path.to_path_buf()));
    }

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed = toml::from_str::<Config>(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(sanitize_config(parsed))
}
