use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Manuscript ingestion and chapter delivery for serialized novels.
#[derive(Parser, Debug, Clone)]
#[command(name = "quire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "QUIRE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Upload a manuscript file (EPUB or plain text).
    Upload {
        /// Path to the manuscript.
        file: PathBuf,
        /// Book title.
        #[arg(short, long)]
        title: Option<String>,
        /// Book author.
        #[arg(short, long)]
        author: Option<String>,
        /// Genre (repeatable).
        #[arg(short, long = "genre")]
        genres: Vec<String>,
        /// Cover image or promotional clip.
        #[arg(long)]
        cover: Option<PathBuf>,
        /// Explicit chapter number (plain text only).
        #[arg(long)]
        chapter: Option<u32>,
        /// Explicit chapter title (plain text only).
        #[arg(long)]
        chapter_title: Option<String>,
        /// Preferred storage target.
        #[arg(long, value_enum, default_value = "local")]
        target: TargetArg,
        /// Reader id of the uploader.
        #[arg(short, long)]
        reader: Option<String>,
    },

    /// Print a chapter and record reading progress.
    Read {
        /// Book id.
        book_id: String,
        /// Chapter number.
        chapter: u32,
        /// Store to read from.
        #[arg(long, value_enum, default_value = "remote")]
        source: SourceArg,
        /// Reader id (omit for an anonymous session).
        #[arg(short, long)]
        reader: Option<String>,
        /// Number of following chapters to prefetch.
        #[arg(long, default_value = "0")]
        prefetch: u32,
    },

    /// Show merged reading history.
    History {
        /// Reader id (omit for device history only).
        #[arg(short, long)]
        reader: Option<String>,
    },

    /// Create a default config file and the local databases.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Storage preference accepted on the command line.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArg {
    /// Shared catalog.
    Cloud,
    /// This device only.
    Local,
}

/// Store a reader pulls chapters from.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceArg {
    /// Shared catalog.
    Remote,
    /// This device only.
    Local,
}

impl From<TargetArg> for crate::router::TargetPreference {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Cloud => crate::router::TargetPreference::Cloud,
            TargetArg::Local => crate::router::TargetPreference::Local,
        }
    }
}

impl From<SourceArg> for crate::library::StorageTarget {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Remote => crate::library::StorageTarget::Remote,
            SourceArg::Local => crate::library::StorageTarget::Local,
        }
    }
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Store locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cover normalization.
    #[serde(default)]
    pub covers: CoverConfig,

    /// Reading session cache.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Upload behaviour.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Contributor tiers.
    #[serde(default)]
    pub auth: AuthConfig,

    /// This device.
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

/// Store locations for the device-local and shared stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database backing the device-local document store.
    #[serde(default = "default_local_db")]
    pub local_db: PathBuf,

    /// SQLite database backing the shared catalog document store.
    #[serde(default = "default_remote_db")]
    pub remote_db: PathBuf,

    /// Directory for device-local assets.
    #[serde(default = "default_local_blobs")]
    pub local_blobs: PathBuf,

    /// Directory for shared catalog assets.
    #[serde(default = "default_remote_blobs")]
    pub remote_blobs: PathBuf,

    /// Public URL prefix for shared catalog assets.
    #[serde(default = "default_remote_base_url")]
    pub remote_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_db: default_local_db(),
            remote_db: default_remote_db(),
            local_blobs: default_local_blobs(),
            remote_blobs: default_remote_blobs(),
            remote_base_url: default_remote_base_url(),
        }
    }
}

fn default_local_db() -> PathBuf {
    PathBuf::from("data/device.db")
}

fn default_remote_db() -> PathBuf {
    PathBuf::from("data/catalog.db")
}

fn default_local_blobs() -> PathBuf {
    PathBuf::from("data/assets/local")
}

fn default_remote_blobs() -> PathBuf {
    PathBuf::from("data/assets/catalog")
}

fn default_remote_base_url() -> String {
    "/assets".to_string()
}

/// Cover normalization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverConfig {
    /// Longest edge for book covers, in pixels.
    #[serde(default = "default_cover_max_edge")]
    pub cover_max_edge: u32,

    /// Longest edge for hero backgrounds, in pixels.
    #[serde(default = "default_hero_max_edge")]
    pub hero_max_edge: u32,

    /// JPEG quality (1-100).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            cover_max_edge: default_cover_max_edge(),
            hero_max_edge: default_hero_max_edge(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_cover_max_edge() -> u32 {
    800
}

fn default_hero_max_edge() -> u32 {
    1920
}

fn default_jpeg_quality() -> u8 {
    85
}

/// Reading session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Maximum chapters held in one session's cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Chapters fetched ahead of the current one.
    #[serde(default = "default_prefetch_window")]
    pub prefetch_window: u32,

    /// Reader shelves kept by the server. The least recently used one is
    /// dropped when a new reader arrives past this limit.
    #[serde(default = "default_max_shelves")]
    pub max_shelves: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_cache_capacity(),
            prefetch_window: default_prefetch_window(),
            max_shelves: default_max_shelves(),
        }
    }
}

fn default_cache_capacity() -> usize {
    64
}

fn default_prefetch_window() -> u32 {
    10
}

fn default_max_shelves() -> usize {
    256
}

/// Upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Attempts per chapter write before it is reported as failed.
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            write_attempts: default_write_attempts(),
        }
    }
}

fn default_write_attempts() -> u32 {
    2
}

/// Contributor tier configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Reader ids with administrator rights.
    #[serde(default)]
    pub admins: Vec<String>,

    /// Reader ids of approved contributors.
    #[serde(default)]
    pub approved: Vec<String>,
}

/// Device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Identifier of this device, used for local reading history.
    #[serde(default = "default_device_id")]
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
        }
    }
}

fn default_device_id() -> String {
    "this-device".to_string()
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("quire.toml"),
            dirs::config_dir()
                .map(|p| p.join("quire").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/quire/config.toml"),
        ];

        candidates
            .into_iter()
            .find(|p| !p.as_os_str().is_empty() && p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# quire configuration

[server]
bind = "0.0.0.0:8080"

[storage]
# local_db = "data/device.db"
# remote_db = "data/catalog.db"
# local_blobs = "data/assets/local"
# remote_blobs = "data/assets/catalog"
remote_base_url = "/assets"

[covers]
cover_max_edge = 800
hero_max_edge = 1920
jpeg_quality = 85

[reader]
# Chapters kept in memory per reading session
cache_capacity = 64
# Chapters fetched ahead of the current one
prefetch_window = 10
# Open reader shelves kept in memory by the server
max_shelves = 256

[upload]
# Attempts per chapter write before reporting it as failed
write_attempts = 2

[auth]
# Reader ids allowed to publish to the shared catalog
admins = []
approved = []

[device]
id = "this-device"
"#
        .to_string()
    }
}

/// Supported manuscript formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManuscriptFormat {
    /// EPUB container.
    Epub,
    /// Plain or pasted text.
    Txt,
}

impl ManuscriptFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ManuscriptFormat::Epub => "application/epub+zip",
            ManuscriptFormat::Txt => "text/plain",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(ManuscriptFormat::Epub),
            "txt" | "text" | "md" | "markdown" => Some(ManuscriptFormat::Txt),
            _ => None,
        }
    }

    /// Detect format from a file path.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}
