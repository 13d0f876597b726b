use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Ebook store backend with favorites, downloads and gateway payments.
#[derive(Parser, Debug, Clone)]
#[command(name = "bookstore-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "BOOKSTORE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// User management commands.
    User {
        /// User subcommand action.
        #[command(subcommand)]
        action: UserCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// User management subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum UserCommand {
    /// Add a new user.
    Add {
        /// Email address.
        email: String,
        /// Display name.
        #[arg(short, long)]
        name: Option<String>,
        /// Password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
        /// User role (admin or user).
        #[arg(short, long, default_value = "user")]
        role: String,
    },

    /// Deactivate a user account.
    Deactivate {
        /// Email of the account to deactivate.
        email: String,
    },

    /// List all users.
    List,

    /// Change user password.
    Passwd {
        /// Email address.
        email: String,
        /// New password (will prompt if not provided).
        #[arg(short, long)]
        password: Option<String>,
    },
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Asset storage / CDN configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Payment gateway configuration.
    #[serde(default)]
    pub payment: PaymentConfig,

    /// Per-user offline bundle configuration.
    #[serde(default)]
    pub userdata: UserDataConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Store title.
    #[serde(default = "default_title")]
    pub title: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

fn default_title() -> String {
    "My Book Store".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/store.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Registration mode: "open", "disabled".
    #[serde(default = "default_registration")]
    pub registration: String,

    /// Session token duration in days.
    #[serde(default = "default_session_days")]
    pub session_days: u32,

    /// Accounts registered with this email get the admin role.
    #[serde(default)]
    pub admin_email: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            session_days: default_session_days(),
            admin_email: None,
        }
    }
}

fn default_registration() -> String {
    "open".to_string()
}

fn default_session_days() -> u32 {
    30
}

impl AuthConfig {
    /// Check if registration is enabled.
    pub fn registration_enabled(&self) -> bool {
        self.registration == "open"
    }
}

/// Asset storage / CDN configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the asset host, used to synthesize URLs from public ids.
    #[serde(default = "default_cdn_base")]
    pub cdn_base_url: String,

    /// Cover URL used when a book has no resolvable cover.
    #[serde(default = "default_placeholder_cover")]
    pub placeholder_cover: String,

    /// Directory where fetched book files are materialized.
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cdn_base_url: default_cdn_base(),
            placeholder_cover: default_placeholder_cover(),
            downloads_dir: default_downloads_dir(),
        }
    }
}

fn default_cdn_base() -> String {
    "https://res.cloudinary.com/demo".to_string()
}

fn default_placeholder_cover() -> String {
    "/images/placeholder-cover.png".to_string()
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("data/downloads")
}

/// Payment gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Base URL of the gateway proxy (create-order / transaction-status).
    #[serde(default = "default_gateway_base")]
    pub base_url: String,

    /// Currency code for checkout orders.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Callback URL the gateway redirects to after checkout.
    #[serde(default = "default_callback_url")]
    pub callback_url: String,

    /// Maximum status poll attempts before giving up as still-pending.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Base delay in milliseconds between poll attempts (doubles each try).
    #[serde(default = "default_poll_base_delay_ms")]
    pub poll_base_delay_ms: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base(),
            currency: default_currency(),
            callback_url: default_callback_url(),
            max_poll_attempts: default_max_poll_attempts(),
            poll_base_delay_ms: default_poll_base_delay_ms(),
        }
    }
}

fn default_gateway_base() -> String {
    "http://127.0.0.1:8080/api/pesapal".to_string()
}

fn default_currency() -> String {
    "KES".to_string()
}

fn default_callback_url() -> String {
    "http://127.0.0.1:8080/api/payments/callback".to_string()
}

fn default_max_poll_attempts() -> u32 {
    5
}

fn default_poll_base_delay_ms() -> u64 {
    1000
}

/// Per-user offline bundle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDataConfig {
    /// Directory holding one bundle file per user.
    #[serde(default = "default_userdata_dir")]
    pub dir: PathBuf,
}

impl Default for UserDataConfig {
    fn default() -> Self {
        Self {
            dir: default_userdata_dir(),
        }
    }
}

fn default_userdata_dir() -> PathBuf {
    PathBuf::from("data/userdata")
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
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
            PathBuf::from("bookstore-rs.toml"),
            dirs::config_dir()
                .map(|p| p.join("bookstore-rs").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/bookstore-rs/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# bookstore-rs configuration

[server]
bind = "0.0.0.0:8080"
title = "My Book Store"

[database]
# path = "/var/lib/bookstore-rs/store.db"

[auth]
# Registration mode: "open" or "disabled"
registration = "open"
# Session duration in days
session_days = 30
# Accounts registered with this email get the admin role
# admin_email = "admin@example.com"

[storage]
# Base URL of the asset host (Cloudinary-style)
cdn_base_url = "https://res.cloudinary.com/demo"
# placeholder_cover = "/images/placeholder-cover.png"
# downloads_dir = "/var/lib/bookstore-rs/downloads"

[payment]
# Gateway proxy base URL
base_url = "http://127.0.0.1:8080/api/pesapal"
currency = "KES"
callback_url = "http://127.0.0.1:8080/api/payments/callback"
# Bounded verification polling
max_poll_attempts = 5
poll_base_delay_ms = 1000

[userdata]
# dir = "/var/lib/bookstore-rs/userdata"
"#
        .to_string()
    }
}
