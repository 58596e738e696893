use anyhow::{Context, Result};
use clap::Args;
use reqwest::Url;
use std::path::PathBuf;

/// Connection and storage settings shared by every command
#[derive(Args, Debug, Clone)]
pub struct SettingsArgs {
    /// Base URL of the health records API
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Path to the SQLite file holding the persisted session
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Keep the session in memory only (nothing survives a restart)
    #[arg(long, env = "SESSION_MEMORY_ONLY", default_value = "false")]
    pub memory_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,
}

/// Where session state lives between runs
#[derive(Clone, Debug, PartialEq)]
pub enum Persistence {
    /// SQLite file; survives restarts
    Durable,
    /// Process memory only
    MemoryOnly,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,

    pub persistence: Persistence,
    pub session_db_file: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults
    ///
    /// Call `dotenvy::dotenv()` before parsing the CLI so `.env` values
    /// participate in the env fallbacks.
    pub fn from_args(args: SettingsArgs) -> Result<Self> {
        let session_db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_path(),
        };

        let config = Config {
            api_base_url: args.base_url.trim_end_matches('/').to_string(),
            persistence: if args.memory_only {
                Persistence::MemoryOnly
            } else {
                Persistence::Durable
            },
            session_db_file,

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!(
                "API_BASE_URL must use http or https, got '{}'",
                url.scheme()
            );
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        if self.persistence == Persistence::Durable && self.session_db_file.is_dir() {
            anyhow::bail!(
                "SESSION_DB_FILE points to a directory: {}",
                self.session_db_file.display()
            );
        }

        Ok(())
    }
}

/// Default session database under the platform's local data directory
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("health-session").join("session.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
