use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Url;
use std::path::PathBuf;

/// Development backend used when no override is given
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// CRM client - authenticated access to the CRM backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend base URL
    #[arg(short = 'u', long, env = "CRM_API_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Path to the SQLite token store
    #[arg(short = 's', long, env = "CRM_TOKEN_STORE")]
    pub store: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the token pair
    Login {
        #[arg(long)]
        username: Option<String>,
        #[arg(long, env = "CRM_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Drop the stored session
    Logout {
        /// Do not tell the backend to blacklist the refresh token
        #[arg(long)]
        local_only: bool,
    },
    /// Show the cached identity
    Whoami,
    /// Check the stored access token with the backend
    Verify,
    /// Dashboard summary
    Summary,
    /// List flows
    Flows,
    /// List contacts
    Contacts {
        #[arg(long)]
        search: Option<String>,
    },
    /// Analytics reports
    Reports {
        #[arg(long)]
        period: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub base_url: Url,
    pub token_store: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,

    pub command: Command,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let base_url = Url::parse(&args.base_url)
            .with_context(|| format!("Invalid CRM_API_BASE_URL: {}", args.base_url))?;

        let token_store = args
            .store
            .map(|s| expand_tilde(&s))
            .unwrap_or_else(default_store_path);

        Ok(Config {
            base_url,
            token_store,

            http_connect_timeout: env_number("HTTP_CONNECT_TIMEOUT").unwrap_or(30),
            http_request_timeout: env_number("HTTP_REQUEST_TIMEOUT").unwrap_or(60),

            log_level: args.log_level,
            log_format: args.log_format,

            command: args.command,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.base_url.scheme() {
            "http" | "https" => {}
            other => anyhow::bail!(
                "CRM_API_BASE_URL must be http or https, got {}: {}",
                other,
                self.base_url
            ),
        }

        if self.base_url.cannot_be_a_base() {
            anyhow::bail!("CRM_API_BASE_URL cannot be used as a base: {}", self.base_url);
        }

        Ok(())
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// `<data dir>/crm-client/session.sqlite3`, or the working directory
fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("crm-client").join("session.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("crm-session.sqlite3"))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_cli_overrides_base_url() {
        let args = parse(&[
            "crm-client",
            "--base-url",
            "https://autochats.example.com",
            "--store",
            "/tmp/s.sqlite3",
            "whoami",
        ]);
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.base_url.as_str(), "https://autochats.example.com/");
        assert_eq!(config.token_store, PathBuf::from("/tmp/s.sqlite3"));
        assert_eq!(config.command, Command::Whoami);
        config.validate().unwrap();
    }

    #[test]
    fn test_subcommand_flags() {
        let args = parse(&["crm-client", "--store", "x", "logout", "--local-only"]);
        assert_eq!(args.command, Command::Logout { local_only: true });
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_rejects_non_http_base_url() {
        let args = parse(&["crm-client", "--base-url", "ftp://files.example.com", "summary"]);
        let config = Config::from_args(args).unwrap();
        assert!(config.validate().is_err());

        let args = parse(&["crm-client", "--base-url", "not a url", "summary"]);
        assert!(Config::from_args(args).is_err());
    }
}
