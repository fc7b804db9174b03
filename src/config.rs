//! Configuration management
//!
//! Everything is read from the environment (after `.env` is loaded by `main`).
//! `Config::validate` runs before any polling starts and decides which
//! backend the bridge will prefer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{BackendKind, CliBackend};

pub const DEFAULT_PROJECT_ROOT: &str = "/home/ubuntu/project";
pub const DEFAULT_BACKEND_DIR: &str = "transcription-platform";
pub const DEFAULT_FRONTEND_DIR: &str = "expo-voice-analytics-mobile-app";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Startup validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("TELEGRAM_BOT_TOKEN not set")]
    MissingToken,
    #[error("AUTH_METHOD='api' but ANTHROPIC_API_KEY not set")]
    ApiKeyMissing,
    #[error("AUTH_METHOD='cli' but Claude CLI not available (install with: npm install -g @anthropic-ai/claude-code)")]
    CliUnavailable,
    #[error("No authentication method available: set ANTHROPIC_API_KEY or log in with `claude-code login`")]
    NoBackend,
    #[error("PROJECT_ROOT does not exist: {0}")]
    ProjectRootMissing(PathBuf),
    #[error("Invalid AUTH_METHOD '{0}' (expected api, cli or auto)")]
    InvalidAuthMethod(String),
}

/// Which backend the operator asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    Api,
    Cli,
    #[default]
    Auto,
}

impl FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "cli" => Ok(Self::Cli),
            "auto" | "" => Ok(Self::Auto),
            other => Err(ConfigError::InvalidAuthMethod(other.to_string())),
        }
    }
}

/// Named working-directory profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Context {
    #[default]
    Backend,
    Frontend,
    Root,
}

impl Context {
    pub const ALL: [Context; 3] = [Context::Backend, Context::Frontend, Context::Root];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Root => "root",
        }
    }

    /// Parse a context name (case-insensitive)
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "backend" => Some(Self::Backend),
            "frontend" => Some(Self::Frontend),
            "root" => Some(Self::Root),
            _ => None,
        }
    }

    pub fn names() -> String {
        Self::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed context → directory lookup
#[derive(Debug, Clone)]
pub struct ContextTable {
    root: PathBuf,
    backend: PathBuf,
    frontend: PathBuf,
}

impl ContextTable {
    pub fn new(root: impl Into<PathBuf>, backend_dir: &str, frontend_dir: &str) -> Self {
        let root = root.into();
        Self {
            backend: root.join(backend_dir),
            frontend: root.join(frontend_dir),
            root,
        }
    }

    /// Every context maps to the project root
    pub fn single(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            backend: root.clone(),
            frontend: root.clone(),
            root,
        }
    }

    pub fn dir(&self, context: Context) -> &Path {
        match context {
            Context::Backend => &self.backend,
            Context::Frontend => &self.frontend,
            Context::Root => &self.root,
        }
    }

    /// Resolve a context name; unknown names fall back to the project root
    pub fn resolve(&self, name: &str) -> &Path {
        Context::parse(name)
            .map(|c| self.dir(c))
            .unwrap_or(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Bot configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token (from @BotFather)
    pub telegram_token: String,

    /// api, cli or auto
    pub auth_method: AuthMethod,

    /// Anthropic API key (required for the API backend)
    pub anthropic_api_key: Option<String>,

    /// Messages endpoint
    pub api_url: String,

    /// Allowed Telegram user ids; empty means everyone
    pub allowed_users: Vec<i64>,

    /// Project root and derived context directories
    pub project_root: PathBuf,
    pub contexts: ContextTable,

    /// Model id for the API backend
    pub model: String,

    /// Per-call timeout (CLI subprocess and API request)
    pub call_timeout: Duration,

    /// Requests per user per minute
    pub max_requests_per_minute: usize,

    /// Idle time after which a session is evicted
    pub session_timeout: Duration,

    /// Interactions kept per session
    pub session_history_limit: usize,

    /// LOG_LEVEL as given
    pub log_level: String,
}

/// Result of startup validation
#[derive(Debug, Clone)]
pub struct BackendSelection {
    /// Preferred backend
    pub method: BackendKind,
    /// Detected CLI executable, if any
    pub cli_program: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();

        let auth_method = std::env::var("AUTH_METHOD")
            .unwrap_or_else(|_| "auto".to_string())
            .parse()?;

        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let api_url = std::env::var("ANTHROPIC_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        let allowed_users = parse_user_ids(&std::env::var("ALLOWED_USER_IDS").unwrap_or_default());

        let project_root = std::env::var("PROJECT_ROOT")
            .map(|p| PathBuf::from(shellexpand::tilde(&p).into_owned()))
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PROJECT_ROOT));

        let backend_dir = std::env::var("BACKEND_DIR")
            .unwrap_or_else(|_| DEFAULT_BACKEND_DIR.to_string());
        let frontend_dir = std::env::var("FRONTEND_DIR")
            .unwrap_or_else(|_| DEFAULT_FRONTEND_DIR.to_string());
        let contexts = ContextTable::new(&project_root, &backend_dir, &frontend_dir);

        let model = std::env::var("CLAUDE_MODEL")
            .unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let call_timeout = Duration::from_secs(env_parse("CLAUDE_TIMEOUT", 300));
        let max_requests_per_minute = env_parse("MAX_REQUESTS_PER_MINUTE", 10);
        let session_timeout = Duration::from_secs(env_parse("SESSION_TIMEOUT", 3600));
        let session_history_limit = env_parse("SESSION_HISTORY_LIMIT", 50);

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());

        Ok(Self {
            telegram_token,
            auth_method,
            anthropic_api_key,
            api_url,
            allowed_users,
            project_root,
            contexts,
            model,
            call_timeout,
            max_requests_per_minute,
            session_timeout,
            session_history_limit,
            log_level,
        })
    }

    /// Validate before polling. Probes for the CLI, so it is async.
    pub async fn validate(&self) -> Result<BackendSelection, ConfigError> {
        if self.telegram_token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }

        let cli_program = CliBackend::detect().await;
        let method = resolve_method(
            self.auth_method,
            cli_program.is_some(),
            self.anthropic_api_key.is_some(),
        )?;

        match method {
            BackendKind::Api => info!("Using Anthropic API authentication"),
            BackendKind::Cli => info!(
                "Using Claude Code CLI authentication ({})",
                cli_program.as_deref().unwrap_or("claude")
            ),
        }

        if self.allowed_users.is_empty() {
            warn!("ALLOWED_USER_IDS not set - bot will accept requests from anyone!");
        }

        if !self.project_root.exists() {
            return Err(ConfigError::ProjectRootMissing(self.project_root.clone()));
        }

        Ok(BackendSelection { method, cli_program })
    }
}

/// Decide the preferred backend. `auto` prefers the CLI.
pub fn resolve_method(
    auth_method: AuthMethod,
    cli_available: bool,
    api_key_present: bool,
) -> Result<BackendKind, ConfigError> {
    match auth_method {
        AuthMethod::Api if api_key_present => Ok(BackendKind::Api),
        AuthMethod::Api => Err(ConfigError::ApiKeyMissing),
        AuthMethod::Cli if cli_available => Ok(BackendKind::Cli),
        AuthMethod::Cli => Err(ConfigError::CliUnavailable),
        AuthMethod::Auto if cli_available => Ok(BackendKind::Cli),
        AuthMethod::Auto if api_key_present => Ok(BackendKind::Api),
        AuthMethod::Auto => Err(ConfigError::NoBackend),
    }
}

/// Parse a comma-separated id list, skipping junk
pub fn parse_user_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_parse() {
        assert_eq!("API".parse::<AuthMethod>().unwrap(), AuthMethod::Api);
        assert_eq!("cli".parse::<AuthMethod>().unwrap(), AuthMethod::Cli);
        assert_eq!("".parse::<AuthMethod>().unwrap(), AuthMethod::Auto);
        assert!("oauth".parse::<AuthMethod>().is_err());
    }

    #[test]
    fn test_resolve_explicit_methods() {
        assert_eq!(resolve_method(AuthMethod::Api, false, true).unwrap(), BackendKind::Api);
        assert!(matches!(
            resolve_method(AuthMethod::Api, true, false),
            Err(ConfigError::ApiKeyMissing)
        ));
        assert_eq!(resolve_method(AuthMethod::Cli, true, false).unwrap(), BackendKind::Cli);
        assert!(matches!(
            resolve_method(AuthMethod::Cli, false, true),
            Err(ConfigError::CliUnavailable)
        ));
    }

    #[test]
    fn test_resolve_auto_prefers_cli() {
        assert_eq!(resolve_method(AuthMethod::Auto, true, true).unwrap(), BackendKind::Cli);
        assert_eq!(resolve_method(AuthMethod::Auto, false, true).unwrap(), BackendKind::Api);
        assert!(matches!(
            resolve_method(AuthMethod::Auto, false, false),
            Err(ConfigError::NoBackend)
        ));
    }

    #[test]
    fn test_parse_user_ids() {
        assert_eq!(parse_user_ids("1, 2,x,,3"), vec![1, 2, 3]);
        assert!(parse_user_ids("").is_empty());
    }

    #[test]
    fn test_context_table_resolution() {
        let table = ContextTable::new("/srv/app", "api", "web");
        assert_eq!(table.resolve("backend"), Path::new("/srv/app/api"));
        assert_eq!(table.resolve("FRONTEND"), Path::new("/srv/app/web"));
        assert_eq!(table.resolve("root"), Path::new("/srv/app"));
        // Unknown contexts are not an error
        assert_eq!(table.resolve("mobile"), Path::new("/srv/app"));
    }

    #[test]
    fn test_context_names() {
        assert_eq!(Context::names(), "backend, frontend, root");
        assert_eq!(Context::parse(" Root "), Some(Context::Root));
        assert_eq!(Context::parse("infra"), None);
    }
}
