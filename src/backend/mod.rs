//! Assistant backends
//!
//! Two interchangeable ways of getting an answer for a prompt:
//!
//! ```text
//! Invoker ──► primary   (Cli | Api) ──ok──► text
//!               │ err
//!               └──► secondary (the other one, if configured) ──ok──► text
//!                        │ err
//!                        └──► primary's error
//! ```

mod api;
mod cli;

pub use api::ApiBackend;
pub use cli::{strip_ansi_codes, CliBackend, CLI_CANDIDATES};

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BackendSelection, Config, ConfigError};

/// Backend failures
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("Process exited with code {code:?}: {output}")]
    ExitStatus { code: Option<i32>, output: String },
    #[error("Claude API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Empty response from backend")]
    EmptyResponse,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The two backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cli,
    Api,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Api => "api",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Self::Cli => Self::Api,
            Self::Api => Self::Cli,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that turns a prompt into assistant text
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn invoke(&self, prompt: &str, working_dir: &Path) -> Result<String, BackendError>;
}

/// Text plus the backend that produced it
#[derive(Debug, Clone)]
pub struct Invocation {
    pub text: String,
    pub kind: BackendKind,
}

/// Try `primary`; on failure try `secondary` once.
/// If both fail the primary's error is returned.
pub async fn invoke_with_fallback(
    primary: &dyn Backend,
    secondary: Option<&dyn Backend>,
    prompt: &str,
    working_dir: &Path,
) -> Result<Invocation, BackendError> {
    let primary_err = match primary.invoke(prompt, working_dir).await {
        Ok(text) => {
            return Ok(Invocation {
                text,
                kind: primary.kind(),
            })
        }
        Err(e) => e,
    };

    warn!("{} backend failed: {}", primary.kind(), primary_err);

    let Some(secondary) = secondary else {
        return Err(primary_err);
    };

    info!("{} failed, trying {} fallback...", primary.kind(), secondary.kind());
    match secondary.invoke(prompt, working_dir).await {
        Ok(text) => Ok(Invocation {
            text,
            kind: secondary.kind(),
        }),
        Err(e) => {
            warn!("{} fallback also failed: {}", secondary.kind(), e);
            Err(primary_err)
        }
    }
}

/// Preferred backend plus optional fallback
#[derive(Clone)]
pub struct Invoker {
    primary: Arc<dyn Backend>,
    secondary: Option<Arc<dyn Backend>>,
}

impl Invoker {
    pub fn new(primary: Arc<dyn Backend>, secondary: Option<Arc<dyn Backend>>) -> Self {
        Self { primary, secondary }
    }

    /// Build both backends that the environment supports, preferred one first
    pub fn from_selection(config: &Config, selection: &BackendSelection) -> Result<Self, ConfigError> {
        let cli: Option<Arc<dyn Backend>> = selection.cli_program.as_ref().map(|program| {
            Arc::new(CliBackend::new(program.clone(), config.call_timeout)) as Arc<dyn Backend>
        });
        let api: Option<Arc<dyn Backend>> = config.anthropic_api_key.as_ref().map(|key| {
            Arc::new(ApiBackend::from_config(config, key)) as Arc<dyn Backend>
        });

        let (primary, secondary) = match selection.method {
            BackendKind::Cli => (cli.ok_or(ConfigError::CliUnavailable)?, api),
            BackendKind::Api => (api.ok_or(ConfigError::ApiKeyMissing)?, cli),
        };

        if let Some(ref s) = secondary {
            info!("Backend: {} (fallback: {})", primary.kind(), s.kind());
        } else {
            info!("Backend: {} (no fallback configured)", primary.kind());
        }

        Ok(Self::new(primary, secondary))
    }

    pub fn primary_kind(&self) -> BackendKind {
        self.primary.kind()
    }

    pub fn fallback_kind(&self) -> Option<BackendKind> {
        self.secondary.as_ref().map(|s| s.kind())
    }

    pub async fn invoke(&self, prompt: &str, working_dir: &Path) -> Result<Invocation, BackendError> {
        invoke_with_fallback(
            self.primary.as_ref(),
            self.secondary.as_deref(),
            prompt,
            working_dir,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        kind: BackendKind,
        reply: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn ok(kind: BackendKind, reply: &'static str) -> Self {
            Self { kind, reply: Some(reply), calls: AtomicUsize::new(0) }
        }

        fn failing(kind: BackendKind) -> Self {
            Self { kind, reply: None, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Backend for Scripted {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn invoke(&self, _prompt: &str, _dir: &Path) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply {
                Some(r) => Ok(r.to_string()),
                None => Err(BackendError::ExitStatus {
                    code: Some(1),
                    output: format!("{} broke", self.kind),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_primary_success_skips_secondary() {
        let cli = Scripted::ok(BackendKind::Cli, "from cli");
        let api = Scripted::ok(BackendKind::Api, "from api");

        let out = invoke_with_fallback(&cli, Some(&api), "hi", Path::new(".")).await.unwrap();
        assert_eq!(out.text, "from cli");
        assert_eq!(out.kind, BackendKind::Cli);
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_is_symmetric() {
        let api = Scripted::failing(BackendKind::Api);
        let cli = Scripted::ok(BackendKind::Cli, "from cli");

        let out = invoke_with_fallback(&api, Some(&cli), "hi", Path::new(".")).await.unwrap();
        assert_eq!(out.kind, BackendKind::Cli);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cli.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_fail_surfaces_primary_error() {
        let cli = Scripted::failing(BackendKind::Cli);
        let api = Scripted::failing(BackendKind::Api);

        let err = invoke_with_fallback(&cli, Some(&api), "hi", Path::new("."))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cli broke"));
    }

    #[tokio::test]
    async fn test_no_secondary_retries_nothing() {
        let cli = Scripted::failing(BackendKind::Cli);
        let err = invoke_with_fallback(&cli, None, "hi", Path::new(".")).await;
        tokio_test::assert_err!(err);
        assert_eq!(cli.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kind_other() {
        assert_eq!(BackendKind::Cli.other(), BackendKind::Api);
        assert_eq!(BackendKind::Api.other(), BackendKind::Cli);
        assert_eq!(BackendKind::Api.to_string(), "api");
    }

    #[test]
    fn test_timeout_message() {
        let err = BackendError::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "Timed out after 300s");
    }
}
