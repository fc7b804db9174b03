//! Claude Code CLI backend
//!
//! Spawns the CLI in print mode in the context's working directory and
//! writes the prompt to its stdin, so chat text is never parsed as flags.
//! Bounded by a wall-clock timeout. stdout and stderr are combined.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Backend, BackendError, BackendKind};

/// Executables probed at startup, in order of preference
pub const CLI_CANDIDATES: [&str; 2] = ["claude-code", "claude"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

static RE_ANSI: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

/// Strip ANSI escape codes from CLI output
pub fn strip_ansi_codes(s: &str) -> String {
    RE_ANSI.replace_all(s, "").to_string()
}

#[derive(Debug, Clone)]
pub struct CliBackend {
    program: String,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl CliBackend {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            timeout,
        }
    }

    /// Extra flags passed after `-p` (e.g. `--continue`)
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Find a usable CLI. `claude` only counts if it identifies as Claude Code.
    pub async fn detect() -> Option<String> {
        for candidate in CLI_CANDIDATES {
            match probe_version(candidate).await {
                Some(version) if candidate != "claude" || version.contains("Claude Code") => {
                    info!("Found Claude Code CLI: {} ({})", candidate, version.trim());
                    return Some(candidate.to_string());
                }
                Some(_) => debug!("{} found but does not look like Claude Code", candidate),
                None => debug!("{} not available", candidate),
            }
        }
        None
    }
}

/// Run `<program> --version`; None if missing, failing or slow
pub async fn probe_version(program: &str) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        _ => None,
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }

    async fn invoke(&self, prompt: &str, working_dir: &Path) -> Result<String, BackendError> {
        let start = Instant::now();
        debug!(
            "Invoking {} in {:?}, prompt length: {}",
            self.program,
            working_dir,
            prompt.len()
        );

        let mut child = Command::new(&self.program)
            .arg("-p")
            .args(&self.extra_args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BackendError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let run = async move {
            if let Some(mut stdin) = stdin {
                // EPIPE when the CLI exits without reading; its exit status still counts
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!("Could not write prompt to {}: {}", self.program, e);
                }
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("{} killed after {:?}", self.program, self.timeout);
                return Err(BackendError::Timeout(self.timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut combined = stdout.trim_end().to_string();
        if !stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr.trim_end());
        }
        let combined = strip_ansi_codes(&combined);

        info!(
            "{} completed in {:?} with status: {:?}",
            self.program,
            start.elapsed(),
            output.status
        );

        if !output.status.success() {
            return Err(BackendError::ExitStatus {
                code: output.status.code(),
                output: combined,
            });
        }

        Ok(combined)
    }
}
