//! Pass-through proxy mode
//!
//! A bare bot that forwards each text message to the Claude Code CLI with
//! `--continue`, so the CLI keeps one conversation for the project directory.
//! No sessions, no classification, no buttons; only the allow-list and
//! redaction still apply.

use anyhow::{Context as _, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{ChatAction, Update},
};
use tracing::{error, info, warn};

use crate::auth::AllowList;
use crate::backend::{Backend, BackendError, CliBackend};
use crate::config::parse_user_ids;
use crate::sanitize::sanitize;
use crate::telegram_ui::{chunk_message, MAX_MESSAGE_CHARS};

const PROXY_TIMEOUT: Duration = Duration::from_secs(300);

// Paired tags with their content, e.g. <thinking>...</thinking>
static RE_TAG_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>.*?</[^>]+>").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Proxy settings, read from the environment
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub telegram_token: String,
    pub allowed_users: Vec<i64>,
    pub project_dir: PathBuf,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .context("TELEGRAM_BOT_TOKEN not set")?;

        let project_dir = match std::env::var("PROJECT_DIR") {
            Ok(dir) => PathBuf::from(shellexpand::tilde(&dir).into_owned()),
            Err(_) => std::env::current_dir().context("Cannot read current directory")?,
        };

        Ok(Self {
            telegram_token,
            allowed_users: parse_user_ids(&std::env::var("ALLOWED_USER_IDS").unwrap_or_default()),
            project_dir,
        })
    }
}

struct ProxyState {
    cli: CliBackend,
    allow_list: AllowList,
    project_dir: PathBuf,
}

/// Drop tag blocks and stray tags, collapse runs of blank lines
pub fn extract_clean_response(full: &str) -> String {
    let clean = RE_TAG_BLOCK.replace_all(full, "");
    let clean = RE_TAG.replace_all(&clean, "");
    let clean = RE_BLANK_RUNS.replace_all(&clean, "\n\n");
    clean.trim().to_string()
}

/// Reply text for one CLI outcome
fn reply_for(outcome: Result<String, BackendError>) -> String {
    let text = match outcome {
        Ok(out) if out.trim().is_empty() => "No response received".to_string(),
        Ok(out) => extract_clean_response(&out),
        // The CLI's own output explains a failed run better than the exit code
        Err(BackendError::ExitStatus { code, output }) => {
            error!("Claude Code error (exit {:?})", code);
            if output.trim().is_empty() {
                format!("❌ Error: Process exited with code {:?}", code)
            } else {
                extract_clean_response(&output)
            }
        }
        Err(BackendError::Timeout(_)) => "❌ Response timeout (>5 minutes)".to_string(),
        Err(e) => format!("❌ Error: {}", e),
    };
    sanitize(&text)
}

pub async fn run_proxy_bot(config: ProxyConfig) -> Result<()> {
    let Some(program) = CliBackend::detect().await else {
        anyhow::bail!(
            "Claude Code not found. Install with: npm install -g @anthropic-ai/claude-code, \
            then log in with: claude-code login"
        );
    };

    info!("===========================================");
    info!("  Telegram Claude Code Proxy - Starting...");
    info!("===========================================");
    info!("Project: {:?}", config.project_dir);
    info!("Found Claude Code: {}", program);
    if config.allowed_users.is_empty() {
        warn!("ALLOWED_USER_IDS not set - bot will accept anyone!");
    } else {
        info!("Allowed users: {:?}", config.allowed_users);
    }

    let state = Arc::new(ProxyState {
        cli: CliBackend::new(program, PROXY_TIMEOUT).with_args(["--continue"]),
        allow_list: AllowList::new(config.allowed_users.iter().copied()),
        project_dir: config.project_dir,
    });

    let bot = Bot::new(config.telegram_token);
    let handler = Update::filter_message().endpoint(proxy_handler);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .error_handler(LoggingErrorHandler::with_custom_text("Error in proxy handler"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Proxy stopped");
    Ok(())
}

async fn proxy_handler(bot: Bot, msg: Message, state: Arc<ProxyState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let chat_id = msg.chat.id;

    if !state.allow_list.is_authorized(user_id) {
        bot.send_message(chat_id, format!("❌ Unauthorized. Your ID: {}", user_id))
            .await?;
        return Ok(());
    }

    if text.starts_with("/start") || text.starts_with("/help") {
        bot.send_message(
            chat_id,
            "🤖 Telegram Claude Code Proxy\n\n\
            Direct connection to Claude Code running on this machine. \
            Just chat naturally, no commands needed.",
        )
        .await?;
        return Ok(());
    }

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;

    let outcome = state.cli.invoke(text, &state.project_dir).await;
    let reply = reply_for(outcome);

    for chunk in chunk_message(&reply, MAX_MESSAGE_CHARS) {
        bot.send_message(chat_id, chunk).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_clean_response() {
        let raw = "<thinking>\nplan\n</thinking>\nHere is the fix.\n\n\n\n<b>Done</b> now</stray>";
        assert_eq!(extract_clean_response(raw), "Here is the fix.\n\n now");
    }

    #[test]
    fn test_extract_leaves_plain_text() {
        assert_eq!(extract_clean_response("  a\n\nb  "), "a\n\nb");
    }

    #[test]
    fn test_reply_for_outcomes() {
        assert_eq!(reply_for(Ok("   ".into())), "No response received");
        assert_eq!(
            reply_for(Err(BackendError::ExitStatus { code: Some(2), output: "bad flag".into() })),
            "bad flag"
        );
        assert_eq!(
            reply_for(Err(BackendError::Timeout(PROXY_TIMEOUT))),
            "❌ Response timeout (>5 minutes)"
        );
        assert_eq!(reply_for(Ok("key sk_live_abc".into())), "key [STRIPE_LIVE_KEY]");
    }
}
