//! Telegram Bot integration
//!
//! Maps chat events onto bridge calls and bridge results onto replies.
//! Every inbound update goes through the allow-list; anything that reaches
//! the assistant also goes through the rate limiter.
//!
//! Uses explicit Dispatcher pattern for reliable message polling.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    dptree,
    error_handlers::LoggingErrorHandler,
    prelude::*,
    types::{
        ChatAction, InlineKeyboardMarkup, InputFile, MessageId, ParseMode, Update,
    },
};
use tracing::{debug, error, info, warn};

use crate::auth::{AllowList, RateLimiter};
use crate::backend::Invoker;
use crate::bridge::Bridge;
use crate::config::{Config, Context};
use crate::git_ops::{self, GitRepo};
use crate::sanitize::{sanitize, sanitize_file_content};
use crate::session::SessionRegistry;
use crate::telegram_ui::{
    chunk_message, format_git_log, format_inline_diff, format_pull, format_response,
    format_sessions, format_status, html_escape, html_to_plain, patch_file_name,
    result_keyboard, safe_preview, status_keyboard, truncate_chars, ButtonAction, INLINE_DIFF_LIMIT,
    MAX_DIFF_FILES, MAX_MESSAGE_CHARS,
};

pub const RUN_TESTS_PROMPT: &str = "Run the full test suite and show results";
pub const RUN_BUILD_PROMPT: &str = "Run the build process";

const APOLOGY: &str =
    "❌ An error occurred while processing your request. Please try again or contact support.";

/// Outcome of the access checks for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Unauthorized,
    RateLimited,
}

/// Shared state behind every handler
pub struct AppState {
    pub config: Config,
    pub bridge: Bridge,
    pub allow_list: AllowList,
    pub rate_limiter: RateLimiter,
    /// Per-user context selection; missing means the default
    user_contexts: RwLock<HashMap<i64, Context>>,
}

impl AppState {
    pub fn new(config: Config, bridge: Bridge) -> Self {
        let allow_list = AllowList::new(config.allowed_users.iter().copied());
        let rate_limiter = RateLimiter::new(config.max_requests_per_minute);
        Self {
            config,
            bridge,
            allow_list,
            rate_limiter,
            user_contexts: RwLock::new(HashMap::new()),
        }
    }

    /// Allow-list first, then (optionally) the rate limiter.
    /// Unauthorized requests never touch the limiter.
    pub async fn admit(&self, user_id: i64, rate_limited: bool) -> Admission {
        if !self.allow_list.is_authorized(user_id) {
            warn!("Unauthorized access attempt from user {}", user_id);
            return Admission::Unauthorized;
        }
        if rate_limited && !self.rate_limiter.check(user_id).await {
            warn!("Rate limit exceeded for user {}", user_id);
            return Admission::RateLimited;
        }
        Admission::Allowed
    }

    pub fn context_for(&self, user_id: i64) -> Context {
        self.user_contexts
            .read()
            .get(&user_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_context(&self, user_id: i64, context: Context) {
        self.user_contexts.write().insert(user_id, context);
    }

    pub fn dir_for(&self, user_id: i64) -> &Path {
        self.bridge.working_dir(self.context_for(user_id).as_str())
    }
}

pub fn unauthorized_text(user_id: i64) -> String {
    format!("❌ Unauthorized. Your ID: {}", user_id)
}

pub const RATE_LIMITED_TEXT: &str = "⚠️ Slow down! You've hit the rate limit. Try again in a minute.";

/// Run Telegram bot with explicit Dispatcher for reliable polling
pub async fn run_telegram_bot(config: Config, invoker: Invoker) -> Result<()> {
    info!("===========================================");
    info!("  Code Relay Telegram - Starting...");
    info!("===========================================");
    info!(
        "Allowed users: {}",
        if config.allowed_users.is_empty() {
            "ALL".to_string()
        } else {
            format!("{:?}", config.allowed_users)
        }
    );
    info!("Project root: {:?}", config.project_root);
    info!(
        "Backend: {} (fallback: {})",
        invoker.primary_kind(),
        invoker
            .fallback_kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    info!("Rate limiter: {} req/min per user", config.max_requests_per_minute);

    let bot = Bot::new(config.telegram_token.clone());

    info!("Verifying bot token...");
    match bot.get_me().await {
        Ok(me) => info!(
            "Bot authenticated: @{} (ID: {})",
            me.username.as_deref().unwrap_or("unknown"),
            me.id
        ),
        Err(e) => {
            error!("Failed to authenticate bot: {}", e);
            anyhow::bail!("Bot authentication failed: {}", e);
        }
    }

    info!("Clearing webhook (if any)...");
    if let Err(e) = bot.delete_webhook().await {
        warn!("Failed to delete webhook: {} (continuing anyway)", e);
    }

    let registry = Arc::new(SessionRegistry::new(
        config.contexts.clone(),
        config.session_history_limit,
    ));
    Arc::clone(&registry).spawn_sweeper(config.session_timeout);

    let state = Arc::new(AppState::new(config, Bridge::new(registry, invoker)));

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(message_handler))
        .branch(Update::filter_callback_query().endpoint(callback_handler));

    info!("Starting dispatcher with long polling...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd);
        })
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Error in message handler",
        ))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    warn!("Dispatcher stopped");
    Ok(())
}

/// Message handler endpoint for the dispatcher
async fn message_handler(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id;
    if let Err(e) = handle_message(&bot, &msg, &state).await {
        error!("Error handling message: {:#}", e);
        let _ = bot.send_message(chat_id, APOLOGY).await;
    }
    Ok(())
}

/// Callback query handler for inline keyboard buttons
async fn callback_handler(
    bot: Bot,
    query: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let chat_id = query.message.as_ref().map(|m| m.chat().id);
    if let Err(e) = handle_callback(&bot, &query, &state).await {
        error!("Callback handling failed: {:#}", e);
        if let Some(chat_id) = chat_id {
            let _ = bot
                .send_message(chat_id, format!("❌ Error: {}", sanitize(&e.to_string())))
                .await;
        }
    }
    Ok(())
}

async fn handle_message(bot: &Bot, msg: &Message, state: &AppState) -> Result<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);
    let chat_id = msg.chat.id;

    if let Some(text) = msg.text() {
        let preview: String = text.chars().take(50).collect();
        info!(">>> Message received: user={}, chat={}, text={:?}", user_id, chat_id, preview);

        if text.starts_with('/') {
            return handle_command(bot, chat_id, state, user_id, text).await;
        }
        return handle_prompt(bot, chat_id, state, user_id, text).await;
    }

    if msg.voice().is_some() {
        return handle_voice(bot, msg, state, user_id).await;
    }

    debug!("Ignoring non-text message from {}", user_id);
    Ok(())
}

/// Forward a coding request to the bridge and reply with the result
async fn handle_prompt(
    bot: &Bot,
    chat_id: ChatId,
    state: &AppState,
    user_id: i64,
    text: &str,
) -> Result<()> {
    match state.admit(user_id, true).await {
        Admission::Allowed => {}
        Admission::Unauthorized => {
            bot.send_message(chat_id, unauthorized_text(user_id)).await?;
            return Ok(());
        }
        Admission::RateLimited => {
            bot.send_message(chat_id, RATE_LIMITED_TEXT).await?;
            return Ok(());
        }
    }

    let preview: String = text.chars().take(100).collect();
    info!("User {} request: {}", user_id, preview);

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;

    let context = state.context_for(user_id);
    let result = state.bridge.execute(user_id, text, context.as_str()).await;

    let response = format_response(&result);
    send_html(bot, chat_id, &response, result_keyboard(&result)).await?;

    if result.has_changes() {
        send_diffs(bot, chat_id, &result.working_dir, &result.files_changed).await;
    }

    Ok(())
}

async fn handle_voice(bot: &Bot, msg: &Message, state: &AppState, user_id: i64) -> Result<()> {
    let chat_id = msg.chat.id;
    if !state.allow_list.is_authorized(user_id) {
        bot.send_message(chat_id, unauthorized_text(user_id)).await?;
        return Ok(());
    }

    match msg.caption().filter(|c| !c.trim().is_empty()) {
        Some(caption) => {
            info!("Voice transcription received: {}", caption.chars().take(100).collect::<String>());
            bot.send_message(
                chat_id,
                format!("🎤 You said: <i>{}</i>\n\nProcessing...", html_escape(&sanitize(caption))),
            )
            .parse_mode(ParseMode::Html)
            .await?;
            handle_prompt(bot, chat_id, state, user_id, caption).await
        }
        None => {
            bot.send_message(
                chat_id,
                "🎤 Voice message received! Unfortunately, I couldn't get the transcription.\n\n\
                Tip: Make sure voice-to-text is enabled in your Telegram settings, \
                or send a text message instead.",
            )
            .await?;
            Ok(())
        }
    }
}

async fn handle_command(
    bot: &Bot,
    chat_id: ChatId,
    state: &AppState,
    user_id: i64,
    text: &str,
) -> Result<()> {
    let mut parts = text.split_whitespace();
    let raw = parts.next().unwrap_or("");
    // "/status@my_bot" -> "/status"
    let cmd = raw.split('@').next().unwrap_or(raw);
    let arg = parts.next();

    let rate_limited = cmd == "/status";
    match state.admit(user_id, rate_limited).await {
        Admission::Allowed => {}
        Admission::Unauthorized => {
            bot.send_message(
                chat_id,
                format!(
                    "❌ You are not authorized to use this bot.\nYour Telegram ID: {}",
                    user_id
                ),
            )
            .await?;
            return Ok(());
        }
        Admission::RateLimited => {
            bot.send_message(chat_id, "⚠️ Rate limit exceeded. Please wait a moment.")
                .await?;
            return Ok(());
        }
    }

    match cmd {
        "/start" => {
            send_html(bot, chat_id, &welcome_text(state.context_for(user_id)), None).await?;
        }
        "/help" => {
            send_html(bot, chat_id, HELP_TEXT, None).await?;
        }
        "/status" => {
            bot.send_chat_action(chat_id, ChatAction::Typing).await?;
            let context = state.context_for(user_id);
            let dir = state.dir_for(user_id);
            let status = state.bridge.status(context.as_str()).await;
            send_html(
                bot,
                chat_id,
                &format_status(context.as_str(), dir, &status),
                Some(status_keyboard()),
            )
            .await?;
        }
        "/context" => match arg {
            None => {
                let current = state.context_for(user_id);
                send_html(
                    bot,
                    chat_id,
                    &format!(
                        "Current context: <b>{}</b>\n\nUsage: <code>/context backend|frontend|root</code>",
                        current
                    ),
                    None,
                )
                .await?;
            }
            Some(name) => match Context::parse(name) {
                Some(context) => {
                    state.set_context(user_id, context);
                    let dir = state.bridge.working_dir(context.as_str());
                    info!("User {} switched to {} context", user_id, context);
                    send_html(
                        bot,
                        chat_id,
                        &format!(
                            "✅ Switched to <b>{}</b> context\nWorking directory: <code>{}</code>",
                            context,
                            html_escape(&dir.display().to_string())
                        ),
                        None,
                    )
                    .await?;
                }
                None => {
                    bot.send_message(
                        chat_id,
                        format!("❌ Invalid context. Choose from: {}", Context::names()),
                    )
                    .await?;
                }
            },
        },
        "/sessions" => {
            let sessions = state.bridge.registry().sessions_for_user(user_id);
            send_html(bot, chat_id, &format_sessions(&sessions, chrono::Utc::now()), None).await?;
        }
        "/cancel" => {
            bot.send_message(chat_id, "✅ Operation cancelled").await?;
        }
        _ => {
            bot.send_message(chat_id, "Unknown command. Use /help to see what I can do.")
                .await?;
        }
    }

    Ok(())
}

async fn handle_callback(bot: &Bot, query: &CallbackQuery, state: &AppState) -> Result<()> {
    let user_id = query.from.id.0 as i64;

    if !state.allow_list.is_authorized(user_id) {
        bot.answer_callback_query(&query.id).text("Unauthorized").await?;
        return Ok(());
    }
    bot.answer_callback_query(&query.id).await?;

    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Some(message) = query.message.as_ref() else {
        return Ok(());
    };
    let chat_id = message.chat().id;
    let message_id = message.id();

    info!("Callback query: user={}, data={}", user_id, data);

    let Some(action) = ButtonAction::decode(data) else {
        debug!("Unknown callback data: {}", data);
        return Ok(());
    };

    match action {
        ButtonAction::RunTests | ButtonAction::RunBuild => {
            let (progress, prompt) = if action == ButtonAction::RunTests {
                ("🧪 Running tests...", RUN_TESTS_PROMPT)
            } else {
                ("🔨 Running build...", RUN_BUILD_PROMPT)
            };

            if state.admit(user_id, true).await == Admission::RateLimited {
                bot.send_message(chat_id, RATE_LIMITED_TEXT).await?;
                return Ok(());
            }

            edit_html(bot, chat_id, message_id, progress).await?;
            let context = state.context_for(user_id);
            let result = state.bridge.execute(user_id, prompt, context.as_str()).await;
            edit_html(bot, chat_id, message_id, &format_response(&result)).await?;
        }
        ButtonAction::GitLog => {
            edit_html(bot, chat_id, message_id, "📊 Fetching git log...").await?;
            let dir = state.dir_for(user_id).to_path_buf();
            let log = tokio::task::spawn_blocking(move || GitRepo::open(&dir)?.log(10)).await?;
            let text = match log {
                Ok(commits) => format_git_log(&commits),
                Err(e) => format!("❌ {}", html_escape(&sanitize(&e.to_string()))),
            };
            edit_html(bot, chat_id, message_id, &text).await?;
        }
        ButtonAction::GitPull => {
            edit_html(bot, chat_id, message_id, "🔄 Pulling latest changes...").await?;
            let text = match git_ops::pull(state.dir_for(user_id)).await {
                Ok(output) => format_pull(&output),
                Err(e) => format!(
                    "❌ Git pull failed:\n<pre>{}</pre>",
                    safe_preview(&e.to_string(), 500)
                ),
            };
            edit_html(bot, chat_id, message_id, &text).await?;
        }
        ButtonAction::Approve(what) => {
            debug!("User {} approved {}", user_id, what);
            edit_html(bot, chat_id, message_id, "✅ Approved").await?;
        }
        ButtonAction::Reject(what) => {
            debug!("User {} rejected {}", user_id, what);
            edit_html(bot, chat_id, message_id, "❌ Rejected").await?;
        }
    }

    Ok(())
}

/// Working-tree diffs for the first few changed files, sanitized
fn collect_diffs(working_dir: &Path, files: &[String]) -> Vec<(String, String)> {
    let repo = match GitRepo::open(working_dir) {
        Ok(repo) => repo,
        Err(e) => {
            debug!("No diffs for {:?}: {}", working_dir, e);
            return Vec::new();
        }
    };

    files
        .iter()
        .take(MAX_DIFF_FILES)
        .filter_map(|path| match repo.diff_file(path) {
            Ok(diff) if !diff.is_empty() => Some((path.clone(), sanitize_file_content(&diff, path))),
            Ok(_) => None,
            Err(e) => {
                error!("Failed to get diff for {}: {}", path, e);
                None
            }
        })
        .collect()
}

async fn send_diffs(bot: &Bot, chat_id: ChatId, working_dir: &Path, files: &[String]) {
    let dir = working_dir.to_path_buf();
    let files = files.to_vec();
    let diffs = match tokio::task::spawn_blocking(move || collect_diffs(&dir, &files)).await {
        Ok(diffs) => diffs,
        Err(e) => {
            error!("Diff collection task failed: {}", e);
            return;
        }
    };

    for (path, diff) in diffs {
        let sent = if diff.chars().count() > INLINE_DIFF_LIMIT {
            bot.send_document(
                chat_id,
                InputFile::memory(diff.into_bytes()).file_name(patch_file_name(&path)),
            )
            .await
            .map(|_| ())
        } else {
            bot.send_message(chat_id, format_inline_diff(&path, &diff))
                .parse_mode(ParseMode::Html)
                .await
                .map(|_| ())
        };
        if let Err(e) = sent {
            error!("Failed to send diff for {}: {}", path, e);
        }
    }
}

/// Send HTML in chunks; a chunk Telegram rejects is resent as plain text.
/// The keyboard rides on the last chunk.
async fn send_html(
    bot: &Bot,
    chat_id: ChatId,
    html: &str,
    markup: Option<InlineKeyboardMarkup>,
) -> Result<()> {
    if html.trim().is_empty() {
        bot.send_message(chat_id, "(no response)").await?;
        return Ok(());
    }

    let chunks = chunk_message(html, MAX_MESSAGE_CHARS);
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.into_iter().enumerate() {
        let markup = if i == last { markup.clone() } else { None };

        let mut request = bot.send_message(chat_id, chunk.clone()).parse_mode(ParseMode::Html);
        if let Some(ref m) = markup {
            request = request.reply_markup(m.clone());
        }
        if let Err(e) = request.await {
            debug!("HTML send failed ({}), falling back to plain text", e);
            let mut plain = bot.send_message(chat_id, html_to_plain(&chunk));
            if let Some(m) = markup {
                plain = plain.reply_markup(m);
            }
            plain.await?;
        }
    }
    Ok(())
}

async fn edit_html(bot: &Bot, chat_id: ChatId, message_id: MessageId, html: &str) -> Result<()> {
    let text = truncate_chars(html, MAX_MESSAGE_CHARS);
    if let Err(e) = bot
        .edit_message_text(chat_id, message_id, text)
        .parse_mode(ParseMode::Html)
        .await
    {
        debug!("HTML edit failed ({}), falling back to plain text", e);
        bot.edit_message_text(chat_id, message_id, html_to_plain(text))
            .await?;
    }
    Ok(())
}

fn welcome_text(context: Context) -> String {
    format!(
        "🤖 <b>Code Relay</b> - chat with your coding assistant\n\n\
        <b>Quick Commands:</b>\n\
        /status - Check project status\n\
        /context backend|frontend|root - Switch working context\n\
        /sessions - View active sessions\n\
        /cancel - Cancel current operation\n\
        /help - Show help\n\n\
        <b>Just chat naturally:</b>\n\
        • \"Fix the billing API authentication bug\"\n\
        • \"Add tests for the export feature\"\n\
        • \"Review my latest changes\"\n\
        • \"Run the test suite\"\n\n\
        Voice messages with a transcription caption work too. 🎤\n\n\
        <b>Current context:</b> {}\n\
        <b>Ready to code!</b> 🚀",
        context
    )
}

const HELP_TEXT: &str = "📚 <b>Help</b>\n\n\
    <b>Commands:</b>\n\
    /start - Welcome message\n\
    /status - Git status, service checks and quick actions\n\
    /context &lt;backend|frontend|root&gt; - Switch working directory\n\
    /sessions - Your active sessions\n\
    /cancel - Cancel current operation\n\
    /help - Show this help\n\n\
    <b>Coding:</b>\n\
    Send a message describing what you want done. Changed files are listed \
    with their diffs, and test results are summarised when the assistant runs tests.\n\n\
    <b>Contexts:</b>\n\
    • <code>backend</code> - backend service code\n\
    • <code>frontend</code> - mobile / web app\n\
    • <code>root</code> - full project access";

/// Standalone bot that tells users their Telegram id
pub async fn run_whoami_bot(token: &str) -> Result<()> {
    info!("===========================================");
    info!("  Telegram User ID Finder");
    info!("  Send any message to the bot to get your ID");
    info!("===========================================");

    let bot = Bot::new(token.to_string());
    let handler = Update::filter_message().endpoint(whoami_handler);

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .error_handler(LoggingErrorHandler::with_custom_text("Error in whoami handler"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn whoami_handler(bot: Bot, msg: Message) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    info!(
        "User ID: {} Name: {} Username: @{}",
        user.id,
        user.first_name,
        user.username.as_deref().unwrap_or("None")
    );
    bot.send_message(msg.chat.id, whoami_text(
        user.id.0 as i64,
        &user.first_name,
        user.username.as_deref(),
        user.language_code.as_deref(),
    ))
    .parse_mode(ParseMode::Html)
    .await?;
    Ok(())
}

pub fn whoami_text(
    user_id: i64,
    first_name: &str,
    username: Option<&str>,
    language: Option<&str>,
) -> String {
    format!(
        "🆔 Your Telegram Information:\n\n\
        <b>User ID:</b> {}\n\
        <b>First Name:</b> {}\n\
        <b>Username:</b> @{}\n\
        <b>Language:</b> {}\n\n\
        Copy this to use in ALLOWED_USER_IDS:\n<code>{}</code>",
        user_id,
        html_escape(first_name),
        html_escape(username.unwrap_or("None")),
        html_escape(language.unwrap_or("unknown")),
        user_id
    )
}
