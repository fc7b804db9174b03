//! Telegram UI Components
//!
//! Inline keyboards, callback encoding and the HTML renderings of bridge
//! results. Everything here is pure so it can be tested without a bot.
//! Text that came from the assistant or the filesystem is sanitized before it
//! is escaped.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::bridge::{ExecutionResult, ProjectStatus};
use crate::git_ops::CommitInfo;
use crate::sanitize::sanitize;
use crate::session::SessionInfo;

/// Telegram's hard limit is 4096; stay under it
pub const MAX_MESSAGE_CHARS: usize = 4000;
/// Diffs longer than this go out as a document
pub const INLINE_DIFF_LIMIT: usize = 3500;
/// Diffs sent per result
pub const MAX_DIFF_FILES: usize = 5;

const OUTPUT_PREVIEW: usize = 2000;
const ERROR_OUTPUT_PREVIEW: usize = 1000;
const FILES_SHOWN: usize = 10;

// ============ Inline Keyboards ============

/// Button action types for callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    RunTests,
    RunBuild,
    GitLog,
    GitPull,
    Approve(String), // action name
    Reject(String),  // action name
}

impl ButtonAction {
    /// Encode action as callback data string
    pub fn encode(&self) -> String {
        match self {
            Self::RunTests => "run_tests".to_string(),
            Self::RunBuild => "run_build".to_string(),
            Self::GitLog => "git_log".to_string(),
            Self::GitPull => "git_pull".to_string(),
            Self::Approve(action) => format!("approve_{}", action),
            Self::Reject(action) => format!("reject_{}", action),
        }
    }

    /// Decode callback data string to action
    pub fn decode(data: &str) -> Option<Self> {
        match data {
            "run_tests" => Some(Self::RunTests),
            "run_build" => Some(Self::RunBuild),
            "git_log" => Some(Self::GitLog),
            "git_pull" => Some(Self::GitPull),
            _ => {
                if let Some(action) = data.strip_prefix("approve_") {
                    Some(Self::Approve(action.to_string()))
                } else {
                    data.strip_prefix("reject_")
                        .map(|action| Self::Reject(action.to_string()))
                }
            }
        }
    }
}

fn button(label: &str, action: ButtonAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label.to_string(), action.encode())
}

/// Actions offered under `/status`
pub fn status_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            button("🧪 Run Tests", ButtonAction::RunTests),
            button("🔨 Build", ButtonAction::RunBuild),
        ],
        vec![
            button("📊 Git Log", ButtonAction::GitLog),
            button("🔄 Pull Latest", ButtonAction::GitPull),
        ],
    ])
}

/// Commit / Revert, only when something changed
pub fn result_keyboard(result: &ExecutionResult) -> Option<InlineKeyboardMarkup> {
    if !result.has_changes() {
        return None;
    }
    Some(InlineKeyboardMarkup::new(vec![vec![
        button("✅ Commit Changes", ButtonAction::Approve("commit".to_string())),
        button("❌ Revert", ButtonAction::Reject("revert".to_string())),
    ]]))
}

// ============ Formatting ============

/// HTML escape for Telegram
pub fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap());

/// Undo our own markup, for the plain-text retry when Telegram rejects HTML
pub fn html_to_plain(html: &str) -> String {
    RE_TAG
        .replace_all(html, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Sanitize then escape
fn safe(text: &str) -> String {
    html_escape(&sanitize(text))
}

/// Sanitize the whole text, then cut to `max` chars, then escape.
/// Cutting first could split a secret below the length its rule matches.
pub fn safe_preview(text: &str, max: usize) -> String {
    html_escape(truncate_chars(&sanitize(text), max))
}

/// First `max` chars, never splitting a code point
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Render a bridge result as a chat reply
pub fn format_response(result: &ExecutionResult) -> String {
    if !result.success {
        let error = result.error.as_deref().unwrap_or("Unknown error");
        return format!(
            "❌ {}\n\n{}",
            safe(error),
            safe_preview(&result.output, ERROR_OUTPUT_PREVIEW)
        );
    }

    let output = if result.output.trim().is_empty() {
        "Done".to_string()
    } else {
        safe_preview(&result.output, OUTPUT_PREVIEW)
    };
    let mut response = format!("🤖 {}\n\n", output);

    let files = &result.files_changed;
    if !files.is_empty() {
        response.push_str(&format!("📝 <b>Modified {} file(s):</b>\n", files.len()));
        for f in files.iter().take(FILES_SHOWN) {
            response.push_str(&format!("  • <code>{}</code>\n", safe(f)));
        }
        if files.len() > FILES_SHOWN {
            response.push_str(&format!("  ... and {} more\n", files.len() - FILES_SHOWN));
        }
    }

    let tests = &result.tests;
    if tests.ran {
        let emoji = if tests.all_passed() { "✅" } else { "⚠️" };
        response.push_str(&format!(
            "\n{} <b>Tests:</b> {}/{} passed",
            emoji, tests.passed, tests.total
        ));
        if tests.failed > 0 {
            response.push_str(&format!(", {} failed", tests.failed));
        }
        response.push('\n');
    }

    response
}

pub fn format_status(context: &str, working_dir: &std::path::Path, status: &ProjectStatus) -> String {
    let mut msg = format!(
        "📊 <b>Project Status</b>\n\n<b>Context:</b> {}\n<b>Directory:</b> <code>{}</code>\n\n<b>Git Status:</b>\n",
        html_escape(context),
        html_escape(&working_dir.display().to_string())
    );

    match &status.git {
        Ok(git) if git.clean => msg.push_str("✅ Working tree clean\n"),
        Ok(git) => {
            msg.push_str(&format!(
                "Modified: {}\nAdded: {}\nDeleted: {}\nUntracked: {}\n\n<pre>{}</pre>\n",
                git.modified,
                git.added,
                git.deleted,
                git.untracked,
                safe(&git.listing)
            ));
        }
        Err(e) => msg.push_str(&format!("⚠️ {}\n", safe(e))),
    }

    msg.push_str("\n<b>Services:</b>\n");
    for service in &status.services {
        let (emoji, state) = if service.running {
            ("✅", "Running")
        } else {
            ("❌", "Stopped")
        };
        msg.push_str(&format!("{} {}: {}\n", emoji, capitalize(service.name), state));
    }

    msg
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn format_sessions(sessions: &[SessionInfo], now: DateTime<Utc>) -> String {
    if sessions.is_empty() {
        return "No active sessions.".to_string();
    }

    let mut msg = "<b>Your Active Sessions:</b>\n\n".to_string();
    for s in sessions {
        let idle = (now - s.last_activity).num_seconds().max(0);
        msg.push_str(&format!(
            "• <b>{}</b> (idle {}s)\n  Commands: {}\n\n",
            html_escape(&s.context),
            idle,
            s.interactions
        ));
    }
    msg
}

pub fn format_git_log(commits: &[CommitInfo]) -> String {
    if commits.is_empty() {
        return "<b>Recent Commits:</b>\n(no commits)".to_string();
    }
    let lines: Vec<String> = commits
        .iter()
        .map(|c| format!("{} {}", c.short_hash, c.summary))
        .collect();
    format!("<b>Recent Commits:</b>\n<pre>{}</pre>", safe(&lines.join("\n")))
}

pub fn format_pull(output: &str) -> String {
    format!(
        "✅ Git pull complete:\n<pre>{}</pre>",
        safe_preview(output, 500)
    )
}

/// Inline diff message; `diff` is already sanitized
pub fn format_inline_diff(path: &str, diff: &str) -> String {
    format!(
        "📝 <b>{}</b>\n<pre><code class=\"language-diff\">{}</code></pre>",
        html_escape(path),
        html_escape(diff)
    )
}

/// `<basename>.patch`
pub fn patch_file_name(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    format!("{}.patch", base)
}

/// Split on char boundaries into pieces of at most `max` chars
pub fn chunk_message(text: &str, max: usize) -> Vec<String> {
    if max == 0 {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let head = truncate_chars(remaining, max);
        chunks.push(head.to_string());
        remaining = &remaining[head.len()..];
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::classifier::{Classification, TestSummary};
    use crate::git_ops::StatusSummary;
    use crate::bridge::ServiceStatus;
    use std::path::Path;

    fn ok_result(output: &str, files: Vec<&str>, tests: TestSummary) -> ExecutionResult {
        ExecutionResult::from_output(
            output.to_string(),
            Classification {
                files_changed: files.into_iter().map(String::from).collect(),
                tests,
                is_error: false,
            },
            Path::new("/srv/app"),
            BackendKind::Cli,
        )
    }

    #[test]
    fn test_button_action_encode_decode() {
        for action in [
            ButtonAction::RunTests,
            ButtonAction::RunBuild,
            ButtonAction::GitLog,
            ButtonAction::GitPull,
            ButtonAction::Approve("commit".into()),
            ButtonAction::Reject("revert".into()),
        ] {
            assert_eq!(ButtonAction::decode(&action.encode()), Some(action));
        }
        assert_eq!(ButtonAction::RunTests.encode(), "run_tests");
        assert_eq!(ButtonAction::decode("logs:1"), None);
    }

    #[test]
    fn test_result_keyboard_only_with_changes() {
        assert!(result_keyboard(&ok_result("x", vec![], TestSummary::default())).is_none());
        assert!(result_keyboard(&ok_result("x", vec!["a.rs"], TestSummary::default())).is_some());
    }

    #[test]
    fn test_format_success_with_files_and_tests() {
        let files: Vec<String> = (0..12).map(|i| format!("src/f{}.rs", i)).collect();
        let files: Vec<&str> = files.iter().map(String::as_str).collect();
        let tests = TestSummary { ran: true, passed: 5, failed: 1, skipped: 2, total: 8 };
        let text = format_response(&ok_result("Done <now>", files, tests));

        assert!(text.starts_with("🤖 Done &lt;now&gt;"));
        assert!(text.contains("Modified 12 file(s)"));
        assert!(text.contains("<code>src/f9.rs</code>"));
        assert!(!text.contains("src/f10.rs"));
        assert!(text.contains("... and 2 more"));
        assert!(text.contains("⚠️ <b>Tests:</b> 5/8 passed, 1 failed"));
    }

    #[test]
    fn test_format_truncates_output() {
        let long = "x".repeat(5000);
        let text = format_response(&ok_result(&long, vec![], TestSummary::default()));
        assert_eq!(text.matches('x').count(), 2000);
    }

    #[test]
    fn test_key_across_preview_boundary_is_redacted() {
        // 48-char key starting 40 chars before the 2000-char cut
        let output = format!("{}sk-{}", "a ".repeat(980), "Q".repeat(48));
        let text = format_response(&ok_result(&output, vec![], TestSummary::default()));
        assert!(!text.contains("QQQQ"), "key leaked: {}", text);
        assert!(text.contains("[OPENAI_API_KEY]"));

        let failed = ExecutionResult {
            output: format!("{}ghp_{}", "b".repeat(990), "Z".repeat(36)),
            ..ExecutionResult::failure("Unknown error", Path::new("/srv"))
        };
        let failed_text = format_response(&failed);
        assert!(!failed_text.contains("ZZZZ"));
    }

    #[test]
    fn test_pull_output_redacted_before_cut() {
        let output = format!("{}gho_{}", "c".repeat(480), "W".repeat(36));
        let text = format_pull(&output);
        assert!(!text.contains('W'));
        assert!(text.contains("[GITHUB_OAUTH"));
        assert_eq!(safe_preview("<a&b>", 3), "&lt;a&amp;");
    }

    #[test]
    fn test_format_failure_is_sanitized() {
        let r = ExecutionResult::failure("auth failed: token=abc123", Path::new("/srv"));
        let text = format_response(&r);
        assert!(text.starts_with("❌ auth failed: token: [REDACTED]"));
        assert!(!text.contains("abc123"));
    }

    #[test]
    fn test_format_status() {
        let status = ProjectStatus {
            git: Ok(StatusSummary {
                clean: false,
                modified: 1,
                added: 0,
                deleted: 0,
                untracked: 1,
                listing: " M a.py\n?? b.py".into(),
            }),
            services: vec![
                ServiceStatus { name: "django", running: true },
                ServiceStatus { name: "redis", running: false },
            ],
        };
        let text = format_status("backend", Path::new("/srv/api"), &status);
        assert!(text.contains("Modified: 1"));
        assert!(text.contains("<pre> M a.py\n?? b.py</pre>"));
        assert!(text.contains("✅ Django: Running"));
        assert!(text.contains("❌ Redis: Stopped"));
    }

    #[test]
    fn test_format_git_log() {
        let commits = vec![CommitInfo { short_hash: "abc1234".into(), summary: "Fix <bug>".into() }];
        assert_eq!(
            format_git_log(&commits),
            "<b>Recent Commits:</b>\n<pre>abc1234 Fix &lt;bug&gt;</pre>"
        );
    }

    #[test]
    fn test_patch_file_name() {
        assert_eq!(patch_file_name("src/api/views.py"), "views.py.patch");
        assert_eq!(patch_file_name("README"), "README.patch");
    }

    #[test]
    fn test_chunk_message_respects_char_boundaries() {
        let text = "é".repeat(9001);
        let chunks = chunk_message(&text, MAX_MESSAGE_CHARS);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_MESSAGE_CHARS));
        assert_eq!(chunks.concat(), text);
        assert!(chunk_message("", 10).is_empty());
    }

    #[test]
    fn test_html_to_plain() {
        let html = format_git_log(&[CommitInfo { short_hash: "abc1234".into(), summary: "a < b & c".into() }]);
        assert_eq!(html_to_plain(&html), "Recent Commits:\nabc1234 a < b & c");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("hi", 10), "hi");
        assert_eq!(truncate_chars("日本語", 2), "日本");
    }
}
