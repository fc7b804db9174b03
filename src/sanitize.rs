//! Secret redaction for everything that leaves the process
//!
//! Rules run in order over the whole text, case-insensitively. Every
//! replacement is itself a fixed point of the rule set, so sanitizing twice
//! gives the same text as sanitizing once.

use once_cell::sync::Lazy;
use regex::Regex;

/// Shown instead of the content of credential files
pub const HIDDEN_FILE_CONTENT: &str = "[SENSITIVE FILE CONTENT HIDDEN]";

/// Path fragments that mark a file as sensitive
const SENSITIVE_FILES: [&str; 9] = [
    ".env",
    ".env.local",
    ".env.production",
    "secrets.json",
    "credentials.json",
    "id_rsa",
    "id_ed25519",
    ".pem",
    ".key",
];

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

fn rule(pattern: &str, replacement: &'static str) -> Rule {
    Rule {
        pattern: Regex::new(&format!("(?i){}", pattern)).unwrap(),
        replacement,
    }
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"sk_live_[a-zA-Z0-9_]+", "[STRIPE_LIVE_KEY]"),
        rule(r"sk_test_[a-zA-Z0-9_]+", "[STRIPE_TEST_KEY]"),
        rule(r"sk-[a-zA-Z0-9]{48}", "[OPENAI_API_KEY]"),
        rule(r"sk-ant-[a-zA-Z0-9_-]+", "[ANTHROPIC_API_KEY]"),
        rule(r"ghp_[a-zA-Z0-9]{36}", "[GITHUB_TOKEN]"),
        rule(r"gho_[a-zA-Z0-9]{36}", "[GITHUB_OAUTH]"),
        rule(r"(password|passwd|pwd)[\s:=]+[^\s,;]+", "${1}: [REDACTED]"),
        rule(r"(token|secret|api_key)[\s:=]+[^\s,;]+", "${1}: [REDACTED]"),
        rule(r"(Bearer|Basic)\s+[^\s]+", "${1} [REDACTED]"),
        rule(r"postgres://[^\s]+", "postgres://[REDACTED]"),
        rule(r"mysql://[^\s]+", "mysql://[REDACTED]"),
        rule(r"mongodb://[^\s]+", "mongodb://[REDACTED]"),
        rule(r"redis://[^\s]+", "redis://[REDACTED]"),
        rule(
            r"(AWS_ACCESS_KEY_ID|AWS_SECRET_ACCESS_KEY)[\s:=]+[^\s]+",
            "${1}: [REDACTED]",
        ),
    ]
});

/// Redact known secret shapes from `text`
pub fn sanitize(text: &str) -> String {
    RULES.iter().fold(text.to_string(), |acc, rule| {
        rule.pattern.replace_all(&acc, rule.replacement).into_owned()
    })
}

/// Hide credential files entirely; redact everything else
pub fn sanitize_file_content(content: &str, file_path: &str) -> String {
    if is_sensitive_path(file_path) {
        return HIDDEN_FILE_CONTENT.to_string();
    }
    sanitize(content)
}

pub fn is_sensitive_path(file_path: &str) -> bool {
    SENSITIVE_FILES.iter().any(|s| file_path.contains(s))
}
