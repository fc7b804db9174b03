//! Code Relay
//!
//! Telegram front-end for an AI coding assistant. Chat messages are relayed
//! to the Claude Code CLI or the Claude API, and the assistant's output is
//! relayed back with changed files, diffs and test results pulled out of it.
//!
//! # Features
//!
//! - **Backends**: CLI subprocess or Messages API, with one-shot fallback
//! - **Sessions**: per (user, context) working sessions, evicted when idle
//! - **Classification**: changed files and test totals from free-text output
//! - **Access control**: allow-list plus sliding-window rate limiting
//! - **Redaction**: secrets are stripped from everything sent to the chat
//!
//! # Architecture
//!
//! ```text
//! Telegram ──► Auth ──► RateLimiter ──► Bridge ──► Invoker ──► CLI | API
//!                                         │
//!                                         ├── SessionRegistry
//!                                         └── OutputClassifier ──► git2
//!          ◄── Sanitizer ◄── telegram_ui ◄┘
//! ```

pub mod auth;
pub mod backend;
pub mod bridge;
pub mod classifier;
pub mod config;
pub mod git_ops;
pub mod proxy;
pub mod sanitize;
pub mod session;
pub mod telegram;
pub mod telegram_ui;


pub use auth::{AllowList, RateLimiter};
pub use backend::{Backend, BackendError, BackendKind, Invoker};
pub use bridge::{Bridge, ExecutionResult};
pub use classifier::{Classification, OutputClassifier, TestSummary};
pub use config::{Config, ConfigError, Context, ContextTable};
pub use sanitize::{sanitize, sanitize_file_content};
pub use session::{Session, SessionKey, SessionRegistry};
