//! Code Relay - Entry Point
//!
//! Modes:
//! - Default: Telegram bot relaying to the coding assistant
//! - --proxy / -p: bare pass-through to the Claude Code CLI
//! - --whoami / -w: reply with the sender's Telegram id

use anyhow::Context as _;
use code_relay::backend::Invoker;
use code_relay::config::Config;
use code_relay::proxy::{run_proxy_bot, ProxyConfig};
use code_relay::telegram::{run_telegram_bot, run_whoami_bot};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

fn parse_level(raw: &str) -> Level {
    match raw.trim().to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" | "critical" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let proxy_mode = args.iter().any(|a| a == "--proxy" || a == "-p");
    let whoami_mode = args.iter().any(|a| a == "--whoami" || a == "-w");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("Code Relay v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: code-relay [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --proxy, -p    Pass-through proxy to the Claude Code CLI");
        println!("  --whoami, -w   Reply to any message with the sender's Telegram id");
        println!("  --help, -h     Show this help");
        println!();
        println!("Default: Run the Telegram coding bot");
        println!();
        println!("Environment variables:");
        println!("  TELEGRAM_BOT_TOKEN       Telegram bot token");
        println!("  AUTH_METHOD              api | cli | auto (default: auto)");
        println!("  ANTHROPIC_API_KEY        Claude API key");
        println!("  ALLOWED_USER_IDS         Comma-separated Telegram user ids");
        println!("  PROJECT_ROOT             Project directory (default: /home/ubuntu/project)");
        println!("  BACKEND_DIR/FRONTEND_DIR Context subdirectories under PROJECT_ROOT");
        println!("  CLAUDE_MODEL             Model id for the API backend");
        println!("  CLAUDE_TIMEOUT           Per-request timeout in seconds (default: 300)");
        println!("  MAX_REQUESTS_PER_MINUTE  Per-user rate limit (default: 10)");
        println!("  SESSION_TIMEOUT          Idle session lifetime in seconds (default: 3600)");
        println!("  PROJECT_DIR              Working directory for --proxy (default: cwd)");
        println!("  LOG_LEVEL                trace | debug | info | warn | error");
        return Ok(());
    }

    let log_level = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(|s| parse_level(&s))
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if whoami_mode {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").context("TELEGRAM_BOT_TOKEN not set")?;
        return run_whoami_bot(&token).await;
    }

    if proxy_mode {
        info!("Code Relay proxy v{}", env!("CARGO_PKG_VERSION"));
        let config = ProxyConfig::from_env()?;
        return run_proxy_bot(config).await;
    }

    info!("Code Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let selection = match config.validate().await {
        Ok(selection) => selection,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    let invoker = Invoker::from_selection(&config, &selection)?;
    run_telegram_bot(config, invoker).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }
}
