//! Project status: git working tree plus local service liveness
//!
//! Services are probed, not managed. A port that accepts a TCP connection
//! counts as running; celery is looked up by command line with `pgrep`.

use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::git_ops::{GitRepo, StatusSummary};
use crate::sanitize::sanitize;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Cap on the short listing shown in chat
pub const LISTING_LIMIT: usize = 500;

/// What `/status` reports
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    /// Err holds the message when the directory is not a usable repository
    pub git: Result<StatusSummary, String>,
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: &'static str,
    pub running: bool,
}

enum Probe {
    Port(u16),
    Process(&'static str),
}

const SERVICES: [(&str, Probe); 3] = [
    ("django", Probe::Port(8000)),
    ("celery", Probe::Process("celery worker")),
    ("redis", Probe::Port(6379)),
];

pub async fn project_status(working_dir: &Path) -> ProjectStatus {
    let dir = working_dir.to_path_buf();
    let git = tokio::task::spawn_blocking(move || git_status(&dir))
        .await
        .unwrap_or_else(|e| Err(format!("git status task failed: {}", e)));

    let mut services = Vec::with_capacity(SERVICES.len());
    for (name, probe) in &SERVICES {
        let running = match probe {
            Probe::Port(port) => check_port(*port).await,
            Probe::Process(pattern) => check_process(pattern).await,
        };
        services.push(ServiceStatus { name: *name, running });
    }

    ProjectStatus { git, services }
}

fn git_status(working_dir: &Path) -> Result<StatusSummary, String> {
    let mut summary = GitRepo::open(working_dir)
        .and_then(|repo| repo.status_summary())
        .map_err(|e| {
            warn!("Git status failed: {}", e);
            e.to_string()
        })?;
    // Redact before capping so a cut never lands inside a secret
    let listing = sanitize(&summary.listing);
    summary.listing = listing.chars().take(LISTING_LIMIT).collect();
    Ok(summary)
}

pub async fn check_port(port: u16) -> bool {
    let connect = TcpStream::connect(("127.0.0.1", port));
    let open = matches!(tokio::time::timeout(PROBE_TIMEOUT, connect).await, Ok(Ok(_)));
    debug!("Port {} open: {}", port, open);
    open
}

pub async fn check_process(pattern: &str) -> bool {
    let output = Command::new("pgrep")
        .arg("-f")
        .arg(pattern)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) => !out.stdout.is_empty(),
        _ => false,
    }
}
