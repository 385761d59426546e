mod aggregate;
mod attainment;
mod audit;
mod calc;
mod catalog;
mod db;
mod error;
mod gpa;
mod ipc;
mod outcomes;
mod records;
mod results;
mod scoring;
mod settings;
mod workflow;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    // stdout carries the protocol; logs go to stderr.
    let filter = std::env::var("ASSESSD_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn main() {
    init_logging();

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    if let Some(path) = std::env::var_os("ASSESSD_WORKSPACE").map(PathBuf::from) {
        match state.open_workspace(&path) {
            Ok(()) => tracing::info!(workspace = %path.display(), "workspace opened from environment"),
            Err(e) => tracing::error!(workspace = %path.display(), error = %e, "could not open workspace"),
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer to.
                tracing::warn!(error = %e, "unparseable request line");
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
