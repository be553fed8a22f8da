//! TavernDB Engine - Main entry point.
//!
//! Applies one service response to a session and prints the result:
//!
//! ```text
//! taverndb-engine <session-id> <service> [response-file]
//! ```
//!
//! The response is read from `response-file`, or from stdin when omitted.

use std::io::Read;
use std::path::PathBuf;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use taverndb_engine::infrastructure::app_settings::EngineSettings;
use taverndb_engine::use_cases::TurnOutcome;
use taverndb_engine::App;
use taverndb_shared::ServiceKind;

const USAGE: &str = "usage: taverndb-engine <session-id> <service> [response-file]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from repo root (the engine may run from `crates/engine`).
    load_dotenv_from_repo_root();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taverndb_engine=debug,taverndb_domain=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut args = std::env::args().skip(1);
    let session_id = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?;
    let service: ServiceKind = args
        .next()
        .ok_or_else(|| anyhow::anyhow!(USAGE))?
        .parse()
        .map_err(|e: String| anyhow::anyhow!("{}\n{}", e, USAGE))?;
    let response_file = args.next().map(PathBuf::from);

    let settings = EngineSettings::from_env();
    tracing::info!(
        session_id = %session_id,
        service = %service,
        db_path = ?settings.db_path,
        "Starting TavernDB Engine"
    );
    let app = App::new(settings).await?;

    let handle = match response_file {
        Some(path) => app.submit_turn(session_id, service, move |attempt| {
            let path = path.clone();
            async move {
                tracing::debug!(attempt, path = %path.display(), "Reading service response");
                Ok::<_, anyhow::Error>(tokio::fs::read_to_string(&path).await?)
            }
        }),
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            app.submit_turn(session_id, service, move |_| {
                let raw = raw.clone();
                async move { Ok::<_, anyhow::Error>(raw) }
            })
        }
    };

    let outcome = handle.join().await?;
    app.shutdown().await;

    match outcome {
        TurnOutcome::Unparseable { error, .. } => {
            anyhow::bail!(
                "Service response could not be parsed: {}",
                error.unwrap_or_else(|| "unknown error".into())
            );
        }
        TurnOutcome::Applied(report) => {
            for log in &report.logs {
                println!("[{}] {}", log.sender, log.text);
            }
            for (index, option) in report.action_options.iter().enumerate() {
                println!("[{}] {}", index + 1, option);
            }
            for reject in &report.rejected {
                println!("[guard] {} dropped ({})", reject.action, reject.reason);
            }
            tracing::info!(
                tx_id = report.tx_id.as_deref().unwrap_or("-"),
                rolled_back = report.rolled_back,
                applied_patches = report.applied_patches,
                projected_ledger = report.projected_ledger.len(),
                "Turn finished"
            );
            println!("{}", serde_json::to_string_pretty(&report.snapshot)?);
        }
    }

    Ok(())
}

fn load_dotenv_from_repo_root() {
    let repo_root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..");

    // Prefer local overrides.
    for filename in [".env.local", ".env"] {
        let path = repo_root.join(filename);
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }
}
