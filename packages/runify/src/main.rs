// packages/runify/src/main.rs
//! Runify command line
//!
//! Evaluates each file argument in one agent and prints the completions as
//! JSON lines. The backend and its options come from `runify.toml` and
//! `RUNIFY__*` variables.

use anyhow::{Context, Result};
use runify::observability::{describe_metrics, init_tracing};
use runify::{Agent, BackendKind, EvalOptions, RunifyConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RunifyConfig::load()?;
    init_tracing(&config.logging)?;
    describe_metrics();

    info!("Starting runify v{}", runify::VERSION);

    let kind: BackendKind = config.backend.parse()?;
    let files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        anyhow::bail!("usage: runify <script.js>...");
    }

    let agent = Agent::create(kind, config.agent.clone()).await?;

    let outcome = run(&agent, &files).await;
    if let Err(e) = agent.destroy().await {
        error!("Destroying agent failed: {}", e);
    }
    outcome
}

async fn run(agent: &Agent, files: &[String]) -> Result<()> {
    for file in files {
        let code = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("reading {}", file))?;

        let completion = agent
            .eval_script(&code, EvalOptions::default())
            .await
            .with_context(|| format!("evaluating {}", file))?;

        println!("{}", serde_json::to_string(&completion)?);
    }
    Ok(())
}
