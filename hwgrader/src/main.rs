/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use hwgrader::config::TestbedConfig;
use hwgrader::engine::{EngineLayout, HardwareEngine};
use hwgrader::task::deadline_from_secs;
use hwgrader::transport::{HttpResultTransport, LoggingTransport, ResultTransport};

// ── CLI argument definition ───────────────────────────────────────────────────

/// Run one grading task on a hardware testbed.
///
/// Example:
///   hwgrader --config testbed.yaml --inputs submission/ --deadline 30
#[derive(Debug, Parser)]
#[command(
    name = "hwgrader",
    about = "Hardware-in-the-loop grading engine – solo run",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML testbed configuration file.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Per-task workspace shared by the devices.
    #[arg(short = 'w', long = "workspace", default_value = "uploads/files")]
    workspace: PathBuf,

    /// Directory receiving one timestamped backup per task.
    #[arg(short = 'b', long = "backup-root", default_value = "uploads/backups")]
    backup_root: PathBuf,

    /// Directory holding the required input files.
    #[arg(short = 'i', long = "inputs")]
    inputs: PathBuf,

    /// Correlation code reported with the outputs.
    #[arg(short = 's', long = "secret", default_value = "solo")]
    secret: String,

    /// Task deadline in seconds (default 600).
    #[arg(short = 'd', long = "deadline")]
    deadline: Option<f64>,
}

/// Read every required input from `dir`.
fn read_inputs(dir: &Path, names: &[String]) -> Result<HashMap<String, Vec<u8>>> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            let content = std::fs::read(&path)
                .with_context(|| format!("Cannot read input file: {}", path.display()))?;
            Ok((name.clone(), content))
        })
        .collect()
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("hwgrader starting up...");

    let cli = Cli::parse();

    info!(
        config      = %cli.config.display(),
        workspace   = %cli.workspace.display(),
        backup_root = %cli.backup_root.display(),
        inputs      = %cli.inputs.display(),
        deadline    = ?cli.deadline,
        "Configuration"
    );

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = TestbedConfig::load_from_file(&cli.config)?;

    let http = match &config.remote {
        Some(remote) => {
            let http = HttpResultTransport::new(remote, config.testbed_type())
                .context("Cannot create HTTP client")?;
            info!(server = %http.base_url(), "Reporting results to grading service");
            Some(Arc::new(http))
        }
        None => {
            warn!("No remote section configured, results are only logged");
            None
        }
    };
    let transport: Arc<dyn ResultTransport> = match &http {
        Some(http) => Arc::clone(http) as Arc<dyn ResultTransport>,
        None => Arc::new(LoggingTransport),
    };

    let engine = HardwareEngine::new(
        &config,
        EngineLayout {
            workspace: cli.workspace.clone(),
            backup_root: cli.backup_root.clone(),
        },
        Arc::clone(&transport),
    )?;

    if let Err(e) = transport.send_status(engine.get_status()).await {
        warn!("Unable to post status to server: {}", e);
    }
    if let Some(http) = &http {
        if let Err(e) = http.send_summary(engine.get_status()).await {
            warn!("Unable to send testbed summary: {}", e);
        }
    }

    let inputs = read_inputs(&cli.inputs, &config.required_input_files)?;
    let deadline = deadline_from_secs(cli.deadline);
    let mut completions = engine.completions();
    engine
        .request_grade_task(inputs, cli.secret.clone(), Some(deadline))
        .await?;
    info!(
        deadline_secs = deadline.as_secs_f64(),
        "Grading task started"
    );

    // Fires only after the final status has been posted.
    completions
        .changed()
        .await
        .context("Engine shut down before the task completed")?;
    info!(status = %engine.get_status(), "Grading task finished");
    Ok(())
}
