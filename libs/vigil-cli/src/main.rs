// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! vigil CLI
//!
//! Runs one monitor pipeline from a declarative description until an
//! external stop request (Ctrl+C / SIGTERM). Exit status is 0 on clean
//! shutdown, non-zero on assembly or start failure.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use vigil::core::{assemble, topics, HostConfig, PipelineDescription};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about = "Monitor media pipeline host", long_about = None)]
struct Cli {
    /// Pipeline description file (JSON)
    #[arg(long, value_name = "FILE")]
    pipeline: Option<PathBuf>,

    /// Directory to scan for a pipeline description (first *.json wins)
    #[arg(long = "pipelines-dir", value_name = "DIR")]
    pipelines_dir: Option<PathBuf>,

    /// Root directory for kind-based stage resolution (default: plugins)
    #[arg(long = "plugin-root", value_name = "DIR")]
    plugin_root: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let pipeline_file = resolve_pipeline_file(&cli)?;
    tracing::info!("using pipeline '{}'", pipeline_file.display());

    let description = PipelineDescription::from_json_file(&pipeline_file)
        .with_context(|| format!("failed to load '{}'", pipeline_file.display()))?;
    let mut config = HostConfig::from_description(&description)?;
    if let Some(root) = cli.plugin_root {
        config.plugin_root = root;
    }

    let mut pipeline = assemble(&description, config).context("failed to assemble pipeline")?;

    // Echo stage and host events into the log stream.
    let _echo = pipeline.bus().subscribe(topics::PLUGIN_EVENT, |json| {
        tracing::info!("event: {}", json);
    });

    pipeline.start().context("failed to start pipeline")?;

    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        stop_tx.send(()).ok();
    })
    .context("failed to install shutdown handler")?;

    tracing::info!("[{}] running; press Ctrl+C to stop", pipeline.label());
    stop_rx.recv().ok();

    pipeline.stop();
    Ok(())
}

/// Pick the pipeline file from `--pipeline`, or scan `--pipelines-dir` for
/// the first JSON description (lexicographic, for determinism).
fn resolve_pipeline_file(cli: &Cli) -> Result<PathBuf> {
    if let Some(file) = &cli.pipeline {
        return Ok(file.clone());
    }
    let Some(dir) = &cli.pipelines_dir else {
        bail!("one of --pipeline or --pipelines-dir is required");
    };
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read pipelines directory '{}'", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    candidates.sort();
    match candidates.into_iter().next() {
        Some(path) => Ok(path),
        None => bail!("no pipeline JSON found in '{}'", dir.display()),
    }
}
