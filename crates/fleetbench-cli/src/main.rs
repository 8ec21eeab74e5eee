// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Fleetbench CLI.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use fleetbench_core::Workflow;
use fleetbench_master::{ExecutionStatus, LocalDispatcher, MasterOptions, WorkflowMaster};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleetbench")]
#[command(version, about = "Distributed workflow load-testing engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition
    Validate {
        /// Path to workflow file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow standalone, against a single in-process slave
    Run {
        /// Path to workflow file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: String,

        /// Poll interval, in milliseconds, while waiting for completion
        #[arg(long, default_value = "200")]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fleetbench={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run { file, poll_interval_ms } => run_workflow(&file, poll_interval_ms).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_workflow(file_path: &str) -> Result<Workflow> {
    let content = fs::read_to_string(file_path)
        .with_context(|| format!("failed to read workflow file: {}", file_path))?;

    let is_json = Path::new(file_path)
        .extension()
        .map(|ext| ext == "json")
        .unwrap_or(false);

    let workflow = if is_json {
        Workflow::from_json(&content)
    } else {
        Workflow::from_yaml(&content)
    }
    .with_context(|| format!("failed to parse workflow: {}", file_path))?;

    Ok(workflow)
}

fn validate_workflow(file_path: &str) -> Result<()> {
    info!("validating workflow: {}", file_path);
    println!("{} {}", "Validating workflow:".cyan().bold(), file_path);

    let workflow = load_workflow(file_path)?;
    workflow.validate(true).with_context(|| "workflow validation failed")?;

    println!("{}", "\u{2713} Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Version: {}", workflow.version);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Execution mode: {}", workflow.options.mode);

    Ok(())
}

async fn run_workflow(file_path: &str, poll_interval_ms: u64) -> Result<()> {
    info!("running workflow: {}", file_path);
    println!("{} {}", "Running workflow:".cyan().bold(), file_path);

    let workflow = load_workflow(file_path)?;
    workflow.validate(true).with_context(|| "workflow validation failed")?;

    let master = WorkflowMaster::new(MasterOptions::default(), Arc::new(LocalDispatcher::new()));
    master.start().await.with_context(|| "failed to start master")?;

    let (execution_id, submitted) = master.submit_workflow(workflow.clone()).await;
    submitted.with_context(|| "failed to submit workflow")?;

    println!("{}", "Executing workflow...".cyan());

    let status = loop {
        let snapshot = master
            .get_execution_status(&execution_id)
            .await
            .with_context(|| "failed to read execution status")?;

        match snapshot.status {
            ExecutionStatus::Completed | ExecutionStatus::Failed => break snapshot.status,
            _ => tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await,
        }
    };

    let aggregated = master
        .get_metrics(&execution_id)
        .await
        .with_context(|| "failed to aggregate metrics")?;
    let threshold_results = master.evaluate_thresholds(&aggregated, &workflow.options.thresholds);
    let summary = master.generate_summary(&aggregated, &threshold_results);

    master.stop().await.with_context(|| "failed to stop master")?;

    match status {
        ExecutionStatus::Completed => println!("{}", "\u{2713} Workflow completed successfully".green().bold()),
        ExecutionStatus::Failed => println!("{}", "\u{2717} Workflow failed".red().bold()),
        _ => unreachable!("loop only exits on Completed or Failed"),
    }

    println!("\n{}", "Summary:".cyan().bold());
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_else(|_| format!("{:?}", summary))
    );

    if threshold_results.iter().any(|t| !t.passed) {
        anyhow::bail!("one or more thresholds failed");
    }

    if status == ExecutionStatus::Failed {
        anyhow::bail!("workflow execution failed");
    }

    Ok(())
}
