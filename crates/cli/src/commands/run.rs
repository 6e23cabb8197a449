//! `run` command implementation.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{error, info};

use crate::cli::RunArgs;
use crate::error::CliError;
use crate::pipeline::{Pipeline, PipelineConfig};

/// Execute the `run` command
pub async fn run_pipeline(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    // Validate config path
    if !args.config.exists() {
        return Err(CliError::config_not_found(args.config.display().to_string()).into());
    }

    // Load and parse configuration
    let mut blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Apply CLI overrides
    if let Some(parallelism) = args.parallelism {
        anyhow::ensure!(parallelism >= 1, "--parallelism must be at least 1");
        info!(parallelism, "Overriding worker parallelism from CLI");
        blueprint.workers.parallelism = parallelism;
    }
    if let Some(ref input) = args.input {
        info!(input = %input.display(), "Overriding input file from CLI");
        blueprint.source.input = Some(input.display().to_string());
    }

    info!(
        sink = %blueprint.sink.name,
        sink_type = ?blueprint.sink.sink_type,
        parallelism = blueprint.workers.parallelism,
        input = blueprint.source.input.as_deref().unwrap_or("<stdin>"),
        dead_letter = blueprint.dead_letter.is_some(),
        "Configuration loaded"
    );

    // Dry run - just validate and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&blueprint);
        return Ok(());
    }

    let pipeline_config = PipelineConfig {
        blueprint,
        timeout: if args.timeout == 0 {
            None
        } else {
            Some(Duration::from_secs(args.timeout))
        },
        metrics_port: if args.metrics_port == 0 {
            None
        } else {
            Some(args.metrics_port)
        },
    };

    let pipeline = Pipeline::new(pipeline_config);

    info!("Starting pipeline...");

    let stats = pipeline
        .run(shutdown_signal())
        .await
        .context("Pipeline execution failed")?;

    info!(
        messages = stats.report.messages,
        succeeded = stats.report.succeeded,
        dropped = stats.report.dropped,
        dead_lettered = stats.report.dead_lettered,
        duration_secs = stats.duration.as_secs_f64(),
        "Pipeline finished"
    );
    stats.print_summary();

    if stats.panicked > 0 {
        return Err(CliError::WorkersPanicked {
            count: stats.panicked,
        }
        .into());
    }
    if !stats.abandoned.is_empty() {
        return Err(CliError::WorkersAbandoned {
            ids: stats.abandoned.clone(),
        }
        .into());
    }

    info!("Sinkpipe finished");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
///
/// A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print configuration summary for dry-run mode
fn print_config_summary(blueprint: &contracts::PipelineBlueprint) {
    println!("\n=== Configuration Summary ===\n");
    println!("Source:");
    println!(
        "  Input: {}",
        blueprint.source.input.as_deref().unwrap_or("<stdin>")
    );
    println!("  Default topic: {}", blueprint.source.default_topic);
    println!("  Max batch size: {}", blueprint.source.max_batch_size);

    println!("\nWorkers:");
    println!("  Parallelism: {}", blueprint.workers.parallelism);
    println!("  Shutdown grace: {}ms", blueprint.workers.shutdown_grace_ms);

    let retry = &blueprint.retry;
    println!("\nRetry:");
    match retry.attempt_budget() {
        Some(budget) => println!("  Max attempts: {budget}"),
        None => println!("  Max attempts: unlimited"),
    }
    println!(
        "  Backoff: {:?} {}ms..{}ms x{}",
        retry.backoff, retry.initial_delay_ms, retry.max_delay_ms, retry.factor
    );
    println!("  On exhausted: {:?}", retry.on_exhausted);

    println!("\nSink:");
    println!("  - {} ({:?})", blueprint.sink.name, blueprint.sink.sink_type);

    if let Some(ref dead_letter) = blueprint.dead_letter {
        println!("\nDead letter: {:?}", dead_letter.sink_type);
    }

    println!();
}
