//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{BatchFailurePolicy, ExhaustedAction, PipelineBlueprint, SinkType};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    sink: String,
    sink_type: String,
    parallelism: usize,
    max_attempts: Option<u32>,
    on_exhausted: String,
    dead_letter: Option<String>,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    // Check file exists
    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    // Try to load and validate
    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(blueprint) => {
            let warnings = collect_warnings(&blueprint);

            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    version: format!("{:?}", blueprint.version),
                    sink: blueprint.sink.name.clone(),
                    sink_type: format!("{:?}", blueprint.sink.sink_type),
                    parallelism: blueprint.workers.parallelism,
                    max_attempts: blueprint.retry.attempt_budget(),
                    on_exhausted: format!("{:?}", blueprint.retry.on_exhausted),
                    dead_letter: blueprint
                        .dead_letter
                        .as_ref()
                        .map(|d| format!("{:?}", d.sink_type)),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(blueprint: &PipelineBlueprint) -> Vec<String> {
    let mut warnings = Vec::new();

    if blueprint.retry.attempt_budget().is_none() {
        warnings.push(
            "retry.max_attempts = 0 retries forever - a poison message stalls its partition's commits"
                .to_string(),
        );
    }

    if blueprint.dead_letter.is_some() && blueprint.retry.on_exhausted == ExhaustedAction::Drop {
        warnings.push(
            "[dead_letter] is configured but retry.on_exhausted = \"drop\" - it will never be used"
                .to_string(),
        );
    }

    if blueprint.sink.sink_type == SinkType::Log {
        warnings.push("Sink type is log - messages are only written to the process log".to_string());
    }

    if blueprint.source.input.is_none() {
        warnings.push("source.input is not set - run will read JSON lines from stdin".to_string());
    }

    if blueprint.workers.shutdown_grace_ms == 0 {
        warnings.push(
            "workers.shutdown_grace_ms = 0 - in-flight batches are abandoned on stop".to_string(),
        );
    }

    if blueprint.on_batch_failure == BatchFailurePolicy::Continue
        && blueprint.workers.parallelism == 1
        && blueprint.retry.attempt_budget().is_none()
    {
        warnings.push(
            "single worker with unlimited retries - a down backend halts all progress".to_string(),
        );
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Sink: {} ({})", summary.sink, summary.sink_type);
            println!("  Parallelism: {}", summary.parallelism);
            match summary.max_attempts {
                Some(attempts) => println!("  Max attempts: {}", attempts),
                None => println!("  Max attempts: unlimited"),
            }
            println!("  On exhausted: {}", summary.on_exhausted);
            if let Some(ref dead_letter) = summary.dead_letter {
                println!("  Dead letter: {}", dead_letter);
            }
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
