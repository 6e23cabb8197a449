//! `info` command implementation.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use contracts::PipelineBlueprint;
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    source: SourceInfo,
    workers: WorkerInfo,
    retry: RetryInfo,
    sink: SinkInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    dead_letter: Option<SinkInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<FilterInfo>,
    on_deserialization_error: String,
    on_batch_failure: String,
}

#[derive(Serialize)]
struct SourceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<String>,
    default_topic: String,
    max_batch_size: usize,
    poll_timeout_ms: u64,
}

#[derive(Serialize)]
struct WorkerInfo {
    parallelism: usize,
    shutdown_grace_ms: u64,
}

#[derive(Serialize)]
struct RetryInfo {
    /// None = unlimited
    max_attempts: Option<u32>,
    backoff: String,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    factor: f64,
    jitter: f64,
    on_exhausted: String,
}

#[derive(Serialize)]
struct SinkInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    sink_type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct FilterInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    key_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    equals: Option<String>,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    let blueprint = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.effective {
        let toml = config_loader::ConfigLoader::to_toml(&blueprint)
            .context("Failed to render effective configuration")?;
        print!("{}", toml);
    } else if args.json {
        let info = build_config_info(&blueprint, args.params);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint, args.params);
    }

    Ok(())
}

fn sorted(params: &std::collections::HashMap<String, String>, show: bool) -> BTreeMap<String, String> {
    if !show {
        return BTreeMap::new();
    }
    params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn build_config_info(blueprint: &PipelineBlueprint, show_params: bool) -> ConfigInfo {
    let retry = &blueprint.retry;

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        source: SourceInfo {
            input: blueprint.source.input.clone(),
            default_topic: blueprint.source.default_topic.clone(),
            max_batch_size: blueprint.source.max_batch_size,
            poll_timeout_ms: blueprint.source.poll_timeout_ms,
        },
        workers: WorkerInfo {
            parallelism: blueprint.workers.parallelism,
            shutdown_grace_ms: blueprint.workers.shutdown_grace_ms,
        },
        retry: RetryInfo {
            max_attempts: retry.attempt_budget(),
            backoff: format!("{:?}", retry.backoff),
            initial_delay_ms: retry.initial_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            factor: retry.factor,
            jitter: retry.jitter,
            on_exhausted: format!("{:?}", retry.on_exhausted),
        },
        sink: SinkInfo {
            name: Some(blueprint.sink.name.clone()),
            sink_type: format!("{:?}", blueprint.sink.sink_type),
            params: sorted(&blueprint.sink.params, show_params),
        },
        dead_letter: blueprint.dead_letter.as_ref().map(|d| SinkInfo {
            name: None,
            sink_type: format!("{:?}", d.sink_type),
            params: sorted(&d.params, show_params),
        }),
        filter: blueprint.filter.as_ref().map(|f| FilterInfo {
            key_prefix: f.key_prefix.clone(),
            json_field: f.json_field.clone(),
            equals: f.equals.clone(),
        }),
        on_deserialization_error: format!("{:?}", blueprint.deserialization.on_error),
        on_batch_failure: format!("{:?}", blueprint.on_batch_failure),
    }
}

fn print_params(params: &BTreeMap<String, String>, indent: &str) {
    for (i, (key, value)) in params.iter().enumerate() {
        let prefix = if i == params.len() - 1 { "└─" } else { "├─" };
        println!("{}{} {} = {}", indent, prefix, key, value);
    }
}

fn print_config_info(blueprint: &PipelineBlueprint, show_params: bool) {
    let info = build_config_info(blueprint, show_params);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                 Sinkpipe Configuration                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("📥 Source");
    println!("   ├─ Version: {}", info.version);
    println!(
        "   ├─ Input: {}",
        info.source.input.as_deref().unwrap_or("<stdin>")
    );
    println!("   ├─ Default topic: {}", info.source.default_topic);
    println!("   ├─ Max batch size: {}", info.source.max_batch_size);
    println!("   └─ Poll timeout: {}ms", info.source.poll_timeout_ms);

    println!("\n👷 Workers");
    println!("   ├─ Parallelism: {}", info.workers.parallelism);
    println!("   ├─ Shutdown grace: {}ms", info.workers.shutdown_grace_ms);
    println!("   ├─ On deserialization error: {}", info.on_deserialization_error);
    println!("   └─ On batch failure: {}", info.on_batch_failure);

    let retry = &info.retry;
    println!("\n🔁 Retry");
    match retry.max_attempts {
        Some(attempts) => println!("   ├─ Max attempts: {}", attempts),
        None => println!("   ├─ Max attempts: unlimited"),
    }
    println!(
        "   ├─ Backoff: {} ({}ms → {}ms, x{}, jitter {})",
        retry.backoff, retry.initial_delay_ms, retry.max_delay_ms, retry.factor, retry.jitter
    );
    println!("   └─ On exhausted: {}", retry.on_exhausted);

    if let Some(ref filter) = info.filter {
        println!("\n🔍 Filter");
        if let Some(ref prefix) = filter.key_prefix {
            println!("   ├─ Key prefix: {}", prefix);
        }
        match (&filter.json_field, &filter.equals) {
            (Some(field), Some(equals)) => println!("   └─ {} == {}", field, equals),
            _ => println!("   └─ (no field condition)"),
        }
    }

    println!("\n📤 Sink");
    println!(
        "   └─ {} ({})",
        info.sink.name.as_deref().unwrap_or_default(),
        info.sink.sink_type
    );
    if show_params {
        print_params(&info.sink.params, "      ");
    }

    if let Some(ref dead_letter) = info.dead_letter {
        println!("\n🪦 Dead letter");
        println!("   └─ {}", dead_letter.sink_type);
        if show_params {
            print_params(&dead_letter.params, "      ");
        }
    }

    println!();
}
