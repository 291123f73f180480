use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Table, presets::UTF8_FULL};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use livecopy::core::admission::{self, AdmittedDevice};
use livecopy::core::report::{format_duration, format_size};
use livecopy::core::{
    BatchCoordinator, BatchEvent, BatchMode, BatchResult, DevicePlan, RepartitionRequest,
    RepartitionStrategy, SimulatedExecutor, StorageDeviceFacts, SystemClock,
};
use livecopy::logging::{self, LogConfig};
use livecopy::{adapters, config, context, db};

#[derive(Parser)]
#[command(name = "livecopy")]
#[command(about = "Batch install, upgrade and reset of live-system storage devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a batch for feasibility and show what would be done
    Plan(BatchArgs),
    /// Check and execute a batch
    Run(RunArgs),
    /// List recorded batches
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Show the result table of a recorded batch
    Show {
        id: Uuid,

        #[command(flatten)]
        config: ConfigArgs,
    },
}

/// Options that override configuration file and environment values.
#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    upgrade_margin_percent: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    exchange_partition_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    auto_backup: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    backup_destination: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    step_delay_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct BatchArgs {
    #[arg(long, value_enum)]
    mode: BatchMode,

    /// Size of the system image in bytes
    #[arg(long)]
    system_size: u64,

    /// TOML manifest with device facts; simulated devices are used without one
    #[arg(long)]
    devices: Option<PathBuf>,

    /// Restrict the batch to these device ids, in this order
    #[arg(long = "device")]
    device_ids: Vec<String>,

    /// What to do with an existing exchange partition on upgrade
    #[arg(long, value_enum, default_value_t = RepartitionChoice::Keep)]
    repartition: RepartitionChoice,

    /// New exchange partition size in bytes, for `--repartition resize`
    #[arg(long)]
    exchange_resize: Option<String>,

    /// Print machine-readable JSON instead of tables
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    batch: BatchArgs,

    /// Make the simulated executor fail a device, as `ID=MESSAGE`
    #[arg(long, value_parser = parse_failure)]
    simulate_failure: Vec<(String, String)>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RepartitionChoice {
    Keep,
    Resize,
    Remove,
}

fn parse_failure(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(id, message)| (id.to_string(), message.to_string()))
        .ok_or_else(|| format!("expected ID=MESSAGE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Plan(args) => config::AppConfig::new(Some(&args.config))?,
        Commands::Run(args) => config::AppConfig::new(Some(&args.batch.config))?,
        Commands::History { config, .. } | Commands::Show { config, .. } => {
            config::AppConfig::new(Some(config))?
        }
    };

    logging::init(LogConfig::from(&config));

    match cli.command {
        Commands::Plan(args) => {
            // Planning never records anything.
            let ctx = context::AppContext::new(config, db::init_in_memory().await?);
            run_plan(ctx, args).context("Failed to plan batch")?
        }
        Commands::Run(args) => {
            let db_conn = db::init(&config.database_path()).await?;
            let ctx = context::AppContext::new(config, db_conn);
            run_batch(ctx, args).await.context("Batch failed")?
        }
        Commands::History { limit, .. } => {
            let db_conn = db::init(&config.database_path()).await?;
            run_history(&context::AppContext::new(config, db_conn), limit).await?
        }
        Commands::Show { id, .. } => {
            let db_conn = db::init(&config.database_path()).await?;
            run_show(&context::AppContext::new(config, db_conn), id).await?
        }
    }

    Ok(())
}

/// Resolve the selected devices, in the order they were named.
fn select_devices(
    source: &dyn livecopy::core::DeviceSource,
    ids: &[String],
) -> Result<Vec<StorageDeviceFacts>> {
    let available = source.list_devices()?;
    if ids.is_empty() {
        return Ok(available);
    }

    ids.iter()
        .map(|id| {
            available
                .iter()
                .find(|d| &d.id == id)
                .cloned()
                .ok_or_else(|| anyhow!("Unknown device: {id}"))
        })
        .collect()
}

fn repartition_request(args: &BatchArgs) -> RepartitionRequest {
    match args.repartition {
        RepartitionChoice::Keep => RepartitionRequest::Keep,
        RepartitionChoice::Resize => {
            RepartitionRequest::Resize(args.exchange_resize.clone().unwrap_or_default())
        }
        RepartitionChoice::Remove => RepartitionRequest::Remove,
    }
}

fn run_plan(ctx: context::AppContext, args: BatchArgs) -> Result<()> {
    let source = adapters::get_source(args.devices.as_deref())?;
    let devices = select_devices(source.as_ref(), &args.device_ids)?;
    let options = ctx.batch_options(args.mode, args.system_size, repartition_request(&args));

    let admitted = match admission::admit(&devices, &options) {
        Ok(admitted) => admitted,
        Err(errors) => {
            return Err(livecopy::core::BatchError::Rejected(errors).into());
        }
    };

    if args.json {
        let plans: Vec<_> = admitted
            .iter()
            .map(|d| {
                serde_json::json!({
                    "device": d.facts.id,
                    "name": d.facts.display_name(),
                    "size": d.facts.size,
                    "sequence_number": d.sequence_number,
                    "exchange_label": d.exchange_label,
                    "plan": d.plan,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Device", "Size", "Plan"]);
    for device in &admitted {
        table.add_row(vec![
            number_cell(device.sequence_number),
            device.facts.display_name(),
            format_size(device.facts.size),
            describe_plan(device),
        ]);
    }
    println!("{table}");
    println!("Batch is feasible: {} device(s), mode {}", admitted.len(), args.mode);
    Ok(())
}

async fn run_batch(ctx: context::AppContext, args: RunArgs) -> Result<()> {
    let batch = args.batch;
    let source = adapters::get_source(batch.devices.as_deref())?;
    let devices = select_devices(source.as_ref(), &batch.device_ids)?;
    let options = ctx.batch_options(batch.mode, batch.system_size, repartition_request(&batch));

    let mut executor = SimulatedExecutor::new(Duration::from_millis(ctx.config.step_delay_ms));
    for (id, message) in args.simulate_failure {
        executor = executor.with_failure(id, message);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let coordinator = BatchCoordinator::new(Arc::new(executor), source, ctx.progress.clone())
        .with_events(tx);

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current device");
            cancel.cancel();
        }
    });

    let handle = Arc::new(coordinator).spawn(devices, options);

    while let Some(event) = rx.recv().await {
        if !batch.json {
            print_event(&event);
        }
    }

    let result = handle.await.context("Batch task panicked")??;
    let summary = result.summary(&SystemClock);

    db::batches::record(&ctx.db, &result, &summary).await?;
    info!(batch_id = %result.id, "Recorded batch");

    if batch.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if result.cancelled {
        bail!("Batch was cancelled; {} device(s) not processed", summary.pending);
    }
    if summary.failed > 0 {
        bail!("{} of {} device(s) failed", summary.failed, summary.total);
    }
    Ok(())
}

async fn run_history(ctx: &context::AppContext, limit: usize) -> Result<()> {
    let records = db::batches::list(&ctx.db, limit).await?;
    if records.is_empty() {
        println!("No batches recorded.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Batch", "Mode", "Started", "Duration", "Result"]);
    for record in records {
        let duration = match (record.started_at, record.finished_at) {
            (Some(start), Some(finish)) => format_duration(finish - start),
            _ => String::new(),
        };
        let mut outcome = format!("{}/{} OK", record.successful, record.device_count);
        if record.cancelled {
            outcome.push_str(" (cancelled)");
        }
        table.add_row(vec![
            record.id.to_string(),
            record.mode.to_string(),
            record
                .started_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            duration,
            outcome,
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn run_show(ctx: &context::AppContext, id: Uuid) -> Result<()> {
    let result = db::batches::get(&ctx.db, id)
        .await?
        .ok_or_else(|| anyhow!("No batch recorded with id {id}"))?;
    println!("Batch {} ({})", result.id, result.mode);
    print_result(&result);
    Ok(())
}

fn print_event(event: &BatchEvent) {
    match event {
        BatchEvent::Started { batch_id, mode, total } => {
            println!("Starting {mode} batch {batch_id} with {total} device(s)");
        }
        BatchEvent::DeviceStarted {
            device_name,
            ordinal,
            total,
            ..
        } => println!("Processing device {ordinal} of {total}: {device_name}"),
        BatchEvent::PhaseChanged { device_id, phase } => println!("  {device_id}: {phase}"),
        BatchEvent::DeviceFinished(op) => match &op.error {
            Some(error) => println!("  {}: {} ({error})", op.device_name, op.status),
            None => println!("  {}: {}", op.device_name, op.status),
        },
        BatchEvent::Summary(_) => {}
    }
}

fn print_result(result: &BatchResult) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["#", "Device", "Size", "Duration", "Status", "Error"]);
    for row in result.rows(&SystemClock) {
        table.add_row(vec![
            number_cell(row.number),
            row.device,
            format_size(row.size),
            row.duration.map(format_duration).unwrap_or_default(),
            row.status,
            row.error.unwrap_or_default(),
        ]);
    }
    println!("{table}");
}

fn number_cell(number: Option<u32>) -> String {
    number.map(|n| n.to_string()).unwrap_or_default()
}

fn describe_plan(device: &AdmittedDevice) -> String {
    let mut text = match &device.plan {
        DevicePlan::Install { layout } => format!("install ({})", layout.name()),
        DevicePlan::Upgrade { verdict, exchange } => {
            let exchange = match exchange {
                RepartitionStrategy::Keep => "keep exchange".to_string(),
                RepartitionStrategy::Resize(size) => {
                    format!("resize exchange to {}", format_size(*size))
                }
                RepartitionStrategy::Remove => "remove exchange".to_string(),
            };
            format!(
                "upgrade (system: {:?}, efi: {:?}, {exchange})",
                verdict.system, verdict.efi
            )
        }
        DevicePlan::Reset {
            persistence,
            exchange,
        } => {
            let mut parts = Vec::new();
            if *persistence {
                parts.push("persistence");
            }
            if *exchange {
                parts.push("exchange");
            }
            format!("reset ({})", parts.join(", "))
        }
    };
    if let Some(label) = &device.exchange_label {
        text.push_str(&format!(", label {label}"));
    }
    text
}
