use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use pairflow::fleet::DEFAULT_MAX_PAIRS;
use pairflow::worker::{self, NUM_VALUES, ProducerConfig};
use pairflow::{ExecSpawner, FleetConfig, FleetError, FleetMode, FleetReport, logging, run_fleet};

const DEFAULT_DELAY_MS: u64 = 100;

/// Run producer/consumer pairs over pipes and report how every worker exited.
#[derive(Debug, Parser)]
#[command(name = "pairflow", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Number of producer/consumer pairs. Omit to run a single basic pair.
    pairs: Option<usize>,

    /// Upper bound on the number of pairs.
    #[arg(long, env = "PAIRFLOW_MAX_PAIRS", default_value_t = DEFAULT_MAX_PAIRS)]
    max_pairs: usize,

    /// Values emitted by each producer.
    #[arg(long, env = "PAIRFLOW_NUM_VALUES", default_value_t = NUM_VALUES)]
    count: usize,

    /// Delay between two records, in milliseconds.
    #[arg(long, env = "PAIRFLOW_DELAY_MS", default_value_t = DEFAULT_DELAY_MS)]
    delay_ms: u64,

    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Worker process entry point, used by the coordinator.
    #[command(hide = true)]
    Worker {
        #[command(subcommand)]
        role: WorkerCommand,
    },
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    /// Write a sequence of records to stdout.
    Producer {
        #[arg(long)]
        pair_id: u32,
        #[arg(long, allow_negative_numbers = true)]
        start: i32,
        #[arg(long, default_value_t = NUM_VALUES)]
        count: usize,
        #[arg(long, default_value_t = DEFAULT_DELAY_MS)]
        delay_ms: u64,
        #[arg(long)]
        abort_after: Option<usize>,
    },
    /// Sum records read from stdin.
    Consumer {
        #[arg(long)]
        pair_id: u32,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_tracing();

    let code = match cli.command {
        Some(Command::Worker { role }) => run_worker(role).await,
        None => match run(cli.run).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e:#}");
                1
            }
        },
    };

    process::exit(code);
}

async fn run_worker(role: WorkerCommand) -> i32 {
    match role {
        WorkerCommand::Producer {
            pair_id,
            start,
            count,
            delay_ms,
            abort_after,
        } => {
            tracing::debug!(pair_id, "Producer worker process started");
            let config = ProducerConfig::new(start)
                .with_num_values(count)
                .with_delay(Duration::from_millis(delay_ms))
                .with_abort_after(abort_after);
            worker::run_producer_process(config).await
        }
        WorkerCommand::Consumer { pair_id } => worker::run_consumer_process(pair_id).await,
    }
}

/// Text output of a partial report lists outcomes only, without the summary header.
fn render_report(report: &FleetReport, json: bool, finished: bool) -> anyhow::Result<String> {
    if json {
        let json = serde_json::to_string_pretty(report).context("failed to serialize report")?;
        return Ok(format!("{json}\n"));
    }
    if finished {
        return Ok(report.to_string());
    }
    Ok(report.outcomes().map(|outcome| format!("{outcome}\n")).collect())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mode = match args.pairs {
        None => FleetMode::Basic,
        Some(pairs) => FleetMode::MultiPair { pairs },
    };

    let spawner = ExecSpawner::current_exe().context("failed to locate the pairflow executable")?;
    let config = FleetConfig::new(mode)
        .with_max_pairs(args.max_pairs)
        .with_num_values(args.count)
        .with_record_delay(Duration::from_millis(args.delay_ms))
        .with_spawner(Arc::new(spawner));

    let report = match run_fleet(&config).await {
        Ok(report) => report,
        Err(FleetError::PairAborted { source, completed }) => {
            let partial = FleetReport {
                mode,
                pairs: completed,
            };
            print!("{}", render_report(&partial, args.json, false)?);
            return Err(source).context("fleet aborted");
        }
        Err(e) => return Err(e.into()),
    };

    print!("{}", render_report(&report, args.json, true)?);

    if !report.all_succeeded() {
        tracing::warn!("Not every worker exited cleanly");
    }

    Ok(())
}
