use clap::Parser;
use grun::cli::Cli;
use grun::config::{self, BatchFile};
use grun::core::inventory::{Inventory, NvmlProbe};
use grun::core::job::JobTable;
use grun::core::ledger::Ledger;
use grun::core::scheduler::{self, Interrupted, SchedulerConfig, SchedulerState, Summary};
use grun::core::Mode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity.tracing_level_filter())
        .init();
    tracing::debug!("{cli:?}");

    match run(cli).await {
        Ok(_) => {}
        Err(err) if err.is::<Interrupted>() => std::process::exit(130),
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<Summary> {
    let batch = BatchFile::load(&cli.config)?;

    // Exclusive mode with an explicit gpu list treats devices as opaque
    // tokens; every other combination consults the driver.
    let inventory = match (cli.mode, batch.gpus.as_deref()) {
        (Mode::Exclusive, Some(gpus)) => Inventory::from_config(gpus)?,
        (mode, gpus) => {
            let probe = NvmlProbe::init()?;
            Inventory::detect(gpus, &probe, mode)?
        }
    };

    let jobs = batch.build_jobs(cli.mode);
    config::validate(&jobs, &inventory, cli.mode)?;

    tracing::info!("{} GPU(s) configured:", inventory.len());
    for gpu in inventory.list() {
        match gpu.initial_free_mb {
            Some(free) => tracing::info!(" - GPU {} ({free} MB free)", gpu.id),
            None => tracing::info!(" - GPU {}", gpu.id),
        }
    }
    tracing::info!("{} job(s) loaded:", jobs.len());
    for job in &jobs {
        tracing::info!(" - {job}");
    }

    let max_workers = cli.max_workers.unwrap_or_else(|| inventory.len());
    if max_workers == 0 {
        anyhow::bail!("--max-workers must be at least 1");
    }
    let config = SchedulerConfig {
        max_workers,
        interval_for_waiting_gpu: Duration::from_secs(cli.interval_for_waiting_gpu),
        interval_for_loop: Duration::from_secs(cli.interval_for_loop),
    };

    let ledger = Ledger::new(&inventory, cli.mode);
    let shared: scheduler::SharedState = Arc::new(Mutex::new(SchedulerState {
        ledger,
        jobs: JobTable::new(jobs),
    }));

    // Only the driver listens for the interrupt; workers and children learn
    // about it through the shutdown flag.
    let (trigger, shutdown) = scheduler::shutdown_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("caught interrupt, terminating workers");
            trigger.trigger();
        }
    });

    let summary = scheduler::run(shared, &config, shutdown).await?;
    Ok(summary)
}
