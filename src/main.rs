mod config;
mod pool;
mod sandbox;
mod tasks;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{Config, Overrides, Settings};
use crate::pool::{EndpointRotation, PoolScheduler, Provisioner, SandboxExecutor, SlotTable};
use crate::sandbox::{ControlClient, ProviderEndpoint, WorkerCommand};
use crate::tasks::outcome::{OutcomeStatus, OutcomeStore, RunSummary, TaskOutcome};
use crate::tasks::partition::partition;

#[derive(Parser)]
#[command(name = "envpool", about = "Run task queues on a pool of disposable sandboxes")]
struct Cli {
    /// Config file [default: $ENVPOOL_CONFIG, then envpool.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the pool and run every pending task
    Run(RunArgs),
    /// Print the batches a run would execute, without provisioning
    Plan {
        /// Task file (.json or .jsonl)
        tasks: PathBuf,
    },
    /// List containers on every provider
    List,
    /// Destroy containers left behind by earlier runs
    Cleanup,
    /// Serve one isolated revert request on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Args)]
struct RunArgs {
    /// Task file (.json or .jsonl)
    tasks: PathBuf,
    #[arg(long)]
    pool_size: Option<usize>,
    /// Per-task timeout in seconds
    #[arg(long)]
    task_timeout: Option<u64>,
    /// Per-reset timeout in seconds
    #[arg(long)]
    reset_timeout: Option<u64>,
    #[arg(long)]
    results_dir: Option<PathBuf>,
    /// Provider host:port, repeatable; replaces provider.hosts
    #[arg(long = "host")]
    hosts: Vec<ProviderEndpoint>,
    /// Keep containers from earlier runs instead of destroying them first
    #[arg(long)]
    no_cleanup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    init_tracing();

    if let Command::Worker = cli.command {
        // stdout carries the reply; nothing else may write to it.
        sandbox::worker::serve_stdio().await?;
        return Ok(());
    }

    let _guard = sentry::init((
        settings.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(settings.environment.clone().into()),
            traces_sample_rate: 0.2,
            ..Default::default()
        },
    ));

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&settings.config_path)?,
    };

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Plan { tasks } => plan(&config, &tasks),
        Command::List => list(&config).await,
        Command::Cleanup => cleanup(&config).await,
        Command::Worker => Ok(()),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("envpool=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_writer(std::io::stderr)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

fn build_provisioner(config: &Config) -> Result<Provisioner> {
    let clients = config
        .provider
        .hosts
        .iter()
        .map(|host| ControlClient::new(host.clone(), config.retry_policy(), config.request_timeout()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Provisioner::new(
        clients,
        config.sandbox_template(),
        config.pool.name_prefix.clone(),
    ))
}

async fn run(mut config: Config, args: RunArgs) -> Result<()> {
    config.apply(Overrides {
        pool_size: args.pool_size,
        task_timeout_secs: args.task_timeout,
        reset_timeout_secs: args.reset_timeout,
        results_dir: args.results_dir,
        hosts: args.hosts,
    });
    config.validate()?;

    let all_tasks = tasks::load_tasks(&args.tasks)?;
    let store = OutcomeStore::new(config.results_dir());
    let completed = store
        .completed_ids()
        .context("failed to read recorded outcomes")?;
    let total = all_tasks.len();
    let pending = tasks::pending(all_tasks, &completed);
    let skipped = total - pending.len();
    if skipped > 0 {
        tracing::info!(skipped, remaining = pending.len(), "resuming, tasks with recorded outcomes are skipped");
    }

    let batches = partition(&pending)?;
    if batches.is_empty() {
        tracing::info!("nothing to run");
        return finish(&store, &[], skipped);
    }

    let provisioner = build_provisioner(&config)?;
    if !args.no_cleanup {
        provisioner.cleanup_orphans().await;
    }

    let slots = SlotTable::new(
        provisioner.provision(config.pool.size).await,
        config.pool.replace_after_failures,
    );

    let reverter = if config.runner.worker_command.is_empty() {
        WorkerCommand::current_exe()?
    } else {
        WorkerCommand::new(&config.runner.worker_command)?
    };
    let runner = WorkerCommand::new(&config.runner.task_command)?.with_env(
        "ENVPOOL_RESULTS_DIR",
        config.results_dir().display().to_string(),
    );
    let executor = Arc::new(SandboxExecutor::new(
        provisioner.clone(),
        reverter,
        runner,
        config.pool.snapshot.clone(),
        config.reset_timeout(),
        config.task_timeout(),
        config.request_timeout(),
    ));

    let mut scheduler = PoolScheduler::new(
        executor,
        slots,
        EndpointRotation::new(config.runner.aux_endpoints.clone()),
        store.clone(),
        config.scheduler(),
    );

    let result: Result<Vec<TaskOutcome>> = tokio::select! {
        r = scheduler.run(batches) => r.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => Err(anyhow!("interrupted")),
    };

    let handles = scheduler.drain_handles();
    drop(scheduler);
    tracing::info!(sandboxes = handles.len(), "tearing down pool");
    provisioner.destroy_all(handles).await;

    let outcomes = result?;
    finish(&store, &outcomes, skipped)
}

fn finish(store: &OutcomeStore, outcomes: &[TaskOutcome], skipped: usize) -> Result<()> {
    let summary = RunSummary::from_outcomes(outcomes, skipped);
    let path = store.write_summary(&summary)?;
    tracing::info!(
        total = summary.total,
        skipped = summary.skipped,
        succeeded = summary.count(OutcomeStatus::Succeeded),
        timed_out = summary.count(OutcomeStatus::TimedOut),
        sandbox_unhealthy = summary.count(OutcomeStatus::SandboxUnhealthy),
        task_error = summary.count(OutcomeStatus::TaskError),
        summary = %path.display(),
        "run finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn plan(config: &Config, tasks_path: &Path) -> Result<()> {
    let all_tasks = tasks::load_tasks(tasks_path)?;
    let completed = OutcomeStore::new(config.results_dir()).completed_ids()?;
    let pending = tasks::pending(all_tasks, &completed);
    let batches = partition(&pending)?;

    let plan: Vec<serde_json::Value> = batches
        .iter()
        .map(|b| {
            serde_json::json!({
                "index": b.index,
                "mode": b.mode,
                "tasks": b.task_ids(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn list(config: &Config) -> Result<()> {
    config.validate_provider()?;
    let containers = build_provisioner(config)?.list_all().await;
    for c in &containers {
        println!(
            "{}\t{}\t{}",
            c.provider,
            c.name,
            c.status.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cleanup(config: &Config) -> Result<()> {
    config.validate_provider()?;
    if config.pool.name_prefix.is_empty() {
        bail!("pool.name_prefix must not be empty");
    }
    let destroyed = build_provisioner(config)?.cleanup_orphans().await;
    println!("destroyed {destroyed} sandboxes");
    Ok(())
}
