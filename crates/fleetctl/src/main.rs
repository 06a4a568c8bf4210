mod ps;
mod table;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleet::config::FleetConfig;
use fleet::group::{Controller, GroupType};
use fleet::healer::Healer;
use fleet::health::CheckStatus;
use fleet::task::Task;
use fleet::watch::{diff_snapshots, WatchLoop, DEFAULT_WATCH_PERIOD_SECS};
use fleet::Fleet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "fleetctl", about = "Manage replicated in-memory store groups")]
struct Cli {
    /// Consul host to connect to
    #[arg(short = 'H', long, env = "CONSUL_HOST", global = true)]
    host: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a YAML config file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show a list of running groups
    Ps {
        /// Only show group IDs
        #[arg(short, long)]
        quiet: bool,
    },
    /// Run a new group
    Run {
        /// Name of the new group
        name: String,
        /// Amount of memory to allocate (MiB)
        #[arg(long, default_value_t = 500)]
        memsize: u64,
        /// How often to run consul checks (seconds)
        #[arg(short = 'p', long = "check-period", default_value_t = 10)]
        check_period: u64,
    },
    /// Remove one or more groups or instances
    Rm {
        /// Group or instance IDs to remove
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Recover groups in failed state
    Heal {
        /// Attach to the cluster and run healing continuously
        #[arg(short, long)]
        attach: bool,
        /// How often to query health checks (seconds)
        #[arg(short = 'p', long = "heal-period", default_value_t = DEFAULT_WATCH_PERIOD_SECS)]
        heal_period: u64,
    },
    /// Wait for a group or instance to get to a certain state
    Wait {
        /// Wait until passing state
        #[arg(long)]
        passing: bool,
        /// Wait until warning state
        #[arg(long)]
        warning: bool,
        /// Wait until critical state
        #[arg(long)]
        critical: bool,
        /// ID of the group or instance to wait for
        id: String,
    },
    /// Monitor for state changes
    Watch {
        /// How often to query health checks (seconds)
        #[arg(short = 'p', long = "watch-period", default_value_t = DEFAULT_WATCH_PERIOD_SECS)]
        period: u64,
    },
    /// Start a stopped group
    Start { group_id: String },
    /// Stop a group
    Stop { group_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let mut config = FleetConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(host) = &cli.host {
        config.consul_host = Some(host.clone());
    }
    if config.consul_host.is_none() {
        bail!("Please specify --host or pass CONSUL_HOST via env");
    }
    config.validate().context("Configuration validation failed")?;

    let fleet = Fleet::new(config)?;

    match cli.command {
        Command::Ps { quiet } => cmd_ps(&fleet, quiet).await,
        Command::Run {
            name,
            memsize,
            check_period,
        } => cmd_run(&fleet, &name, memsize, check_period).await,
        Command::Rm { ids } => cmd_rm(&fleet, &ids).await,
        Command::Heal {
            attach,
            heal_period,
        } => cmd_heal(&fleet, attach, heal_period).await,
        Command::Wait {
            passing,
            warning,
            critical,
            id,
        } => cmd_wait(&fleet, &id, passing, warning, critical).await,
        Command::Watch { period } => cmd_watch(&fleet, period).await,
        Command::Start { group_id } => cmd_start(&fleet, &group_id).await,
        Command::Stop { group_id } => cmd_stop(&fleet, &group_id).await,
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Probe the docker hosts once and take a first snapshot so one-shot
/// commands see a populated world.
async fn bootstrap(fleet: &Arc<Fleet>) -> Result<()> {
    fleet.sense.probe_now().await?;
    fleet.sense.refresh().await?;
    Ok(())
}

async fn cmd_ps(fleet: &Arc<Fleet>, quiet: bool) -> Result<()> {
    bootstrap(fleet).await?;
    let snapshot = fleet.sense.snapshot();

    if quiet {
        for group in snapshot.blueprints.keys() {
            println!("{group}");
        }
        return Ok(());
    }

    let rows = ps::ps_rows(&snapshot);
    print!("{}", table::render(&ps::PS_HEADER, &rows));
    Ok(())
}

async fn cmd_run(
    fleet: &Arc<Fleet>,
    name: &str,
    memsize: u64,
    check_period: u64,
) -> Result<()> {
    bootstrap(fleet).await?;

    let group_id = Uuid::new_v4().simple().to_string();
    let controller = Controller::new(fleet.clone(), &group_id, GroupType::Memcached);
    let task = fleet.tasks.create("create_memcached", Some(&group_id));

    controller
        .create(&task, name, memsize, None, check_period)
        .await?;

    println!("{group_id}");
    Ok(())
}

async fn cmd_rm(fleet: &Arc<Fleet>, ids: &[String]) -> Result<()> {
    bootstrap(fleet).await?;

    for id in ids {
        match id.split_once('_') {
            Some((group_id, num)) => {
                let controller = Controller::for_group(fleet.clone(), group_id)?;
                controller.core().remove_container(num).await?;
                controller.core().unregister_instance(num).await?;
            }
            None => {
                let controller = Controller::for_group(fleet.clone(), id)?;
                let task = fleet.tasks.create("delete_group", Some(id));
                controller.delete(&task).await?;
            }
        }
    }
    Ok(())
}

async fn cmd_heal(fleet: &Arc<Fleet>, attach: bool, heal_period: u64) -> Result<()> {
    if !attach {
        bootstrap(fleet).await?;
        return Ok(Healer::new(fleet.clone()).heal().await?);
    }

    fleet.start_background().await;
    bootstrap(fleet).await?;

    let watch_loop = WatchLoop::new(fleet.clone());
    let shutdown_rx = fleet.shutdown_rx();
    let handle = tokio::spawn(watch_loop.run(heal_period, shutdown_rx));

    tokio::signal::ctrl_c().await.ok();
    warn!("Interrupted, shutting down");
    fleet.shutdown();
    handle.await.ok();
    Ok(())
}

async fn cmd_wait(
    fleet: &Arc<Fleet>,
    id: &str,
    passing: bool,
    warning: bool,
    critical: bool,
) -> Result<()> {
    bootstrap(fleet).await?;

    let mut expected = Vec::new();
    if passing {
        expected.push(CheckStatus::Passing);
    }
    if warning {
        expected.push(CheckStatus::Warning);
    }
    if critical {
        expected.push(CheckStatus::Critical);
    }
    if expected.is_empty() {
        expected.push(CheckStatus::Passing);
    }

    let (group_id, instance) = match id.split_once('_') {
        Some((group, num)) => (group.to_string(), Some(num.to_string())),
        None => (id.to_string(), None),
    };

    loop {
        let snapshot = fleet.sense.snapshot();
        let statuses: Vec<CheckStatus> = match (&instance, snapshot.services.get(&group_id)) {
            (Some(num), Some(services)) => services
                .instances
                .get(num)
                .map(|i| vec![i.status()])
                .unwrap_or_default(),
            (None, Some(services)) => {
                let wanted = snapshot
                    .blueprints
                    .get(&group_id)
                    .map(|b| b.instances.len())
                    .unwrap_or(0);
                let statuses: Vec<CheckStatus> =
                    services.instances.values().map(|i| i.status()).collect();
                if wanted > 0 && statuses.len() < wanted {
                    Vec::new()
                } else {
                    statuses
                }
            }
            _ => Vec::new(),
        };

        if !statuses.is_empty() && statuses.iter().all(|s| expected.contains(s)) {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        fleet.sense.refresh().await?;
    }
}

async fn cmd_watch(fleet: &Arc<Fleet>, period: u64) -> Result<()> {
    bootstrap(fleet).await?;

    let mut previous = fleet.sense.snapshot();
    let mut index = None;

    loop {
        let wait = fleet::watch::await_change(fleet.as_ref(), "memcached", index, period);
        let new_index = tokio::select! {
            result = wait => result?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        index = Some(new_index);

        fleet.sense.probe_now().await?;
        fleet.sense.refresh().await?;
        let current = fleet.sense.snapshot();

        for event in diff_snapshots(&previous, &current) {
            println!("{event}");
        }
        previous = current;
    }
}

async fn cmd_start(fleet: &Arc<Fleet>, group_id: &str) -> Result<()> {
    bootstrap(fleet).await?;
    let controller = Controller::for_group(fleet.clone(), group_id)?;
    let task = start_stop_task(fleet, "start_group", group_id);
    let result = controller.core().start_group(&task).await;
    fleet::group::finish_task(&task, result)?;
    Ok(())
}

async fn cmd_stop(fleet: &Arc<Fleet>, group_id: &str) -> Result<()> {
    bootstrap(fleet).await?;
    let controller = Controller::for_group(fleet.clone(), group_id)?;
    let task = start_stop_task(fleet, "stop_group", group_id);
    let result = controller.core().stop_group(&task).await;
    fleet::group::finish_task(&task, result)?;
    Ok(())
}

fn start_stop_task(fleet: &Arc<Fleet>, task_type: &str, group_id: &str) -> Arc<Task> {
    fleet.tasks.create(task_type, Some(group_id))
}
