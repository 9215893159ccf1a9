use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{info, warn};

use turbine::config::{EngineConfig, WorkerConfig};
use turbine::fleet::{LocalFleet, WorkerBoot};
use turbine::queue::InMemoryBroker;
use turbine::staging::{InMemoryObjectStore, LocalObjectStore, StoreRouter};
use turbine::task::TaskEnvelope;
use turbine::{Engine, StartRequest, logging};

const USAGE: &str = "usage: turbine <worker|local>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let mode = std::env::args().nth(1).unwrap_or_default();
    match mode.as_str() {
        "worker" => worker().await,
        "local" => local().await,
        _ => {
            eprintln!("{USAGE}");
            eprintln!("   worker  run the agent on a fleet instance (TURBINE_* boot env)");
            eprintln!("   local   run TURBINE_TASKS on an in-process fleet");
            std::process::exit(2);
        }
    }
}

/// Instance entry point. Every template overrides the image command with this.
async fn worker() -> anyhow::Result<()> {
    let boot = WorkerBoot::from_env().context("Invalid instance boot environment")?;
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    info!(
        fleet = %boot.fleet,
        instance = %boot.instance,
        subscription = %boot.queue.subscription,
        scratch_root = %config.scratch_root.display(),
        "Worker boot contract accepted"
    );
    bail!(
        "no networked broker backend is linked into this build; \
         use `turbine local` to run tasks in-process"
    )
}

/// Run a batch of tasks on an in-process fleet and wait for it to drain.
async fn local() -> anyhow::Result<()> {
    let tasks_path: PathBuf = std::env::var("TURBINE_TASKS")
        .context("TURBINE_TASKS must point at a JSON-lines file of task envelopes")?
        .into();
    let store_root: PathBuf = std::env::var("TURBINE_STORE_ROOT")
        .unwrap_or_else(|_| "./turbine-store".to_string())
        .into();
    let workers: u32 = std::env::var("TURBINE_WORKERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let name = std::env::var("TURBINE_NAME").unwrap_or_else(|_| "local".to_string());
    let deadline = Duration::from_secs(
        std::env::var("TURBINE_DEADLINE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(24 * 3600),
    );

    let worker = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let raw = tokio::fs::read_to_string(&tasks_path)
        .await
        .with_context(|| format!("Failed to read {}", tasks_path.display()))?;
    let envelopes = raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            TaskEnvelope::decode(line.as_bytes())
                .with_context(|| format!("{}:{}: invalid task", tasks_path.display(), n + 1))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    eprintln!("Turbine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tasks: {} from {}", envelopes.len(), tasks_path.display());
    eprintln!("   Workers: {workers}");

    let broker = Arc::new(InMemoryBroker::new());
    let store = StoreRouter::new()
        .with_backend("file", Arc::new(LocalObjectStore::new(&store_root)))
        .with_backend("mem", Arc::new(InMemoryObjectStore::new()));
    eprintln!("   Stores: {}", store.schemes().join(", "));
    eprintln!("   file:// root: {}", store_root.display());
    let fleet = LocalFleet::new(broker.clone(), Arc::new(store), worker);

    let engine = Engine::new(
        name,
        "local",
        broker.clone(),
        fleet,
        EngineConfig::default(),
    )
    .await?;
    let ids = engine.add_tasks(envelopes).await?;
    engine.start(&StartRequest::new(workers, "local")).await?;

    let drained = engine
        .wait_until_drained(Duration::from_secs(1), deadline)
        .await?;
    if !drained {
        warn!(deadline_secs = deadline.as_secs(), "Fleet did not drain before deadline");
    }
    engine.stop().await?;

    let mut acked = 0;
    for id in &ids {
        if broker.ack_count(id).await > 0 {
            acked += 1;
        }
    }
    let dead = broker.dead_letters().await.len();
    engine.cleanup().await?;

    eprintln!("   Completed: {acked}/{}", ids.len());
    if dead > 0 {
        eprintln!("   Exhausted delivery attempts: {dead}");
    }
    if !drained || acked < ids.len() {
        bail!("{} of {} tasks were not acknowledged", ids.len() - acked, ids.len());
    }
    Ok(())
}
