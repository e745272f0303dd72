//! Jeeves shard tool - main entry point.
//!
//! Subcommands:
//! - route: Print the shard owning each key
//! - count: Derive a shard count from a workload size
//! - simulate: Run a cluster of in-process shards over the memory bus

use clap::{Parser, Subcommand};
use jeeves_shard::health::HealthUpdate;
use jeeves_shard::partition;
use jeeves_shard::transport::MemoryBroker;
use jeeves_shard::types::ShardId;
use jeeves_shard::{Config, ShardOrchestrator};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "jeeves-shard")]
#[command(about = "Shard partitioning and coordination toolkit")]
struct Cli {
    /// JSON config file. Environment overrides apply on top.
    #[arg(long, env = "JEEVES_SHARD_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the shard owning each key.
    Route {
        /// Shard count; defaults to the configured one.
        #[arg(long)]
        total: Option<u32>,

        /// Snowflake ids or arbitrary text keys.
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Derive a shard count from a workload size.
    Count {
        workload: u64,

        #[arg(long, default_value_t = 1000)]
        units_per_shard: u64,
    },
    /// Run in-process shards over the memory bus and print system health.
    Simulate {
        #[arg(long, default_value_t = 4)]
        shards: u32,

        /// Milliseconds to let the cluster run before reporting.
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
    },
}

fn load_config(path: Option<&PathBuf>) -> jeeves_shard::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_json_str(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    // Initialize observability
    jeeves_shard::observability::init_tracing_with(&config.observability);

    match cli.command {
        Command::Route { total, keys } => {
            let total = total.unwrap_or_else(|| config.sharding.resolved_total_shards());
            for key in keys {
                println!("{key}\t{}", partition::shard_for_key(&key, total));
            }
        }
        Command::Count {
            workload,
            units_per_shard,
        } => {
            println!("{}", partition::calculate_shard_count(workload, units_per_shard));
        }
        Command::Simulate { shards, settle_ms } => {
            simulate(config, shards, Duration::from_millis(settle_ms)).await?
        }
    }

    Ok(())
}

async fn simulate(
    mut config: Config,
    shards: u32,
    settle: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    config.sharding.total_shards = shards;
    let broker = MemoryBroker::new();

    let mut cluster = Vec::with_capacity(shards as usize);
    for id in 0..shards {
        let mut orchestrator =
            ShardOrchestrator::new(config.clone(), ShardId::new(id), Arc::new(broker.connect()))?;
        orchestrator
            .register_handler("ping", |_, _| async { Ok::<_, String>(json!({"pong": true})) })
            .await;
        orchestrator.initialize().await?;
        cluster.push(orchestrator);
    }

    for (id, orchestrator) in cluster.iter().enumerate() {
        let groups = id as u64 + 1;
        orchestrator
            .report_health(HealthUpdate::ready(groups, 100 * groups))
            .await?;
    }

    if let Some(first) = cluster.first() {
        for orchestrator in &cluster {
            let reply = first
                .request(orchestrator.shard_id(), "ping", json!({}))
                .await?;
            tracing::info!(target_shard = %orchestrator.shard_id(), reply = %reply, "ping");
        }
    }

    tokio::time::sleep(settle).await;
    if let Some(first) = cluster.first() {
        println!("{}", serde_json::to_string_pretty(&first.system_health().await)?);
        println!("{}", serde_json::to_string_pretty(&first.gateway().stats().await)?);
    }

    for orchestrator in &mut cluster {
        orchestrator.shutdown().await;
    }
    println!("{}", serde_json::to_string_pretty(&broker.get_stats().await)?);
    Ok(())
}
