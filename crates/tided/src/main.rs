//! `tided`: the Tidepool node daemon.
//!
//! Hosts in-memory placement groups behind the client request pipeline and
//! drives them with a synthetic client workload.
//!
//! # Usage
//!
//! ```text
//! tided simulate                          # run the default workload
//! tided simulate -n 1000 --connections 16 # heavier workload
//! tided simulate --churn                  # restart intervals mid-run
//! tided -c tided.toml simulate            # with a config file
//! tided config                            # print the effective config
//! ```

mod config;
mod telemetry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tide_pg::{
    EpochGate, MapGate, MemoryConnection, MemoryPg, MemoryPgRegistry, MemoryRecovery, PgRole,
    PlacementGroup,
};
use tide_pipeline::OpService;
use tide_types::events::{EventBus, RequestOutcome, RequestRestarted};
use tide_types::{
    ClientMessage, ConnectionId, Epoch, ObjectId, OpFlags, PgId, RequestId, SubOp,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use config::CliConfig;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "tided", version, about = "Tidepool node daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic client workload against in-memory placement groups.
    Simulate {
        /// Ops sent on each connection.
        #[arg(short = 'n', long)]
        ops: Option<u64>,

        /// Number of client connections.
        #[arg(long)]
        connections: Option<u64>,

        /// Workload RNG seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Start new intervals on random placement groups during the run.
        #[arg(long)]
        churn: bool,
    },

    /// Print the effective configuration.
    Config,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init_console(&config.log.level);

    match cli.command {
        Commands::Simulate {
            ops,
            connections,
            seed,
            churn,
        } => {
            // CLI args override config file values.
            if let Some(ops) = ops {
                config.simulate.ops_per_connection = ops;
            }
            if let Some(connections) = connections {
                config.simulate.connections = connections;
            }
            if let Some(seed) = seed {
                config.simulate.seed = seed;
            }
            if churn {
                config.simulate.churn = true;
            }
            cmd_simulate(&config).await
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

// -----------------------------------------------------------------------
// Node assembly
// -----------------------------------------------------------------------

struct Node {
    map: Arc<EpochGate>,
    pgs: Vec<Arc<MemoryPg>>,
    recovery: Arc<MemoryRecovery>,
    events: EventBus,
    service: Arc<OpService>,
}

fn build_node(config: &CliConfig) -> Node {
    let epoch = Epoch(1);
    let map = Arc::new(EpochGate::new(epoch));
    let registry = Arc::new(MemoryPgRegistry::new());
    let recovery = Arc::new(MemoryRecovery::simulated(
        Duration::from_millis(config.recovery_delay_ms()),
        config.recovery_fail_ratio(),
        config.simulate.seed,
    ));
    let events = EventBus::new();

    let replicas = u64::from(config.replicas());
    let mut pgs = Vec::new();
    for pool in 0..config.node.pools {
        for seed in 0..config.pgs_per_pool() {
            let role = if u64::from(seed) % replicas == config.node.node_id % replicas {
                PgRole::Primary
            } else {
                PgRole::Replica
            };
            let pg = Arc::new(MemoryPg::new(PgId::new(pool, seed), epoch).with_role(role));
            registry.insert(pg.clone());
            pgs.push(pg);
        }
    }

    let service = Arc::new(OpService::new(
        map.clone(),
        registry,
        recovery.clone(),
        events.clone(),
    ));
    Node {
        map,
        pgs,
        recovery,
        events,
        service,
    }
}

fn object_name(index: u32) -> String {
    format!("obj-{index}")
}

/// Mark a random share of objects missing so the first op on each of them
/// goes through recovery.
fn seed_missing_objects(node: &Node, config: &CliConfig, rng: &mut StdRng) -> usize {
    let mut marked = 0;
    for pg in &node.pgs {
        for index in 0..config.simulate.objects {
            if rng.random_bool(config.simulate.degraded_ratio) {
                pg.mark_missing(ObjectId::from_name(&object_name(index)), 1);
                marked += 1;
            }
        }
    }
    marked
}

// -----------------------------------------------------------------------
// tided simulate
// -----------------------------------------------------------------------

async fn cmd_simulate(config: &CliConfig) -> Result<()> {
    let sim = &config.simulate;
    let node = build_node(config);
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let missing = seed_missing_objects(&node, config, &mut rng);

    println!("Tidepool Simulation");
    println!("  placement groups: {}", node.pgs.len());
    println!("  connections:      {}", sim.connections);
    println!("  ops/connection:   {}", sim.ops_per_connection);
    println!("  write ratio:      {:.2}", sim.write_ratio);
    println!("  missing objects:  {missing}");
    println!("  churn:            {}", sim.churn);
    println!();

    let restarts = Arc::new(AtomicU64::new(0));
    let (done_tx, done_rx) = watch::channel(false);
    let counter = spawn_restart_counter(&node, restarts.clone(), done_rx.clone());
    let churn = sim
        .churn
        .then(|| spawn_churn(&node, sim.seed.wrapping_add(1), done_rx));

    let start = Instant::now();
    let mut clients = Vec::new();
    for conn in 0..sim.connections {
        clients.push(spawn_client(&node, config, conn));
    }

    let mut tally: BTreeMap<String, u64> = BTreeMap::new();
    let workload = async {
        for client in clients.iter_mut() {
            for (outcome, count) in client.await?? {
                *tally.entry(format!("{outcome:?}")).or_default() += count;
            }
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = workload => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, shutting down the pipeline");
            node.service.shutdown();
        }
    }
    let elapsed = start.elapsed();

    done_tx.send_replace(true);
    if let Some(churn) = churn {
        churn.await?;
    }
    counter.await?;
    node.service.shutdown();

    let total: u64 = tally.values().sum();
    println!("Outcomes:");
    for (outcome, count) in &tally {
        println!("  {outcome:<13} {count}");
    }
    println!();
    println!("Summary:");
    println!("  Requests:         {total}");
    println!("  Elapsed:          {:.2}s", elapsed.as_secs_f64());
    println!(
        "  Throughput:       {:.0} ops/s",
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("  Recoveries:       {}", node.recovery.started());
    println!("  Restarts:         {}", restarts.load(Ordering::Relaxed));
    println!("  Still tracked:    {}", node.service.tracker().len());

    Ok(())
}

type ClientTally = Vec<(RequestOutcome, u64)>;

/// One client connection: submits its ops back to back, then waits for all
/// of them and counts outcomes.
fn spawn_client(node: &Node, config: &CliConfig, conn: u64) -> JoinHandle<Result<ClientTally>> {
    let sim = &config.simulate;
    let service = node.service.clone();
    let map = node.map.clone();
    let pg_ids: Vec<PgId> = node.pgs.iter().map(|pg| pg.id()).collect();
    let mut rng = StdRng::seed_from_u64(sim.seed.wrapping_add(conn * 7919 + 17));
    let ops = sim.ops_per_connection;
    let objects = sim.objects.max(1);
    let write_ratio = sim.write_ratio;
    let balance_reads = sim.balance_reads;

    tokio::spawn(async move {
        let connection = Arc::new(MemoryConnection::new(ConnectionId(conn)));
        let mut handles = Vec::with_capacity(ops as usize);
        for tid in 0..ops {
            let pgid = pg_ids[rng.random_range(0..pg_ids.len())];
            let object = object_name(rng.random_range(0..objects));
            let (sub_ops, flags) = if rng.random_bool(write_ratio) {
                let data = format!("{conn}:{tid}").into_bytes();
                (vec![SubOp::WriteFull { data }], OpFlags::ACK | OpFlags::ONDISK)
            } else if balance_reads {
                (
                    vec![SubOp::Read { offset: 0, length: 0 }],
                    OpFlags::ACK | OpFlags::BALANCE_READS,
                )
            } else {
                (vec![SubOp::Read { offset: 0, length: 0 }], OpFlags::ACK)
            };
            let epoch = map.current_epoch();
            let msg = ClientMessage::new(
                RequestId {
                    client: conn,
                    incarnation: 0,
                    tid,
                },
                pgid,
                object,
                sub_ops,
            )
            .with_flags(flags)
            .with_epochs(epoch, epoch);
            match service.submit(connection.clone(), msg) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    debug!(conn, tid, error = %e, "submission refused");
                    break;
                }
            }
        }

        let mut counts: Vec<(RequestOutcome, u64)> = Vec::new();
        for handle in handles {
            let outcome = handle.await?;
            match counts.iter_mut().find(|(o, _)| *o == outcome) {
                Some((_, count)) => *count += 1,
                None => counts.push((outcome, 1)),
            }
        }
        info!(conn, replies = connection.reply_count(), "client finished");
        Ok(counts)
    })
}

fn spawn_restart_counter(
    node: &Node,
    restarts: Arc<AtomicU64>,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = node.events.subscribe::<RequestRestarted>();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(_) => {
                        restarts.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                },
                _ = finished(&mut done) => break,
            }
        }
    })
}

/// Periodically start a new interval on a random placement group, keeping
/// this node's role, and reactivate it shortly after.
fn spawn_churn(node: &Node, seed: u64, mut done: watch::Receiver<bool>) -> JoinHandle<()> {
    let map = node.map.clone();
    let pgs = node.pgs.clone();
    let mut rng = StdRng::seed_from_u64(seed);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = finished(&mut done) => break,
            }

            let epoch = map.current_epoch().next();
            let pg = &pgs[rng.random_range(0..pgs.len())];
            let primary_changed = rng.random_bool(0.2);
            for other in &pgs {
                other.advance_map(epoch);
            }
            pg.start_interval(epoch, pg.role(), primary_changed);
            map.advance_to(epoch);

            tokio::time::sleep(Duration::from_millis(2)).await;
            pg.set_active(true);
        }
    })
}

async fn finished(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|d| *d).await;
}
