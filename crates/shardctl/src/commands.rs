use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use shardconn::errors::ConnError;
use shardconn::{KeyRouter, ShardConfig, ShardKey, ShardedConnections, UnknownKeyPolicy};
use tokio::runtime::{Builder, Runtime};
use tracing::info;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the shard each key routes to.
    Route(RouteArgs),
    /// Execute a statement on every shard.
    Exec(ExecArgs),
    /// Check that every shard accepts queries.
    Ping(PingArgs),
}

impl Commands {
    pub fn run(self) -> Result<()> {
        match self {
            Commands::Route(route) => route.run(),
            Commands::Exec(exec) => exec.run(),
            Commands::Ping(ping) => ping.run(),
        }
    }
}

#[derive(Debug, Args)]
pub struct RouteArgs {
    /// Number of shards.
    #[clap(long, required_unless_present = "config", conflicts_with = "config")]
    pub nodes: Option<NonZeroUsize>,

    /// Take the node count and unknown key policy from a config file.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Keys to route. Keys that parse as integers route as integers.
    #[clap(required = true)]
    pub keys: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Path to the shard config.
    #[clap(long)]
    pub config: PathBuf,

    /// Statement to execute.
    pub sql: String,
}

#[derive(Debug, Args)]
pub struct PingArgs {
    /// Path to the shard config.
    #[clap(long)]
    pub config: PathBuf,
}

trait RunCommand {
    fn run(self) -> Result<()>;
}

impl RunCommand for RouteArgs {
    fn run(self) -> Result<()> {
        let router = match (self.nodes, &self.config) {
            (Some(nodes), None) => KeyRouter::new(nodes, UnknownKeyPolicy::default()),
            (None, Some(path)) => {
                let config = ShardConfig::from_path(path)?;
                let nodes = NonZeroUsize::new(config.nodes.len())
                    .ok_or_else(|| anyhow!("config '{}' lists no nodes", path.display()))?;
                KeyRouter::new(nodes, config.unknown_keys)
            }
            _ => return Err(anyhow!("exactly one of --nodes or --config is required")),
        };

        for raw in &self.keys {
            let key = parse_key(raw);
            let shard = router.route(&key)?;
            println!("{key}\t{shard}");
        }
        Ok(())
    }
}

impl RunCommand for ExecArgs {
    fn run(self) -> Result<()> {
        let config = ShardConfig::from_path(&self.config)?;
        let runtime = build_runtime("exec")?;
        runtime.block_on(async move {
            let set = ShardedConnections::from_config(&config)?;
            info!(nodes = set.node_count(), sql = %self.sql, "broadcasting statement");
            let results = set.broadcast(self.sql.as_str()).await;
            report(&results, |rows| format!("{rows} rows"))
        })
    }
}

impl RunCommand for PingArgs {
    fn run(self) -> Result<()> {
        let config = ShardConfig::from_path(&self.config)?;
        let runtime = build_runtime("ping")?;
        runtime.block_on(async move {
            let set = ShardedConnections::from_config(&config)?;
            let results = set.broadcast("SELECT 1").await;
            report(&results, |_| "ok".to_string())
        })
    }
}

/// Print one line per shard, failing if any shard failed.
fn report(results: &[Result<u64, ConnError>], ok: impl Fn(u64) -> String) -> Result<()> {
    let mut failed = 0;
    for (shard, result) in results.iter().enumerate() {
        match result {
            Ok(rows) => println!("shard {shard}: {}", ok(*rows)),
            Err(e) => {
                failed += 1;
                println!("shard {shard}: error: {e}");
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {} shards failed", results.len()));
    }
    Ok(())
}

/// Parse a key from the command line.
///
/// Integers become integer keys, anything else is text.
pub fn parse_key(s: &str) -> ShardKey {
    if let Ok(v) = s.parse::<i128>() {
        return v.into();
    }
    if let Ok(v) = s.parse::<u128>() {
        return v.into();
    }
    s.into()
}

fn build_runtime(thread_label: &'static str) -> Result<Runtime> {
    let runtime = Builder::new_multi_thread()
        .thread_name_fn(move || {
            static THREAD_ID: AtomicU64 = AtomicU64::new(0);
            let id = THREAD_ID.fetch_add(1, Ordering::Relaxed);
            format!("{thread_label}-thread-{id}")
        })
        .enable_all()
        .build()?;

    Ok(runtime)
}
