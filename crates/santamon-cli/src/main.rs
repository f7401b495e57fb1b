//! Santamon CLI - detection sidecar for EDR telemetry spools

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use santamon_agent::config::Config;
use santamon_agent::engine::{load_rules, Engine};
use santamon_agent::pipeline;
use santamon_agent::state::StateStore;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "santamon")]
#[command(version)]
#[command(about = "On-endpoint detection sidecar for EDR telemetry", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "SANTAMON_CONFIG",
          default_value = "/etc/santamon/config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection agent
    Run {
        /// Verbose logging (debug level)
        #[arg(short, long)]
        verbose: bool,
    },

    /// Rule file operations
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },

    /// Show agent configuration and state summary
    Status,

    /// State database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum RulesCommands {
    /// Load and compile the rule set, reporting any errors
    Validate,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Show state database statistics
    Stats,
    /// Compact the state database
    Compact,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "santamon_agent={level},santamon_core={level},santamon_expr={level},santamon_cli={level},warn",
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { verbose } => {
            let cfg = Config::load(&cli.config)
                .with_context(|| format!("loading config from {}", cli.config.display()))?;
            let level = if verbose {
                "debug".to_string()
            } else {
                cfg.agent.log_level.clone()
            };
            init_tracing(&level);
            info!(version = env!("CARGO_PKG_VERSION"), agent_id = %cfg.agent.id, "starting agent");

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    info!("shutdown requested");
                    cancel.cancel();
                });
            }

            pipeline::run(cfg, cancel).await?;
        }

        Commands::Rules { command: RulesCommands::Validate } => {
            init_tracing("info");
            let cfg = Config::load_read_only(&cli.config)?;
            let ruleset = load_rules(&cfg.rules.path)
                .with_context(|| format!("loading rules from {}", cfg.rules.path.display()))?;
            let engine = Engine::compile(&ruleset, chrono_now())
                .context("compiling rules")?;
            let (rules, correlations, baselines) = engine.rule_count();
            println!(
                "rules OK: {} rules, {} correlations, {} baselines ({} total, {} enabled)",
                rules,
                correlations,
                baselines,
                ruleset.rules.len() + ruleset.correlations.len() + ruleset.baselines.len(),
                rules + correlations + baselines,
            );
        }

        Commands::Status => {
            init_tracing("warn");
            let cfg = Config::load_read_only(&cli.config)?;
            let store = open_store(&cfg)?;
            let stats = store.stats()?;

            println!("agent id:        {}", cfg.agent.id);
            println!("spool dir:       {}", cfg.spool.spool_dir.display());
            println!("rules path:      {}", cfg.rules.path.display());
            println!("state db:        {}", cfg.state.db_path.display());
            if let Some(started) = store.meta_get("agent_start_time")? {
                println!("last started:    {}", started);
            }
            if let Some(compacted) = store.meta_get("last_compaction")? {
                println!("last compaction: {}", compacted);
            }
            println!("queued signals:  {}", stats.queued_signals);
            println!("window events:   {}", stats.window_events);
            println!("first-seen keys: {}", stats.first_seen);
        }

        Commands::Db { command } => {
            init_tracing("warn");
            let cfg = Config::load_read_only(&cli.config)?;
            let store = open_store(&cfg)?;
            match command {
                DbCommands::Stats => {
                    let stats = store.stats()?;
                    println!("window events:   {}", stats.window_events);
                    println!("window groups:   {}", stats.window_groups);
                    println!("first-seen keys: {}", stats.first_seen);
                    println!("queued signals:  {}", stats.queued_signals);
                    println!("journal entries: {}", stats.journal_entries);
                    println!("file size:       {} bytes", stats.file_size_bytes);
                }
                DbCommands::Compact => {
                    let before = store.stats()?.file_size_bytes;
                    store.compact()?;
                    let after = store.stats()?.file_size_bytes;
                    println!("compacted: {} -> {} bytes", before, after);
                }
            }
        }

        Commands::Version => {
            println!("santamon {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

fn open_store(cfg: &Config) -> Result<StateStore> {
    StateStore::open(
        &cfg.state.db_path,
        cfg.state.sync_writes,
        cfg.state.first_seen.max_entries,
    )
    .with_context(|| format!("opening state db at {}", cfg.state.db_path.display()))
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("signal handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
