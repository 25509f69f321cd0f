//! Wager Settlement CLI
//!
//! Settles contests, reconciles external game records and runs the
//! reconciliation schedule.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wager_settlement::{
    CommissionCascade, Config, Database, HierarchyResolver, HttpGameProvider, ReconciliationService,
    SettlementMetrics, SettlementOrchestrator, SqliteMarkerStore,
};

#[derive(Parser)]
#[command(name = "wager-settlement")]
#[command(about = "Wager settlement and commission payout engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation schedule until interrupted
    Run,

    /// Settle a finished contest
    Settle {
        /// Contest to settle
        #[arg(short, long)]
        contest_id: i64,
    },

    /// Run one reconciliation cycle, including running-balance games
    Reconcile,

    /// Run the unsettled-record sweep once
    Sweep,

    /// Show a user's ledger totals for a day
    Stats {
        #[arg(short, long)]
        user_id: i64,

        /// Day in the processing timezone (defaults to today)
        #[arg(short, long)]
        day: Option<NaiveDate>,
    },
}

struct Engine {
    db: Database,
    cascade: CommissionCascade,
    metrics: SettlementMetrics,
}

impl Engine {
    async fn open(config: &Config) -> Result<Self> {
        let db = Database::new(&config.database_path)
            .await
            .with_context(|| format!("Failed to open {}", config.database_path))?;
        let resolver = HierarchyResolver::new(db.pool().clone(), config.hierarchy_cache_ttl, config.platform_root_id);
        let cascade = CommissionCascade::new(db.pool().clone(), resolver);
        Ok(Self {
            db,
            cascade,
            metrics: SettlementMetrics::new(),
        })
    }

    fn reconciliation(&self, config: &Config) -> Result<ReconciliationService> {
        let provider = HttpGameProvider::new(&config.provider).context("Failed to build provider client")?;
        Ok(ReconciliationService::new(
            self.db.clone(),
            Arc::new(provider),
            Arc::new(SqliteMarkerStore::new(self.db.pool().clone())),
            self.cascade.clone(),
            config.reconcile.clone(),
            config.marker_ttl,
            config.processing_timezone,
            self.metrics.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging, RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let engine = Engine::open(&config).await?;

    match cli.command {
        Commands::Run => run_schedule(&config, &engine).await?,
        Commands::Settle { contest_id } => settle(&config, &engine, contest_id).await?,
        Commands::Reconcile => reconcile(&config, &engine).await?,
        Commands::Sweep => sweep(&config, &engine).await?,
        Commands::Stats { user_id, day } => show_stats(&config, &engine, user_id, day).await?,
    }

    Ok(())
}

async fn run_schedule(config: &Config, engine: &Engine) -> Result<()> {
    let service = Arc::new(engine.reconciliation(config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!(
        "Starting reconciliation every {:?}, sweep at {:02}:00 {}",
        config.reconcile.interval, config.reconcile.sweep_hour, config.processing_timezone
    );
    let handles = service.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested, waiting for running jobs");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Task ended abnormally: {}", e);
        }
    }

    let snapshot = engine.metrics.snapshot();
    info!("Final metrics: {}", serde_json::to_string(&snapshot)?);
    Ok(())
}

async fn settle(config: &Config, engine: &Engine, contest_id: i64) -> Result<()> {
    let orchestrator = SettlementOrchestrator::new(
        engine.db.clone(),
        engine.cascade.clone(),
        config.settlement.clone(),
        config.processing_timezone,
        engine.metrics.clone(),
    );

    let report = orchestrator.settle_contest(contest_id).await?;

    println!("\n{}", "=".repeat(70));
    println!("  CONTEST {} SETTLEMENT", contest_id);
    println!("{}\n", "=".repeat(70));

    if report.already_settled {
        println!("Contest was already settled, nothing written.");
        return Ok(());
    }

    println!("  Wagers Settled:  {}", report.wagers_settled);
    println!("  Winner:          {:?}", report.winner);
    println!("  Net to Bettors:  {}", report.total_net);
    println!("  Total Payout:    {}", report.total_payout);
    Ok(())
}

async fn reconcile(config: &Config, engine: &Engine) -> Result<()> {
    let service = engine.reconciliation(config)?;

    let cycle = service.run_cycle().await?;
    let balance = service.run_running_balance_cycle().await?;

    println!("\n{}", "=".repeat(70));
    println!("  RECONCILIATION");
    println!("{}\n", "=".repeat(70));
    println!("  Users:           {} ({} failed)", cycle.users, cycle.failed_users);
    println!("  Records Stored:  {}", cycle.stored);
    println!("  Records Posted:  {}", cycle.posted);
    println!("  Records Skipped: {}", cycle.skipped);
    println!("  Balance Posts:   {} of {} accounts ({} failed)", balance.postings, balance.checked, balance.failed);
    Ok(())
}

async fn sweep(config: &Config, engine: &Engine) -> Result<()> {
    let service = engine.reconciliation(config)?;
    let report = service.run_unsettled_sweep().await?;

    println!("\n{}", "=".repeat(70));
    println!("  UNSETTLED SWEEP");
    println!("{}\n", "=".repeat(70));
    println!("  Pending:         {}", report.pending);
    println!("  Resolved:        {}", report.resolved);
    println!("  Posted:          {}", report.posted);
    println!("  Failed:          {} games, {} users", report.failed_games, report.failed_users);
    println!("  Markers Purged:  {}", report.markers_purged);
    Ok(())
}

async fn show_stats(config: &Config, engine: &Engine, user_id: i64, day: Option<NaiveDate>) -> Result<()> {
    let day = day.unwrap_or_else(|| Utc::now().with_timezone(&config.processing_timezone).date_naive());

    println!("\n{}", "=".repeat(70));
    println!("  USER {} ON {}", user_id, day);
    println!("{}\n", "=".repeat(70));

    let Some(stats) = engine.db.daily_statistics(user_id, day).await? else {
        println!("No ledger activity.");
        return Ok(());
    };

    println!("Own Activity:");
    println!("  Gross Flow:      {}", stats.gross_flow);
    println!("  Actual Flow:     {}", stats.actual_flow);
    println!("  Settlement Flow: {}", stats.settlement_flow);
    println!("  Result:          {}", stats.result_amount);

    println!("\nDownline:");
    println!("  Gross Flow:      {}", stats.lower_level_flow);
    println!("  Actual Flow:     {}", stats.lower_level_actual_flow);
    println!("  Settlement Flow: {}", stats.lower_level_settlement_flow);
    println!("  Divided Below:   {}", stats.parent_divided_into);

    println!("\n  Payouts:         {}", engine.db.payout_total(user_id, day).await?);
    println!("  Wallet:          {}", engine.db.wallet_balance(user_id).await?);
    Ok(())
}
