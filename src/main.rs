//! putbot daemon entrypoint: wire the store, broker adapter, reasoning
//! engine, governors and learning loop, then hand control to the
//! orchestrator. Subcommands cover the daemon itself, an on-demand
//! reconcile pass, and a status readout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use putbot::broker::{BrokerAdapter, IbkrAdapter, PaperBroker, PaperBrokerConfig};
use putbot::config::Config;
use putbot::daemon::Orchestrator;
use putbot::engine::{LlmClient, ReasoningEngine};
use putbot::events::{EventBus, MarketCalendar};
use putbot::exec::ActionExecutor;
use putbot::learning::LearningLoop;
use putbot::memory::{Embedder, HashEmbedder, OpenRouterEmbedder, WorkingMemory};
use putbot::reconcile::Reconciler;
use putbot::store::Db;

#[derive(Parser)]
#[command(name = "putbot", about = "Autonomous cash-secured put daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default).
    Run,
    /// One reconciliation pass against broker truth.
    Reconcile {
        /// Import orphans and close out vanished positions instead of
        /// only recording them.
        #[arg(long)]
        live: bool,
    },
    /// Kill switch, heartbeat, queue and budget readout.
    Status,
}

struct Wiring {
    config: Config,
    db: Db,
    bus: EventBus,
    broker: Arc<dyn BrokerAdapter>,
    memory: Arc<WorkingMemory>,
    /// Present only for the live gateway; drives the polling pump.
    ibkr: Option<IbkrAdapter>,
}

fn wire(config: Config) -> Result<Wiring> {
    let db = Db::open(&config.database_path)?;
    putbot::store::fallback::replay_fallback(
        &db,
        &putbot::store::fallback::fallback_path(&config.database_path),
    )?;
    let bus = EventBus::new(db.clone(), config.events.max_retries);

    let mut ibkr = None;
    let broker: Arc<dyn BrokerAdapter> = if config.paper {
        info!("🧪 paper broker active (set PUTBOT_PAPER=0 for the gateway)");
        Arc::new(PaperBroker::new(PaperBrokerConfig::default()))
    } else {
        let adapter = IbkrAdapter::new(config.broker.clone())?;
        ibkr = Some(adapter.clone());
        info!(gateway = %config.broker.gateway_url, "IBKR gateway adapter active");
        Arc::new(adapter)
    };

    let http = reqwest::Client::new();
    let embedder: Arc<dyn Embedder> =
        match OpenRouterEmbedder::from_env(http, &config.engine.embed_model) {
            Ok(embedder) => Arc::new(embedder),
            Err(e) => {
                warn!("embeddings offline, falling back to hashing: {e:#}");
                Arc::new(HashEmbedder)
            }
        };

    let session_id = format!(
        "{}-{}",
        config.session_prefix,
        MarketCalendar.trading_date(chrono::Utc::now())
    );
    let memory = Arc::new(WorkingMemory::load_session(
        db.clone(),
        embedder,
        &session_id,
        &config.strategy,
        &config.autonomy,
    )?);

    Ok(Wiring {
        config,
        db,
        bus,
        broker,
        memory,
        ibkr,
    })
}

async fn run_daemon(wiring: Wiring) -> Result<()> {
    let Wiring {
        config,
        db,
        bus,
        broker,
        memory,
        ibkr,
    } = wiring;

    let llm = match LlmClient::from_env(reqwest::Client::new()) {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("reasoning engine offline, every event degrades to MONITOR_ONLY: {e:#}");
            None
        }
    };
    let engine = ReasoningEngine::new(llm, db.clone(), config.engine.clone());
    let executor = ActionExecutor::new(
        broker.clone(),
        db.clone(),
        memory.clone(),
        bus.clone(),
        config.clone(),
    );
    let reconciler = Reconciler::new(
        broker.clone(),
        db.clone(),
        bus.clone(),
        memory.clone(),
        false,
    );
    let learning = LearningLoop::new(
        db.clone(),
        memory.clone(),
        bus.clone(),
        config.events.learning_min_samples,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(adapter) = ibkr {
        tokio::spawn(adapter.run_event_pump(shutdown_rx.clone()));
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("signal received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let orchestrator = Orchestrator::new(
        db,
        bus,
        broker,
        memory,
        engine,
        executor,
        reconciler,
        learning,
        config,
    );
    orchestrator.run(shutdown_rx).await
}

async fn run_reconcile(wiring: Wiring, live: bool) -> Result<()> {
    let report = Reconciler::new(
        wiring.broker,
        wiring.db,
        wiring.bus,
        wiring.memory,
        live,
    )
    .run()
    .await?;
    println!(
        "reconcile{}: {} status updates, {} price discrepancies, {} commissions set, \
         {} orphans, {} local-only positions, {} assignments",
        if live { " (live)" } else { "" },
        report.status_updates,
        report.price_discrepancies,
        report.commissions_set,
        report.orphan_orders,
        report.local_only_positions,
        report.assignments_detected,
    );
    Ok(())
}

fn run_status(wiring: &Wiring) -> Result<()> {
    let db = &wiring.db;
    let (halted, reason) = db.kill_switch()?;
    println!(
        "kill switch: {}{}",
        if halted { "HALTED" } else { "clear" },
        reason.map(|r| format!(" ({r})")).unwrap_or_default()
    );
    match db.last_heartbeat()? {
        Some((ts, activity)) => {
            let age = chrono::Utc::now().timestamp() - ts;
            println!("heartbeat: {age}s ago ({activity})");
        }
        None => println!("heartbeat: never"),
    }
    if let Some(row) = db.latest_working_memory()? {
        println!("session: {} (autonomy L{})", row.session_id, row.autonomy_level);
    }
    println!("open trades: {}", db.open_trades()?.len());
    for (state, count) in db.event_counts()? {
        println!("events {state}: {count}");
    }
    let approvals = db.pending_approvals()?;
    println!("pending approvals: {}", approvals.len());
    for approval in approvals {
        println!(
            "  {} {} (urgency {})",
            approval.decision_id,
            approval.action,
            approval.urgency.as_deref().unwrap_or("normal")
        );
    }
    let budget = db.engine_budget()?;
    println!(
        "engine today: {} calls, {} tokens, ${:.2}",
        budget.calls, budget.tokens, budget.cost_usd
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load().context("load configuration")?;
    let wiring = wire(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(wiring).await,
        Command::Reconcile { live } => run_reconcile(wiring, live).await,
        Command::Status => run_status(&wiring),
    }
}
