use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use switchyard_core::{
    AgentInvoker, AgentRegistry, BreakerAvailability, Dispatcher, EventBus, GatewayConfig,
    InvokerTaskCaller,
};
use switchyard_gates::{BudgetGate, QuotaGate};
use switchyard_ledger::CostLedger;
use switchyard_observability::{init_process_logging, AlertLog, ProcessKind};
use switchyard_providers::BackendRegistry;
use switchyard_resilience::{ActivityTable, BreakerRegistry, HeartbeatMonitor};
use switchyard_router::{FullyAvailable, Router};
use switchyard_server::{serve, AppState};
use switchyard_workflow::{load_definitions, ExecutionStore, WorkflowEngine};

#[derive(Parser, Debug)]
#[command(name = "switchyard-engine")]
#[command(about = "Multi-agent orchestration gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        #[arg(long, alias = "host")]
        hostname: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Print the routing decision for a query without invoking anything.
    Route {
        query: String,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let config = GatewayConfig::load(&state_dir.join("config.json"))?;
            let _log_guard = init_process_logging(
                ProcessKind::Engine,
                &state_dir.join("logs"),
                config.log_retention_days,
            )?;

            let hostname = hostname.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;

            let (state, monitor_handle) = build_state(config, &state_dir).await?;
            log_startup_paths(&state_dir, &addr);
            let result = serve(addr, state).await;
            monitor_handle.abort();
            result?;
        }
        Command::Route { query, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let config = GatewayConfig::load(&state_dir.join("config.json"))?;
            let router = Router::new(
                config.router.clone(),
                config.pricing_table(),
                Arc::new(FullyAvailable),
            );
            let agents = config.agents.clone();
            let decision = router.route(&query, "cli", 0, &agents).await?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SWITCHYARD_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".switchyard")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting switchyard-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} config_path={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        state_dir.join("config.json").display()
    );
}

/// Construct the shared control plane in dependency order: ledger, breaker
/// registry, heartbeat monitor, router, workflow engine, dispatcher.
/// Workflow recovery runs here, before the listener ever binds.
async fn build_state(
    config: GatewayConfig,
    state_dir: &PathBuf,
) -> anyhow::Result<(AppState, tokio::task::JoinHandle<()>)> {
    let config = Arc::new(config);
    let pricing = config.pricing_table();

    let ledger = Arc::new(CostLedger::new(
        GatewayConfig::resolve_path(state_dir, config.ledger.path.as_deref(), "costs.jsonl"),
        config.ledger.sync_on_append,
    )?);
    let alerts = Arc::new(AlertLog::new(GatewayConfig::resolve_path(
        state_dir,
        config.alerts.path.as_deref(),
        "alerts.jsonl",
    ))?);

    let breakers = BreakerRegistry::new(config.breaker.clone());

    let activity = ActivityTable::new();
    let monitor = Arc::new(HeartbeatMonitor::new(
        activity.clone(),
        config.heartbeat.clone(),
        alerts.clone(),
    ));
    let monitor_handle = monitor.spawn();

    let events = EventBus::new();
    let quota = QuotaGate::new(config.quota.clone());
    let budget = Arc::new(BudgetGate::new(
        config.budget.clone(),
        config.projects.clone(),
        pricing.clone(),
        ledger.clone(),
    ));

    let registry = AgentRegistry::new(config.agents.clone());
    let invoker = Arc::new(AgentInvoker::new(
        BackendRegistry::new(&config.backends),
        breakers.clone(),
        activity.clone(),
        config.retry.clone(),
        pricing.clone(),
        ledger.clone(),
        quota.clone(),
        alerts.clone(),
        events.clone(),
    ));

    let router = Arc::new(Router::new(
        config.router.clone(),
        pricing,
        Arc::new(BreakerAvailability::new(breakers.clone())),
    ));

    let store = Arc::new(ExecutionStore::new(state_dir.join("executions"))?);
    let caller = Arc::new(InvokerTaskCaller::new(
        invoker.clone(),
        registry.clone(),
        "workflows".to_string(),
    ));
    let workflows = Arc::new(WorkflowEngine::new(store, ledger.clone(), caller));
    workflows
        .register_definitions(load_definitions(&state_dir.join("workflows"))?)
        .await;
    let recovered = workflows.recover_on_startup().await?;
    if recovered > 0 {
        info!(recovered, "interrupted workflow executions reported for reissue");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        router,
        quota.clone(),
        budget.clone(),
        invoker,
        config.estimate.clone(),
        events.clone(),
    ));

    Ok((
        AppState {
            config,
            dispatcher,
            workflows,
            breakers,
            activity,
            ledger,
            alerts,
            budget,
            quota,
            events,
            started_at_ms: switchyard_server::now_ms(),
        },
        monitor_handle,
    ))
}
