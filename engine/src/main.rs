use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use relay_agents::{AgentConfig, AgentRegistry, AgentRuntime, AgentServices};
use relay_automations::{
    accounting::AccountingAutomation, cash_flow::CashFlowAutomation, credit::CreditAutomation,
    crm::CrmAutomation, dedup::DeduplicationAutomation, digest::DigestAutomation,
    documents::DocumentAutomation, hr::HrAutomation, month_end::MonthEndAutomation,
    project::ProjectAutomation, purchase::PurchaseAutomation, recon::ReconciliationAutomation,
    report::ReportAutomation, sales::SalesAutomation, supply_chain::SupplyChainAutomation,
    Automation, AutomationRegistry, Dispatcher, GatingDefaults,
};
use relay_observability::{init_process_logging, ProcessKind};
use relay_orchestrator::{
    ApprovalService, EventBus, Orchestrator, RelayConfig, Scheduler, WorkerPool,
};
use relay_providers::{
    ErpClient, HttpLlmClient, JsonRpcErp, LlmClient, NoopNotifier, Notifier, WebhookNotifier,
};
use relay_server::{serve, AppState};
use relay_store::Store;

#[derive(Parser, Debug)]
#[command(name = "relay-engine")]
#[command(about = "AI automation orchestrator beside an ERP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service, scheduler, and worker pool.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 8088)]
        port: u16,
        #[arg(long, env = "RELAY_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// Initialize the database schema and exit.
    Migrate {
        #[arg(long, env = "RELAY_STATE_DIR")]
        state_dir: Option<String>,
    },
    /// One-shot sweep of expired agent suspensions.
    Sweep {
        #[arg(long, env = "RELAY_STATE_DIR")]
        state_dir: Option<String>,
    },
}

// Exit codes: 0 success, 1 config error, 2 authentication/secret error,
// 3 runtime error.
const EXIT_CONFIG: u8 = 1;
const EXIT_AUTH: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => run_serve(hostname, port, resolve_state_dir(state_dir)).await,
        Command::Migrate { state_dir } => run_migrate(resolve_state_dir(state_dir)).await,
        Command::Sweep { state_dir } => run_sweep(resolve_state_dir(state_dir)).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("relay-engine: {err:#}");
            ExitCode::from(err.exit_code)
        }
    }
}

struct CliError {
    exit_code: u8,
    source: anyhow::Error,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

trait IntoCliError<T> {
    fn or_exit(self, exit_code: u8) -> Result<T, CliError>;
}

impl<T> IntoCliError<T> for anyhow::Result<T> {
    fn or_exit(self, exit_code: u8) -> Result<T, CliError> {
        self.map_err(|source| CliError { exit_code, source })
    }
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    flag.map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".relay"))
}

async fn run_migrate(state_dir: PathBuf) -> Result<(), CliError> {
    let store = Store::open(&state_dir.join("relay.db"))
        .await
        .map_err(anyhow::Error::from)
        .or_exit(EXIT_RUNTIME)?;
    store
        .init_schema()
        .await
        .map_err(anyhow::Error::from)
        .or_exit(EXIT_RUNTIME)?;
    println!("schema ready at {}", state_dir.join("relay.db").display());
    Ok(())
}

async fn run_sweep(state_dir: PathBuf) -> Result<(), CliError> {
    let config = RelayConfig::load(&state_dir.join("config.json")).or_exit(EXIT_CONFIG)?;
    let state = build_state(&state_dir, config).await.or_exit(EXIT_CONFIG)?;
    let failed = state
        .runtime
        .sweep_expired_suspensions()
        .await
        .or_exit(EXIT_RUNTIME)?;
    println!("expired suspensions swept: {}", failed.len());
    Ok(())
}

async fn run_serve(hostname: String, port: u16, state_dir: PathBuf) -> Result<(), CliError> {
    let (_guard, log_info) = init_process_logging(
        ProcessKind::Service,
        &relay_observability::canonical_logs_dir_from_root(&state_dir),
        14,
    )
    .or_exit(EXIT_RUNTIME)?;
    info!(logs_dir = %log_info.logs_dir, "logging initialized");

    let config = RelayConfig::load(&state_dir.join("config.json")).or_exit(EXIT_CONFIG)?;
    if config.webhook_secret.is_empty() {
        return Err(CliError {
            exit_code: EXIT_AUTH,
            source: anyhow::anyhow!(
                "webhook secret is not configured (set RELAY_WEBHOOK_SECRET or config.json)"
            ),
        });
    }

    let addr: SocketAddr = format!("{hostname}:{port}")
        .parse()
        .context("invalid hostname or port")
        .or_exit(EXIT_CONFIG)?;

    let state = build_state(&state_dir, config).await.or_exit(EXIT_CONFIG)?;

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::new(
        state.store.clone(),
        state.registry.clone(),
        state.runtime.clone(),
        state.bus.clone(),
        state.config.schedule.clone(),
    );
    let scheduler_handle = scheduler.spawn(cancel.clone());

    info!("starting relay-engine on http://{addr}");
    let result = serve(addr, state).await;
    cancel.cancel();
    let _ = scheduler_handle.await;
    result.or_exit(EXIT_RUNTIME)
}

async fn build_state(state_dir: &PathBuf, config: RelayConfig) -> anyhow::Result<AppState> {
    let store = Arc::new(Store::open(&state_dir.join("relay.db")).await?);

    let erp: Arc<dyn ErpClient> = match &config.erp {
        Some(erp_config) => Arc::new(JsonRpcErp::new(erp_config.clone())),
        None => anyhow::bail!("erp connection is not configured"),
    };
    let llm: Arc<dyn LlmClient> = match &config.llm {
        Some(llm_config) => Arc::new(HttpLlmClient::new(llm_config.clone())),
        None => anyhow::bail!("llm connection is not configured"),
    };
    let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new("slack", Some(url.clone()))),
        None => Arc::new(NoopNotifier),
    };

    // Typed automations shared between the registry and the operator API.
    let recon = ReconciliationAutomation::new(erp.clone(), store.clone());
    let dedup = DeduplicationAutomation::new(erp.clone(), llm.clone(), store.clone());
    let credit = CreditAutomation::new(erp.clone(), store.clone());
    let cash_flow = CashFlowAutomation::new(erp.clone(), store.clone());
    let documents = DocumentAutomation::new(erp.clone(), llm.clone(), store.clone());
    let month_end = MonthEndAutomation::new(erp.clone(), llm.clone(), store.clone());
    let reports = ReportAutomation::new(erp.clone(), llm.clone(), store.clone());

    // The static registration list: nothing registers itself on import.
    let mut registry = AutomationRegistry::new();
    registry.register(AccountingAutomation::new(erp.clone(), llm.clone()) as Arc<dyn Automation>);
    registry.register(recon.clone());
    registry.register(dedup.clone());
    registry.register(credit.clone());
    registry.register(cash_flow.clone());
    registry.register(documents.clone());
    registry.register(month_end.clone());
    registry.register(DigestAutomation::new(
        erp.clone(),
        llm.clone(),
        store.clone(),
        vec![notifier.clone()],
    ));
    registry.register(reports.clone());
    registry.register(SupplyChainAutomation::new(erp.clone(), store.clone()));
    registry.register(CrmAutomation::new(erp.clone(), llm.clone()));
    registry.register(SalesAutomation::new(erp.clone(), llm.clone()));
    registry.register(PurchaseAutomation::new(erp.clone()));
    registry.register(HrAutomation::new(erp.clone()));
    registry.register(ProjectAutomation::new(erp.clone()));
    let registry = Arc::new(registry);

    let agent_registry = Arc::new(AgentRegistry::with_builtin_agents()?);
    let services_store = store.clone();
    let services_erp = erp.clone();
    let services_llm = llm.clone();
    let services_notifier = notifier.clone();
    let runtime = Arc::new(AgentRuntime::new(
        store.clone(),
        agent_registry,
        Box::new(move || {
            AgentServices::new(
                services_erp.clone(),
                services_llm.clone(),
                services_store.clone(),
                services_notifier.clone(),
            )
        }),
        AgentConfig {
            max_steps: config.agent_max_steps,
            max_tokens: config.agent_max_tokens,
            loop_threshold: config.agent_loop_threshold,
            suspension_timeout_hours: config.agent_suspension_timeout_hours,
        },
    ));

    let bus = EventBus::new();
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        GatingDefaults {
            confidence_threshold: config.default_confidence_threshold,
            auto_approve_threshold: config.auto_approve_threshold,
        },
    ));
    let pool = Arc::new(WorkerPool::new(config.workers, config.queue_depth));
    let agent_routes: HashMap<String, String> = config
        .agent_routes
        .iter()
        .map(|route| (route.model.clone(), route.agent_type.clone()))
        .collect();

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        registry.clone(),
        dispatcher,
        runtime.clone(),
        pool,
        bus.clone(),
        config.dedup_window_secs,
        agent_routes,
    ));
    let approvals = Arc::new(ApprovalService::new(
        store.clone(),
        registry.clone(),
        bus.clone(),
    ));

    Ok(AppState {
        store,
        registry,
        orchestrator,
        approvals,
        runtime,
        bus,
        config: Arc::new(config),
        recon,
        dedup,
        credit,
        cash_flow,
        documents,
        month_end,
        reports,
    })
}
