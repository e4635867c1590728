//! HTTP surface: the ERP webhook endpoint, the operator API, and the SSE
//! lifecycle stream. All state is shared through `AppState`; error
//! responses use a uniform `{error, message}` envelope.

mod error;
mod http;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use relay_agents::AgentRuntime;
use relay_automations::{
    cash_flow::CashFlowAutomation, credit::CreditAutomation, dedup::DeduplicationAutomation,
    documents::DocumentAutomation, month_end::MonthEndAutomation, recon::ReconciliationAutomation,
    report::ReportAutomation, AutomationRegistry,
};
use relay_orchestrator::{ApprovalService, EventBus, Orchestrator, RelayConfig};
use relay_store::Store;

pub use error::{ApiError, ApiResult};
pub use http::router;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<AutomationRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub approvals: Arc<ApprovalService>,
    pub runtime: Arc<AgentRuntime>,
    pub bus: EventBus,
    pub config: Arc<RelayConfig>,
    // Typed handles for the automations the operator API drives directly.
    pub recon: Arc<ReconciliationAutomation>,
    pub dedup: Arc<DeduplicationAutomation>,
    pub credit: Arc<CreditAutomation>,
    pub cash_flow: Arc<CashFlowAutomation>,
    pub documents: Arc<DocumentAutomation>,
    pub month_end: Arc<MonthEndAutomation>,
    pub reports: Arc<ReportAutomation>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("relay server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
