//! Router-level tests: auth, webhook signature verification, and the
//! validation/error envelope, driven through tower's oneshot.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use tower::ServiceExt;

use relay_agents::{AgentConfig, AgentRegistry, AgentRuntime, AgentServices};
use relay_automations::{
    cash_flow::CashFlowAutomation, credit::CreditAutomation, dedup::DeduplicationAutomation,
    documents::DocumentAutomation, month_end::MonthEndAutomation, recon::ReconciliationAutomation,
    report::ReportAutomation, Automation, AutomationRegistry, Dispatcher, GatingDefaults,
};
use relay_orchestrator::{
    ApprovalService, EventBus, Orchestrator, RelayConfig, WorkerPool,
};
use relay_providers::{
    Domain, ErpClient, ErpError, ErpResult, LlmAnalysis, LlmClient, LlmMessage, LlmResult,
    NoopNotifier, ToolSpec,
};
use relay_server::{router, AppState};
use relay_store::Store;

struct NullErp;

#[async_trait]
impl ErpClient for NullErp {
    async fn search(&self, _: &str, _: &Domain, _: Option<usize>) -> ErpResult<Vec<i64>> {
        Ok(Vec::new())
    }
    async fn read(&self, model: &str, id: i64, _: &[&str]) -> ErpResult<Map<String, Value>> {
        Err(ErpError::Remote(format!("{model} {id} not found")))
    }
    async fn search_read(
        &self,
        _: &str,
        _: &Domain,
        _: &[&str],
        _: Option<usize>,
        _: Option<&str>,
    ) -> ErpResult<Vec<Map<String, Value>>> {
        Ok(Vec::new())
    }
    async fn search_count(&self, _: &str, _: &Domain) -> ErpResult<i64> {
        Ok(0)
    }
    async fn create(&self, _: &str, _: Map<String, Value>) -> ErpResult<i64> {
        Ok(1)
    }
    async fn write(&self, _: &str, _: &[i64], _: Map<String, Value>) -> ErpResult<bool> {
        Ok(true)
    }
    async fn execute_method(&self, _: &str, _: &str, _: &[i64], _: Vec<Value>) -> ErpResult<Value> {
        Ok(json!(true))
    }
}

struct NullLlm;

#[async_trait]
impl LlmClient for NullLlm {
    async fn analyze(
        &self,
        _: &str,
        _: &str,
        _: &[ToolSpec],
        _: Option<u32>,
    ) -> LlmResult<LlmAnalysis> {
        Ok(LlmAnalysis::default())
    }
    async fn analyze_with_history(
        &self,
        _: &str,
        _: &[LlmMessage],
        _: &[ToolSpec],
    ) -> LlmResult<LlmAnalysis> {
        Ok(LlmAnalysis::default())
    }
}

const WEBHOOK_SECRET: &str = "test-webhook-secret";
const API_KEY: &str = "test-api-key";

async fn test_state() -> AppState {
    let store = Arc::new(Store::in_memory().await.unwrap());
    let erp: Arc<dyn ErpClient> = Arc::new(NullErp);
    let llm: Arc<dyn LlmClient> = Arc::new(NullLlm);

    let recon = ReconciliationAutomation::new(erp.clone(), store.clone());
    let dedup = DeduplicationAutomation::new(erp.clone(), llm.clone(), store.clone());
    let credit = CreditAutomation::new(erp.clone(), store.clone());
    let cash_flow = CashFlowAutomation::new(erp.clone(), store.clone());
    let documents = DocumentAutomation::new(erp.clone(), llm.clone(), store.clone());
    let month_end = MonthEndAutomation::new(erp.clone(), llm.clone(), store.clone());
    let reports = ReportAutomation::new(erp.clone(), llm.clone(), store.clone());

    let mut registry = AutomationRegistry::new();
    registry.register(recon.clone() as Arc<dyn Automation>);
    registry.register(dedup.clone() as Arc<dyn Automation>);
    registry.register(credit.clone() as Arc<dyn Automation>);
    let registry = Arc::new(registry);

    let agent_registry = Arc::new(AgentRegistry::with_builtin_agents().unwrap());
    let store_for_services = store.clone();
    let erp_for_services = erp.clone();
    let llm_for_services = llm.clone();
    let runtime = Arc::new(AgentRuntime::new(
        store.clone(),
        agent_registry,
        Box::new(move || {
            AgentServices::new(
                erp_for_services.clone(),
                llm_for_services.clone(),
                store_for_services.clone(),
                Arc::new(NoopNotifier),
            )
        }),
        AgentConfig::default(),
    ));

    let bus = EventBus::new();
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), GatingDefaults::default()));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        registry.clone(),
        dispatcher,
        runtime.clone(),
        Arc::new(WorkerPool::new(2, 16)),
        bus.clone(),
        300,
        HashMap::new(),
    ));
    let approvals = Arc::new(ApprovalService::new(store.clone(), registry.clone(), bus.clone()));

    let mut config = RelayConfig::default();
    config.webhook_secret = WEBHOOK_SECRET.to_string();
    config.api_key = API_KEY.to_string();

    AppState {
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
    }
}

fn sign(body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn webhook_body(record_id: i64) -> String {
    json!({
        "event_type": "create",
        "model": "sale.order",
        "record_id": record_id,
        "values": {"partner_id": [42, "Acme"], "amount_total": 100.0},
        "timestamp": "2026-03-01T10:00:00Z",
        "user_id": 2
    })
    .to_string()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn health_is_open() {
    let app = router(test_state().await);
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn api_requires_key() {
    let app = router(test_state().await);
    let response = app
        .clone()
        .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("authentication_failure"));

    let response = app
        .oneshot(
            Request::get("/api/stats")
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn webhook_rejects_bad_signature() {
    let app = router(test_state().await);
    let body = webhook_body(1);
    let response = app
        .oneshot(
            Request::post("/webhooks/erp")
                .header("x-webhook-signature", "deadbeef")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_accepts_then_dedups() {
    let app = router(test_state().await);
    let body = webhook_body(7);
    let signature = sign(&body);

    let request = |body: String, signature: String| {
        Request::post("/webhooks/erp")
            .header("x-webhook-signature", signature)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    };

    let response = app
        .clone()
        .oneshot(request(body.clone(), signature.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let accepted = body_json(response).await;
    assert_eq!(accepted["accepted"], json!(true));

    let response = app.oneshot(request(body, signature)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn webhook_rejects_malformed_payload() {
    let app = router(test_state().await);
    let body = r#"{"event_type": "create"}"#.to_string();
    let signature = sign(&body);
    let response = app
        .oneshot(
            Request::post("/webhooks/erp")
                .header("x-webhook-signature", signature)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("validation_failure"));
}

#[tokio::test]
async fn close_start_validates_period() {
    let app = router(test_state().await);
    let response = app
        .oneshot(
            Request::post("/api/close/start")
                .header("x-api-key", API_KEY)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"period": "march-2026"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn approval_on_missing_row_is_404() {
    let app = router(test_state().await);
    let response = app
        .oneshot(
            Request::post("/api/approvals")
                .header("x-api-key", API_KEY)
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"audit_log_id": 999, "approved": true, "approved_by": "qa"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_agent_type_is_validation_failure() {
    let app = router(test_state().await);
    let response = app
        .oneshot(
            Request::post("/api/agents/run")
                .header("x-api-key", API_KEY)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"agent_type": "time_machine"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn agent_run_and_fetch_round_trip() {
    let app = router(test_state().await);
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/agents/run")
                .header("x-api-key", API_KEY)
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"agent_type": "collection", "initial_state": {"invoice_id": 0}}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report = body_json(response).await;
    let run_id = report["run_id"].as_i64().unwrap();
    assert_eq!(report["status"], json!("completed"));

    let response = app
        .oneshot(
            Request::get(format!("/api/agents/runs/{run_id}"))
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["run"]["id"], json!(run_id));
    assert!(body["steps"].as_array().unwrap().len() >= 3);
}
