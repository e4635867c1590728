use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use relay_store::{AuditFilter, RunFilter};
use relay_types::{ActionStatus, AutomationRule, AutomationType, Period};
use relay_wire::{
    AgentResumeRequest, AgentRunRequest, ApprovalRequest, ClosingStartRequest, CreditCheckRequest,
    DedupMergeRequest, DedupScanRequest, DocumentCorrectionRequest, ForecastQuery, PageQuery,
    ReconciliationMatchRequest, ReconciliationStartRequest, ReportGenerateRequest,
    RuleUpsertRequest, ScenarioRequest, WebhookAccepted, WebhookPayload,
};

use crate::error::{ApiError, ApiResult};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/audit", get(list_audit))
        .route("/stats", get(stats))
        .route("/rules", get(list_rules).post(upsert_rule))
        .route("/approvals", get(pending_approvals).post(decide_approval))
        .route("/close/start", post(close_start))
        .route("/close/{period}/status", get(close_status))
        .route("/reconciliation/start", post(recon_start))
        .route("/reconciliation/{id}/suggestions", get(recon_suggestions))
        .route("/reconciliation/{id}/match", post(recon_match))
        .route("/reconciliation/{id}/skip", post(recon_skip))
        .route("/reconciliation/{id}/complete", post(recon_complete))
        .route("/dedup/scan", post(dedup_scan))
        .route("/dedup/scans", get(dedup_scans))
        .route("/dedup/groups/{id}", get(dedup_group))
        .route("/dedup/groups/{id}/merge", post(dedup_merge))
        .route("/credit/check", post(credit_check))
        .route("/credit/batch-recalculate", post(credit_batch))
        .route("/credit/{customer_id}", get(credit_get))
        .route("/forecast/cashflow", get(forecast_cashflow))
        .route("/forecast/scenario", post(forecast_scenario))
        .route("/forecast/accuracy", get(forecast_accuracy))
        .route("/documents/process", post(document_process))
        .route("/documents/{id}", get(document_get))
        .route("/documents/{id}/correct", post(document_correct))
        .route("/reports/generate", post(report_generate))
        .route("/agents", get(list_agents))
        .route("/agents/run", post(agent_run))
        .route("/agents/runs", get(agent_runs))
        .route("/agents/runs/{id}", get(agent_run_get))
        .route("/agents/runs/{id}/resume", post(agent_resume))
        .route("/events", get(events))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/erp", post(webhook_erp))
        .nest("/api", api)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let configured = state.config.api_key.as_str();
    if configured.is_empty() {
        // No key configured: operator API is open (dev mode).
        return next.run(request).await;
    }
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(presented.as_bytes(), configured.as_bytes()) {
        return ApiError::unauthorized("missing or invalid X-API-Key").into_response();
    }
    next.run(request).await
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    mac.verify_slice(&expected).is_ok()
}

async fn webhook_erp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAccepted>> {
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&state.config.webhook_secret, &body, signature) {
        return Err(ApiError::unauthorized("webhook signature mismatch"));
    }

    let payload: WebhookPayload =
        serde_json::from_slice(&body).map_err(|e| ApiError::validation(e.to_string()))?;

    let outcome = state.orchestrator.ingest(payload).await?;
    Ok(Json(WebhookAccepted {
        accepted: true,
        audit_log_id: outcome.audit_log_id,
        run_id: outcome.run_id,
    }))
}

// ---------------------------------------------------------------------------
// Health / stats / audit / rules
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.audit_stats_today().await.is_ok();
    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "db_connected": db_ok,
        "automations": state.registry.len(),
    }))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.store.audit_stats_today().await?;
    Ok(Json(serde_json::to_value(stats).unwrap_or(Value::Null)))
}

#[derive(Debug, serde::Deserialize, Default)]
struct AuditQuery {
    status: Option<String>,
    automation_type: Option<String>,
    limit: Option<usize>,
}

async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Value>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            ActionStatus::parse(raw).ok_or_else(|| ApiError::validation("unknown status"))?,
        ),
        None => None,
    };
    let automation_type = match query.automation_type.as_deref() {
        Some(raw) => Some(
            AutomationType::parse(raw)
                .ok_or_else(|| ApiError::validation("unknown automation_type"))?,
        ),
        None => None,
    };
    let logs = state
        .store
        .list_audit(AuditFilter {
            status,
            automation_type,
            limit: query.limit.unwrap_or(100),
        })
        .await?;
    Ok(Json(json!({ "audit_logs": logs })))
}

async fn list_rules(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "rules": state.store.list_rules().await? })))
}

async fn upsert_rule(
    State(state): State<AppState>,
    Json(req): Json<RuleUpsertRequest>,
) -> ApiResult<Json<Value>> {
    let automation_type = AutomationType::parse(&req.automation_type)
        .ok_or_else(|| ApiError::validation("unknown automation_type"))?;
    if req.auto_approve_threshold < req.confidence_threshold {
        return Err(ApiError::validation(
            "auto_approve_threshold must be >= confidence_threshold",
        ));
    }
    let mut rule = AutomationRule::defaults(automation_type, &req.action_name);
    rule.name = req.name;
    rule.enabled = req.enabled;
    rule.confidence_threshold = req.confidence_threshold;
    rule.auto_approve = req.auto_approve;
    rule.auto_approve_threshold = req.auto_approve_threshold;
    rule.config = Value::Object(req.config);
    let id = state.store.upsert_rule(&rule).await?;
    Ok(Json(json!({"id": id})))
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

async fn pending_approvals(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "pending": state.store.pending_approvals().await? })))
}

async fn decide_approval(
    State(state): State<AppState>,
    Json(req): Json<ApprovalRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .approvals
        .decide(req.audit_log_id, req.approved, &req.approved_by)
        .await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------------
// Month-end close
// ---------------------------------------------------------------------------

async fn close_start(
    State(state): State<AppState>,
    Json(req): Json<ClosingStartRequest>,
) -> ApiResult<Json<Value>> {
    let period = Period::parse(&req.period)
        .ok_or_else(|| ApiError::validation("period must be YYYY-MM"))?;
    let closing_id = state.month_end.start_closing(period, &req.started_by).await?;
    Ok(Json(json!({"closing_id": closing_id, "period": period.to_string()})))
}

async fn close_status(
    State(state): State<AppState>,
    Path(period): Path<String>,
) -> ApiResult<Json<Value>> {
    let period =
        Period::parse(&period).ok_or_else(|| ApiError::validation("period must be YYYY-MM"))?;
    let closing = state
        .store
        .closing_for_period(&period.to_string())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no closing for {period}")))?;
    let steps = state.store.steps_for_closing(closing.id).await?;
    let done = steps.iter().filter(|s| s.status == "completed").count();
    let progress = if steps.is_empty() {
        0.0
    } else {
        (done as f64 / steps.len() as f64 * 1000.0).round() / 10.0
    };
    Ok(Json(json!({
        "closing": closing,
        "steps": steps,
        "overall_progress_pct": progress,
    })))
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

async fn recon_start(
    State(state): State<AppState>,
    Json(req): Json<ReconciliationStartRequest>,
) -> ApiResult<Json<Value>> {
    let summary = state.recon.start_session(req.journal_id, &req.user_id).await?;
    Ok(Json(serde_json::to_value(summary).unwrap_or(Value::Null)))
}

async fn recon_suggestions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Value>> {
    let (suggestions, total) = state
        .recon
        .suggestions(id, page.page.unwrap_or(1), page.limit.unwrap_or(20))
        .await?;
    Ok(Json(json!({"suggestions": suggestions, "total": total})))
}

async fn recon_match(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ReconciliationMatchRequest>,
) -> ApiResult<Json<Value>> {
    let session = state
        .recon
        .manual_match(id, req.bank_line_id, req.entry_id)
        .await?;
    Ok(Json(json!({ "session": session })))
}

async fn recon_skip(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let session = state.recon.skip_line(id).await?;
    Ok(Json(json!({ "session": session })))
}

async fn recon_complete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.recon.complete_session(id).await?;
    Ok(Json(json!({"completed": true})))
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

async fn dedup_scan(
    State(state): State<AppState>,
    Json(req): Json<DedupScanRequest>,
) -> ApiResult<Json<Value>> {
    let report = state
        .dedup
        .run_scan_type(&req.scan_type)
        .await
        .map_err(|e| ApiError::validation(e.to_string()))?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

async fn dedup_scans(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "scans": state.store.list_dedup_scans(50).await? })))
}

async fn dedup_group(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    let group = state.store.get_duplicate_group(id).await?;
    Ok(Json(json!({ "group": group })))
}

async fn dedup_merge(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<DedupMergeRequest>,
) -> ApiResult<Json<Value>> {
    let group = state
        .dedup
        .merge_group(id, req.master_record_id, &req.merged_by)
        .await?;
    Ok(Json(json!({ "group": group })))
}

// ---------------------------------------------------------------------------
// Credit
// ---------------------------------------------------------------------------

async fn credit_get(
    State(state): State<AppState>,
    Path(customer_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let score = match state.store.get_credit_score(customer_id).await? {
        Some(score) => score,
        None => state.credit.calculate_credit_score(customer_id).await?,
    };
    Ok(Json(json!({ "credit_score": score })))
}

async fn credit_check(
    State(state): State<AppState>,
    Json(req): Json<CreditCheckRequest>,
) -> ApiResult<Json<Value>> {
    if req.order_amount < 0.0 {
        return Err(ApiError::validation("order_amount must be non-negative"));
    }
    let check = state
        .credit
        .check_credit_on_order(req.customer_id, req.order_amount)
        .await?;
    Ok(Json(serde_json::to_value(check).unwrap_or(Value::Null)))
}

async fn credit_batch(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(state.credit.recalculate_all().await?))
}

// ---------------------------------------------------------------------------
// Forecasting
// ---------------------------------------------------------------------------

async fn forecast_cashflow(
    State(state): State<AppState>,
    Query(query): Query<ForecastQuery>,
) -> ApiResult<Json<Value>> {
    let report = state.cash_flow.generate_forecast(query.horizon).await?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

async fn forecast_scenario(
    State(state): State<AppState>,
    Json(req): Json<ScenarioRequest>,
) -> ApiResult<Json<Value>> {
    if req.name.trim().is_empty() {
        return Err(ApiError::validation("scenario name must not be empty"));
    }
    let report = state
        .cash_flow
        .run_scenario(&req.name, &req.description, &req.adjustments, req.horizon)
        .await?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

async fn forecast_accuracy(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(state.cash_flow.check_accuracy().await?))
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

async fn document_process(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let mut file_name = String::new();
    let mut content = String::new();
    let mut uploaded_by = "api".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                file_name = field.file_name().unwrap_or("document").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(e.to_string()))?;
                content = String::from_utf8_lossy(&bytes).to_string();
            }
            "uploaded_by" => {
                uploaded_by = field
                    .text()
                    .await
                    .map_err(|e| ApiError::validation(e.to_string()))?;
            }
            _ => {}
        }
    }

    if file_name.is_empty() || content.is_empty() {
        return Err(ApiError::validation("multipart upload needs a `file` part"));
    }

    let file_type = file_name.rsplit('.').next().unwrap_or("txt").to_string();
    let job = state
        .documents
        .process_document(&file_name, &file_type, &content, &uploaded_by)
        .await?;
    Ok(Json(json!({ "job": job })))
}

async fn document_get(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "job": state.store.get_document_job(id).await? })))
}

async fn document_correct(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<DocumentCorrectionRequest>,
) -> ApiResult<Json<Value>> {
    let job = state
        .documents
        .correct_field(id, &req.field_name, &req.corrected_value, &req.corrected_by)
        .await?;
    Ok(Json(json!({ "job": job })))
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

async fn report_generate(
    State(state): State<AppState>,
    Json(req): Json<ReportGenerateRequest>,
) -> ApiResult<Json<Value>> {
    if req.query.trim().is_empty() {
        return Err(ApiError::validation("query must not be empty"));
    }
    let job = state.reports.generate_report(&req.query, &req.requested_by).await?;
    Ok(Json(json!({ "job": job })))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let agents: Vec<Value> = state
        .runtime
        .registry()
        .list()
        .into_iter()
        .map(|(agent_type, description)| json!({"agent_type": agent_type, "description": description}))
        .collect();
    Ok(Json(json!({ "agents": agents })))
}

async fn agent_run(
    State(state): State<AppState>,
    Json(req): Json<AgentRunRequest>,
) -> ApiResult<Json<Value>> {
    if state.runtime.registry().get(&req.agent_type).is_none() {
        return Err(ApiError::validation(format!(
            "unknown agent_type `{}`",
            req.agent_type
        )));
    }
    let report = state
        .runtime
        .run(
            &req.agent_type,
            req.trigger_type.as_deref().unwrap_or("api"),
            req.trigger_id.as_deref(),
            req.initial_state,
            CancellationToken::new(),
        )
        .await?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

#[derive(Debug, serde::Deserialize, Default)]
struct RunsQuery {
    agent_type: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
}

async fn agent_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Value>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            relay_types::AgentRunStatus::parse(raw)
                .ok_or_else(|| ApiError::validation("unknown status"))?,
        ),
        None => None,
    };
    let runs = state
        .store
        .list_runs(RunFilter {
            agent_type: query.agent_type,
            status,
            limit: query.limit.unwrap_or(50),
        })
        .await?;
    Ok(Json(json!({ "runs": runs })))
}

async fn agent_run_get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let run = state.store.get_run(id).await?;
    let steps = state.store.steps_for_run(id).await?;
    let suspension = state.store.open_suspension_for(id).await?;
    Ok(Json(json!({"run": run, "steps": steps, "open_suspension": suspension})))
}

async fn agent_resume(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AgentResumeRequest>,
) -> ApiResult<Json<Value>> {
    let report = state
        .runtime
        .resume(id, req.event_data, CancellationToken::new())
        .await
        .map_err(|e| ApiError::business(e.to_string()))?;
    Ok(Json(serde_json::to_value(report).unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------------
// Lifecycle event stream
// ---------------------------------------------------------------------------

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| {
        event.ok().map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok(Event::default().event(event.kind()).data(data))
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
