use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::domain::Domain;

#[derive(Error, Debug)]
pub enum ErpError {
    /// Network-level failure; the call may be retried.
    #[error("erp transport error: {0}")]
    Transport(String),

    /// Upstream throttling; the call may be retried.
    #[error("erp rate limited: {0}")]
    RateLimited(String),

    /// The configured deadline elapsed before a response arrived.
    #[error("erp deadline exceeded after {0:?}")]
    Deadline(Duration),

    /// The ERP rejected the request; retrying will not help.
    #[error("erp remote fault: {0}")]
    Remote(String),

    /// The response did not have the expected shape.
    #[error("erp malformed response: {0}")]
    Malformed(String),
}

impl ErpError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErpError::Transport(_) | ErpError::RateLimited(_) | ErpError::Deadline(_)
        )
    }
}

pub type ErpResult<T> = Result<T, ErpError>;

/// Uniform data-access port over the ERP. `fields` as an empty slice means
/// "all fields"; many-to-one values come back as `[id, display_name]` pairs.
#[async_trait]
pub trait ErpClient: Send + Sync {
    async fn search(&self, model: &str, domain: &Domain, limit: Option<usize>)
        -> ErpResult<Vec<i64>>;

    async fn read(&self, model: &str, id: i64, fields: &[&str])
        -> ErpResult<Map<String, Value>>;

    async fn search_read(
        &self,
        model: &str,
        domain: &Domain,
        fields: &[&str],
        limit: Option<usize>,
        order: Option<&str>,
    ) -> ErpResult<Vec<Map<String, Value>>>;

    async fn search_count(&self, model: &str, domain: &Domain) -> ErpResult<i64>;

    async fn create(&self, model: &str, values: Map<String, Value>) -> ErpResult<i64>;

    async fn write(&self, model: &str, ids: &[i64], values: Map<String, Value>)
        -> ErpResult<bool>;

    async fn execute_method(
        &self,
        model: &str,
        method: &str,
        ids: &[i64],
        args: Vec<Value>,
    ) -> ErpResult<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErpConfig {
    pub url: String,
    pub database: String,
    pub username: String,
    pub api_key: String,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

fn default_deadline_secs() -> u64 {
    30
}

/// JSON-RPC `call_kw` client for an Odoo-style ERP.
pub struct JsonRpcErp {
    http: Client,
    config: ErpConfig,
    uid: tokio::sync::Mutex<Option<i64>>,
}

impl JsonRpcErp {
    pub fn new(config: ErpConfig) -> Self {
        Self {
            http: Client::new(),
            config,
            uid: tokio::sync::Mutex::new(None),
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.config.deadline_secs)
    }

    async fn authenticate(&self) -> ErpResult<i64> {
        let mut uid_guard = self.uid.lock().await;
        if let Some(uid) = *uid_guard {
            return Ok(uid);
        }
        let result = self
            .rpc(
                "common",
                "authenticate",
                json!([
                    self.config.database,
                    self.config.username,
                    self.config.api_key,
                    {}
                ]),
            )
            .await?;
        let uid = result
            .as_i64()
            .ok_or_else(|| ErpError::Remote("authentication rejected".to_string()))?;
        *uid_guard = Some(uid);
        Ok(uid)
    }

    async fn rpc(&self, service: &str, method: &str, args: Value) -> ErpResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": service,
                "method": method,
                "args": args,
            },
            "id": 1,
        });

        let request = self
            .http
            .post(format!("{}/jsonrpc", self.config.url.trim_end_matches('/')))
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.deadline(), request)
            .await
            .map_err(|_| ErpError::Deadline(self.deadline()))?
            .map_err(|e| ErpError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ErpError::RateLimited(status.to_string()));
        }
        if status.is_server_error() {
            return Err(ErpError::Transport(format!("server error: {status}")));
        }
        if status.is_client_error() {
            return Err(ErpError::Remote(format!("client error: {status}")));
        }

        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ErpError::Malformed(e.to_string()))?;

        if let Some(error) = envelope.get("error") {
            let message = error
                .get("data")
                .and_then(|d| d.get("message"))
                .or_else(|| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown erp fault");
            return Err(ErpError::Remote(message.to_string()));
        }

        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| ErpError::Malformed("missing result".to_string()))
    }

    async fn call_kw(&self, model: &str, method: &str, args: Value, kwargs: Value) -> ErpResult<Value> {
        let uid = self.authenticate().await?;
        self.rpc(
            "object",
            "execute_kw",
            json!([
                self.config.database,
                uid,
                self.config.api_key,
                model,
                method,
                args,
                kwargs,
            ]),
        )
        .await
    }
}

fn fields_kwarg(fields: &[&str]) -> Value {
    if fields.is_empty() {
        json!({})
    } else {
        json!({ "fields": fields })
    }
}

#[async_trait]
impl ErpClient for JsonRpcErp {
    async fn search(
        &self,
        model: &str,
        domain: &Domain,
        limit: Option<usize>,
    ) -> ErpResult<Vec<i64>> {
        let kwargs = match limit {
            Some(n) => json!({ "limit": n }),
            None => json!({}),
        };
        let result = self
            .call_kw(model, "search", json!([domain.to_json()]), kwargs)
            .await?;
        result
            .as_array()
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .ok_or_else(|| ErpError::Malformed("search returned non-list".to_string()))
    }

    async fn read(&self, model: &str, id: i64, fields: &[&str]) -> ErpResult<Map<String, Value>> {
        let result = self
            .call_kw(model, "read", json!([[id]]), fields_kwarg(fields))
            .await?;
        let records = result
            .as_array()
            .ok_or_else(|| ErpError::Malformed("read returned non-list".to_string()))?;
        let first = records
            .first()
            .ok_or_else(|| ErpError::Remote(format!("{model} record {id} not found")))?;
        first
            .as_object()
            .cloned()
            .ok_or_else(|| ErpError::Malformed("read returned non-object record".to_string()))
    }

    async fn search_read(
        &self,
        model: &str,
        domain: &Domain,
        fields: &[&str],
        limit: Option<usize>,
        order: Option<&str>,
    ) -> ErpResult<Vec<Map<String, Value>>> {
        let mut kwargs = match fields_kwarg(fields) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Some(n) = limit {
            kwargs.insert("limit".to_string(), json!(n));
        }
        if let Some(o) = order {
            kwargs.insert("order".to_string(), json!(o));
        }
        let result = self
            .call_kw(
                model,
                "search_read",
                json!([domain.to_json()]),
                Value::Object(kwargs),
            )
            .await?;
        let records = result
            .as_array()
            .ok_or_else(|| ErpError::Malformed("search_read returned non-list".to_string()))?;
        records
            .iter()
            .map(|r| {
                r.as_object()
                    .cloned()
                    .ok_or_else(|| ErpError::Malformed("non-object record".to_string()))
            })
            .collect()
    }

    async fn search_count(&self, model: &str, domain: &Domain) -> ErpResult<i64> {
        let result = self
            .call_kw(model, "search_count", json!([domain.to_json()]), json!({}))
            .await?;
        result
            .as_i64()
            .ok_or_else(|| ErpError::Malformed("search_count returned non-int".to_string()))
    }

    async fn create(&self, model: &str, values: Map<String, Value>) -> ErpResult<i64> {
        let result = self
            .call_kw(model, "create", json!([values]), json!({}))
            .await?;
        result
            .as_i64()
            .ok_or_else(|| ErpError::Malformed("create returned non-int id".to_string()))
    }

    async fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: Map<String, Value>,
    ) -> ErpResult<bool> {
        let result = self
            .call_kw(model, "write", json!([ids, values]), json!({}))
            .await?;
        Ok(result.as_bool().unwrap_or(true))
    }

    async fn execute_method(
        &self,
        model: &str,
        method: &str,
        ids: &[i64],
        args: Vec<Value>,
    ) -> ErpResult<Value> {
        let mut call_args = vec![json!(ids)];
        call_args.extend(args);
        self.call_kw(model, method, Value::Array(call_args), json!({}))
            .await
    }
}
