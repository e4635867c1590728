// Minimal provider doubles for orchestrator-level tests.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use relay_providers::{
    Domain, ErpClient, ErpError, ErpResult, LlmAnalysis, LlmClient, LlmMessage, LlmResult, ToolSpec,
};

pub struct NullErp;

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

pub struct NullLlm;

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
