use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use relay_types::EventType;

use crate::result::AutomationResult;

/// Everything a handler sees about one ERP change event.
#[derive(Debug, Clone)]
pub struct EventCtx {
    pub event_type: EventType,
    pub model: String,
    pub record_id: i64,
    pub values: Map<String, Value>,
    pub old_values: Map<String, Value>,
}

impl EventCtx {
    pub fn new(event_type: EventType, model: &str, record_id: i64) -> Self {
        Self {
            event_type,
            model: model.to_string(),
            record_id,
            values: Map::new(),
            old_values: Map::new(),
        }
    }

    pub fn with_values(mut self, values: Map<String, Value>) -> Self {
        self.values = values;
        self
    }
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<AutomationResult>>;

/// A registered function handle: no name-based dispatch, just a table entry.
pub type Handler = Arc<dyn Fn(EventCtx) -> HandlerFuture + Send + Sync>;

/// Wrap an `Arc<A>` method into a registrable handler handle.
pub fn handler<A, F, Fut>(automation: &Arc<A>, f: F) -> Handler
where
    A: Send + Sync + 'static,
    F: Fn(Arc<A>, EventCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AutomationResult>> + Send + 'static,
{
    let automation = Arc::clone(automation);
    Arc::new(move |ctx| Box::pin(f(Arc::clone(&automation), ctx)))
}

/// Handler registration table for one automation. Resolution order: the
/// exact (event_type, model) key first, then the event_type-only fallback.
#[derive(Default, Clone)]
pub struct HandlerTable {
    exact: HashMap<(EventType, String), Handler>,
    generic: HashMap<EventType, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, event_type: EventType, model: &str, handler: Handler) -> Self {
        self.exact.insert((event_type, model.to_string()), handler);
        self
    }

    pub fn on_any(mut self, event_type: EventType, handler: Handler) -> Self {
        self.generic.insert(event_type, handler);
        self
    }

    pub fn resolve(&self, event_type: EventType, model: &str) -> Option<Handler> {
        self.exact
            .get(&(event_type, model.to_string()))
            .or_else(|| self.generic.get(&event_type))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.generic.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl Probe {
        async fn specific(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
            Ok(AutomationResult::ok("specific", &ctx.model, ctx.record_id))
        }

        async fn generic(self: Arc<Self>, ctx: EventCtx) -> anyhow::Result<AutomationResult> {
            Ok(AutomationResult::ok("generic", &ctx.model, ctx.record_id))
        }
    }

    fn table() -> HandlerTable {
        let probe = Arc::new(Probe);
        HandlerTable::new()
            .on(
                EventType::Create,
                "account.move",
                handler(&probe, |a, ctx| a.specific(ctx)),
            )
            .on_any(EventType::Write, handler(&probe, |a, ctx| a.generic(ctx)))
    }

    #[tokio::test]
    async fn exact_key_wins_over_generic() {
        let table = table();
        let h = table.resolve(EventType::Create, "account.move").unwrap();
        let result = h(EventCtx::new(EventType::Create, "account.move", 1))
            .await
            .unwrap();
        assert_eq!(result.action, "specific");
    }

    #[tokio::test]
    async fn generic_fallback_applies_to_any_model() {
        let table = table();
        let h = table.resolve(EventType::Write, "crm.lead").unwrap();
        let result = h(EventCtx::new(EventType::Write, "crm.lead", 2)).await.unwrap();
        assert_eq!(result.action, "generic");
    }

    #[test]
    fn unresolved_event_returns_none() {
        let table = table();
        assert!(table.resolve(EventType::Unlink, "account.move").is_none());
        assert!(table.resolve(EventType::Create, "res.partner").is_none());
    }
}
