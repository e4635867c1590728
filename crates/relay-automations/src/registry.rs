use std::collections::HashSet;
use std::sync::Arc;

use relay_types::AutomationType;

use crate::automation::Automation;
use crate::handler::HandlerTable;

/// An automation plus its pre-built handler table and watched-model set.
pub struct RegisteredAutomation {
    pub automation: Arc<dyn Automation>,
    pub handlers: HandlerTable,
    pub models: HashSet<String>,
}

/// Read-mostly registry populated from a static list at startup; nothing
/// registers itself as an import side effect.
#[derive(Default)]
pub struct AutomationRegistry {
    entries: Vec<RegisteredAutomation>,
}

impl AutomationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, automation: Arc<dyn Automation>) {
        let handlers = Arc::clone(&automation).handlers();
        let models = automation.watched_models().into_iter().collect();
        self.entries.push(RegisteredAutomation {
            automation,
            handlers,
            models,
        });
    }

    pub fn watching(&self, model: &str) -> Vec<&RegisteredAutomation> {
        self.entries
            .iter()
            .filter(|entry| entry.models.contains(model))
            .collect()
    }

    pub fn by_type(&self, automation_type: AutomationType) -> Option<&RegisteredAutomation> {
        self.entries
            .iter()
            .find(|entry| entry.automation.automation_type() == automation_type)
    }

    pub fn all(&self) -> &[RegisteredAutomation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
