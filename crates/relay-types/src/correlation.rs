use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id minted at webhook intake and threaded through the event
/// record, log lines, and the intake outcome so one inbound event's
/// processing can be traced end to end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn serializes_as_a_plain_string() {
        let id = CorrelationId::from("evt-123".to_string());
        assert_eq!(serde_json::to_value(&id).unwrap(), serde_json::json!("evt-123"));
        let parsed: CorrelationId = serde_json::from_str("\"evt-123\"").unwrap();
        assert_eq!(parsed, id);
    }
}
